//! Bidirectional message relay between a client and its upstream
//!
//! Two forwarding loops run under one `select!`. Whichever side closes
//! first ends both loops; its close code and reason are then handed to the
//! other side. Protocol-level ping/pong frames are answered per hop and never
//! forwarded.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::borrow::Cow;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

/// Text payloads from upstream that are swallowed instead of forwarded
pub const CONTROL_MESSAGES: &[&str] = &["ping", "pong"];

/// Message sent upstream when a probe connection is established
pub const PROBE_PING: &str = r#"{"command":"ping"}"#;

/// Session-level close behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayPolicy {
    /// Close both sides after the first upstream message reaches the client
    pub transactional: bool,
    /// Close both sides as soon as the session starts
    pub probe_close: bool,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEnd {
    ClientClosed(Option<CloseFrame<'static>>),
    UpstreamClosed(Option<CloseFrame<'static>>),
    /// Transactional route delivered its reply
    Replied,
    /// Probe connection closed on purpose
    Probe,
}

enum UpstreamEvent {
    Closed(Option<CloseFrame<'static>>),
    Replied,
}

/// A live client/upstream pair
pub struct RelaySession<C, U> {
    client: WebSocketStream<C>,
    upstream: WebSocketStream<U>,
    policy: RelayPolicy,
    label: String,
}

impl<C, U> RelaySession<C, U>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        client: WebSocketStream<C>,
        upstream: WebSocketStream<U>,
        policy: RelayPolicy,
        label: impl Into<String>,
    ) -> Self {
        Self {
            client,
            upstream,
            policy,
            label: label.into(),
        }
    }

    /// Pump messages until either side closes, then close the other.
    pub async fn run(self) -> RelayEnd {
        let label = self.label;
        let (mut client_tx, mut client_rx) = self.client.split();
        let (mut upstream_tx, mut upstream_rx) = self.upstream.split();

        if self.policy.probe_close {
            info!(label = %label, "Probe connection, closing both sides");
            close_quietly(&mut client_tx, Some(normal_close("probe-ok"))).await;
            close_quietly(&mut upstream_tx, Some(normal_close("probe-ok"))).await;
            return RelayEnd::Probe;
        }

        let end = tokio::select! {
            frame = client_to_upstream(&mut client_rx, &mut upstream_tx) => RelayEnd::ClientClosed(frame),
            event = upstream_to_client(&mut upstream_rx, &mut client_tx, self.policy.transactional) => {
                match event {
                    UpstreamEvent::Closed(frame) => RelayEnd::UpstreamClosed(frame),
                    UpstreamEvent::Replied => RelayEnd::Replied,
                }
            }
        };

        match &end {
            RelayEnd::ClientClosed(frame) => {
                debug!(label = %label, ?frame, "Client closed, closing upstream");
                close_quietly(&mut upstream_tx, frame.clone()).await;
                finish(&mut client_tx).await;
            }
            RelayEnd::UpstreamClosed(frame) => {
                debug!(label = %label, ?frame, "Upstream closed, closing client");
                close_quietly(&mut client_tx, frame.clone()).await;
                finish(&mut upstream_tx).await;
            }
            RelayEnd::Replied => {
                debug!(label = %label, "Transactional reply delivered, closing both sides");
                close_quietly(&mut client_tx, Some(normal_close("ok"))).await;
                close_quietly(&mut upstream_tx, Some(normal_close("ok"))).await;
            }
            RelayEnd::Probe => {}
        }

        end
    }
}

/// Send the probe control message upstream. Failures are logged only.
pub async fn send_probe_ping<S>(upstream: &mut S, label: &str)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    if let Err(e) = upstream.send(Message::Text(PROBE_PING.to_string())).await {
        debug!(label = %label, error = %e, "Failed to send initial probe ping");
    }
}

pub fn is_control_message(msg: &Message) -> bool {
    matches!(msg, Message::Text(text) if CONTROL_MESSAGES.contains(&text.as_str()))
}

fn normal_close(reason: &'static str) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::Normal,
        reason: Cow::Borrowed(reason),
    }
}

/// Unconditional passthrough; returns the client's close frame
async fn client_to_upstream<R, W>(rx: &mut R, tx: &mut W) -> Option<CloseFrame<'static>>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(msg) = rx.next().await {
        match msg {
            Ok(Message::Close(frame)) => return frame,
            Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                if let Err(e) = tx.send(msg).await {
                    debug!(error = %e, "Dropped client message, upstream unavailable");
                }
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Client read error");
                return None;
            }
        }
    }
    None
}

/// Passthrough minus control messages. With `transactional`, returns after
/// the first forwarded message has been flushed to the client.
async fn upstream_to_client<R, W>(rx: &mut R, tx: &mut W, transactional: bool) -> UpstreamEvent
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(msg) = rx.next().await {
        match msg {
            Ok(Message::Close(frame)) => return UpstreamEvent::Closed(frame),
            Ok(msg) if is_control_message(&msg) => {}
            Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                if let Err(e) = tx.send(msg).await {
                    debug!(error = %e, "Dropped upstream message, client unavailable");
                }
                if transactional {
                    return UpstreamEvent::Replied;
                }
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Upstream read error");
                return UpstreamEvent::Closed(None);
            }
        }
    }
    UpstreamEvent::Closed(None)
}

/// Best-effort close; errors are swallowed
async fn close_quietly<W>(tx: &mut W, frame: Option<CloseFrame<'static>>)
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    if let Err(e) = tx.send(Message::Close(frame)).await {
        debug!(error = %e, "Close not delivered");
    }
}

/// Flush the automatic close reply owed to a peer that closed first
async fn finish<W>(tx: &mut W)
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    let _ = tx.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};
    use tokio_tungstenite::tungstenite::protocol::Role;

    type Ws = WebSocketStream<DuplexStream>;

    /// (proxy side, far side) of one hop
    async fn hop(far_role: Role) -> (Ws, Ws) {
        let (near, far) = duplex(64 * 1024);
        let near_role = match far_role {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        };
        (
            WebSocketStream::from_raw_socket(near, near_role, None).await,
            WebSocketStream::from_raw_socket(far, far_role, None).await,
        )
    }

    /// Spawn a relay and return (browser, backend, relay handle)
    async fn start(policy: RelayPolicy) -> (Ws, Ws, tokio::task::JoinHandle<RelayEnd>) {
        let (client, browser) = hop(Role::Client).await;
        let (upstream, backend) = hop(Role::Server).await;
        let handle = tokio::spawn(RelaySession::new(client, upstream, policy, "test").run());
        (browser, backend, handle)
    }

    async fn next_msg(ws: &mut Ws) -> Message {
        loop {
            let msg = ws.next().await.expect("stream open").expect("no error");
            if !matches!(msg, Message::Ping(_) | Message::Pong(_)) {
                return msg;
            }
        }
    }

    fn close_of(msg: Message) -> CloseFrame<'static> {
        match msg {
            Message::Close(Some(frame)) => frame,
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bidirectional_passthrough() {
        let (mut browser, mut backend, _relay) = start(RelayPolicy::default()).await;

        browser.send(Message::Text("hello".into())).await.unwrap();
        assert_eq!(next_msg(&mut backend).await, Message::Text("hello".into()));

        browser.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        assert_eq!(next_msg(&mut backend).await, Message::Binary(vec![1, 2, 3]));

        backend.send(Message::Text("world".into())).await.unwrap();
        assert_eq!(next_msg(&mut browser).await, Message::Text("world".into()));
    }

    #[tokio::test]
    async fn test_control_messages_swallowed_downstream_only() {
        let (mut browser, mut backend, _relay) = start(RelayPolicy::default()).await;

        backend.send(Message::Text("ping".into())).await.unwrap();
        backend.send(Message::Text("pong".into())).await.unwrap();
        backend.send(Message::Text("state".into())).await.unwrap();
        assert_eq!(next_msg(&mut browser).await, Message::Text("state".into()));

        // Client text "ping" is application data and goes through
        browser.send(Message::Text("ping".into())).await.unwrap();
        assert_eq!(next_msg(&mut backend).await, Message::Text("ping".into()));
    }

    #[tokio::test]
    async fn test_client_close_propagates() {
        let (mut browser, mut backend, relay) = start(RelayPolicy::default()).await;

        let frame = CloseFrame {
            code: CloseCode::Library(4001),
            reason: "bye".into(),
        };
        browser.send(Message::Close(Some(frame.clone()))).await.unwrap();

        assert_eq!(close_of(next_msg(&mut backend).await), frame);
        assert_eq!(relay.await.unwrap(), RelayEnd::ClientClosed(Some(frame)));
    }

    #[tokio::test]
    async fn test_upstream_close_propagates() {
        let (mut browser, mut backend, relay) = start(RelayPolicy::default()).await;

        let frame = CloseFrame {
            code: CloseCode::Away,
            reason: "restart".into(),
        };
        backend.send(Message::Close(Some(frame.clone()))).await.unwrap();

        assert_eq!(close_of(next_msg(&mut browser).await), frame);
        assert_eq!(relay.await.unwrap(), RelayEnd::UpstreamClosed(Some(frame)));
    }

    #[tokio::test]
    async fn test_transactional_closes_after_first_reply() {
        let policy = RelayPolicy {
            transactional: true,
            ..Default::default()
        };
        let (mut browser, mut backend, relay) = start(policy).await;

        browser.send(Message::Text("request".into())).await.unwrap();
        assert_eq!(next_msg(&mut backend).await, Message::Text("request".into()));

        // Control chatter does not count as the reply
        backend.send(Message::Text("pong".into())).await.unwrap();
        backend.send(Message::Text("response".into())).await.unwrap();

        assert_eq!(next_msg(&mut browser).await, Message::Text("response".into()));
        let frame = close_of(next_msg(&mut browser).await);
        assert_eq!(frame.code, CloseCode::Normal);
        assert_eq!(frame.reason, "ok");

        let frame = close_of(next_msg(&mut backend).await);
        assert_eq!(frame.code, CloseCode::Normal);
        assert_eq!(frame.reason, "ok");

        assert_eq!(relay.await.unwrap(), RelayEnd::Replied);
    }

    #[tokio::test]
    async fn test_probe_closes_immediately() {
        let policy = RelayPolicy {
            probe_close: true,
            ..Default::default()
        };
        let (mut browser, mut backend, relay) = start(policy).await;

        assert_eq!(close_of(next_msg(&mut browser).await).reason, "probe-ok");
        assert_eq!(close_of(next_msg(&mut backend).await).reason, "probe-ok");
        assert_eq!(relay.await.unwrap(), RelayEnd::Probe);
    }

    #[tokio::test]
    async fn test_probe_ping_message() {
        let (mut upstream, mut backend) = hop(Role::Server).await;
        send_probe_ping(&mut upstream, "test").await;
        assert_eq!(
            next_msg(&mut backend).await,
            Message::Text(r#"{"command":"ping"}"#.into())
        );
    }

    #[test]
    fn test_is_control_message() {
        assert!(is_control_message(&Message::Text("ping".into())));
        assert!(is_control_message(&Message::Text("pong".into())));
        assert!(!is_control_message(&Message::Text("PING".into())));
        assert!(!is_control_message(&Message::Binary(b"ping".to_vec())));
    }
}
