//! Raw HTTP/1.1 responses written before a socket is upgraded

use crate::error::ProxyError;
use http::StatusCode;
use std::fmt::Write as _;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

/// Plain-text rejection that closes the connection
pub fn error_response(status: StatusCode, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
        body
    )
}

/// `Set-Cookie` value recording the backend that served this client
pub fn affinity_cookie(name: &str, backend: &str) -> String {
    format!("{}={}; Path=/; Secure; HttpOnly; SameSite=None", name, backend)
}

/// The 101 that completes the client-side handshake
#[derive(Debug, Clone, Default)]
pub struct SwitchingProtocols<'a> {
    pub websocket_key: &'a str,
    pub protocol: Option<&'a str>,
    pub set_cookie: Option<String>,
}

impl SwitchingProtocols<'_> {
    pub fn render(&self) -> String {
        let mut out = String::from(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n",
        );
        let _ = write!(
            out,
            "Sec-WebSocket-Accept: {}\r\n",
            derive_accept_key(self.websocket_key.as_bytes())
        );
        if let Some(protocol) = self.protocol {
            let _ = write!(out, "Sec-WebSocket-Protocol: {}\r\n", protocol);
        }
        if let Some(cookie) = &self.set_cookie {
            let _ = write!(out, "Set-Cookie: {}\r\n", cookie);
        }
        out.push_str("\r\n");
        out
    }
}

/// Write the rejection for `err` and shut the write half down
pub async fn write_error<S>(stream: &mut S, err: &ProxyError) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(error_response(err.status(), err.body()).as_bytes())
        .await?;
    stream.flush().await?;
    stream.shutdown().await
}

pub async fn write_switching_protocols<S>(
    stream: &mut S,
    response: &SwitchingProtocols<'_>,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(response.render().as_bytes()).await?;
    stream.flush().await
}
