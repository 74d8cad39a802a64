//! Upstream WebSocket handshakes and sequential failover

use crate::error::{ProxyError, Result};
use crate::metrics::metrics;
use crate::request::MAX_HEAD_SIZE;
use async_trait::async_trait;
use config::ProxyConfig;
use http::HeaderValue;
use once_cell::sync::Lazy;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Live socket to a backend
pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client TLS for `wss` backends, verified against the webpki roots
static TLS_CONNECTOR: Lazy<std::result::Result<TlsConnector, rustls::Error>> = Lazy::new(|| {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
});

fn tls_connector() -> Result<TlsConnector> {
    TLS_CONNECTOR
        .as_ref()
        .map(Clone::clone)
        .map_err(|e| ProxyError::Internal(format!("TLS client setup failed: {}", e)))
}

/// Opens raw TCP connections to backends
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream>;
}

/// DNS-backed dialer with static overrides
pub struct TcpDialer {
    overrides: HashMap<String, SocketAddr>,
    timeout: Option<Duration>,
}

impl TcpDialer {
    pub fn from_config(config: &ProxyConfig) -> Self {
        let overrides = config
            .resolve
            .iter()
            .filter_map(|(host, addr)| match addr.parse() {
                Ok(addr) => Some((host.to_ascii_lowercase(), addr)),
                Err(e) => {
                    warn!(host = %host, addr = %addr, error = %e, "Ignoring invalid resolve override");
                    None
                }
            })
            .collect();

        Self {
            overrides,
            timeout: (config.connect_timeout_ms > 0)
                .then(|| Duration::from_millis(config.connect_timeout_ms)),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let connect = async {
            match self.overrides.get(&host.to_ascii_lowercase()) {
                Some(addr) => TcpStream::connect(*addr).await,
                None => TcpStream::connect((host, port)).await,
            }
        };

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?,
            None => connect.await,
        }
    }
}

/// Per-request handshake inputs shared by every candidate
#[derive(Debug, Clone, Default)]
pub struct HandshakeParams<'a> {
    pub route_path: &'a str,
    pub client_protocol: Option<&'a str>,
    pub token: Option<&'a str>,
    pub extensions: Option<&'a str>,
    pub origin: Option<&'a str>,
}

impl HandshakeParams<'_> {
    /// Subprotocols offered upstream: the client's choice, then the token
    pub fn protocols(&self) -> Vec<&str> {
        self.client_protocol.into_iter().chain(self.token).collect()
    }
}

/// A successful handshake
pub struct Connected {
    pub backend: String,
    pub socket: UpstreamSocket,
    pub attempts: usize,
}

/// Performs upstream handshakes, one candidate at a time
#[derive(Clone)]
pub struct UpstreamConnector {
    dialer: Arc<dyn Dialer>,
    scheme: String,
    port: u16,
    explicit_port: bool,
    forward_extensions: bool,
}

impl UpstreamConnector {
    pub fn new(config: &ProxyConfig, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            scheme: config.upstream_scheme.clone(),
            port: config.effective_upstream_port(),
            explicit_port: config.upstream_port.is_some(),
            forward_extensions: config.forward_extensions,
        }
    }

    pub fn url(&self, backend: &str, route_path: &str) -> String {
        if self.explicit_port {
            format!("{}://{}:{}{}", self.scheme, backend, self.port, route_path)
        } else {
            format!("{}://{}{}", self.scheme, backend, route_path)
        }
    }

    /// Build the upstream handshake request for `backend`
    pub fn build_request(&self, backend: &str, params: &HandshakeParams<'_>) -> Result<Request> {
        let url = self.url(backend, params.route_path);
        let mut request = url.into_client_request()?;
        let headers = request.headers_mut();

        let protocols = params.protocols();
        if !protocols.is_empty() {
            headers.insert("Sec-WebSocket-Protocol", header_value(&protocols.join(", "))?);
        }
        if self.forward_extensions {
            if let Some(ext) = params.extensions {
                headers.insert("Sec-WebSocket-Extensions", header_value(ext)?);
            }
        }
        if let Some(origin) = params.origin {
            headers.insert("Origin", header_value(origin)?);
        }

        Ok(request)
    }

    /// Attempt a single handshake
    pub async fn connect(&self, backend: &str, params: &HandshakeParams<'_>) -> Result<UpstreamSocket> {
        let request = self.build_request(backend, params)?;
        let tcp = self.dialer.dial(backend, self.port).await?;

        let mut stream = if self.scheme == "wss" {
            let name = ServerName::try_from(backend.to_string())
                .map_err(|e| ProxyError::Handshake(format!("invalid server name {:?}: {}", backend, e)))?;
            MaybeTlsStream::Rustls(tls_connector()?.connect(name, tcp).await?)
        } else {
            MaybeTlsStream::Plain(tcp)
        };

        let leftover = client_handshake(&mut stream, &request).await?;
        Ok(WebSocketStream::from_partially_read(stream, leftover, Role::Client, None).await)
    }

    /// Try `candidates` in order and return the first live socket.
    ///
    /// Every failure is logged and skipped. No delay between attempts and no
    /// concurrent attempts.
    pub async fn connect_first(
        &self,
        candidates: &[String],
        params: &HandshakeParams<'_>,
        label: &str,
    ) -> Result<Connected> {
        for (idx, backend) in candidates.iter().enumerate() {
            let attempt = idx + 1;
            info!(
                label = %label,
                attempt,
                url = %self.url(backend, params.route_path),
                "Upstream attempt"
            );
            metrics().upstream_attempts.inc();

            match self.connect(backend, params).await {
                Ok(socket) => {
                    return Ok(Connected {
                        backend: backend.clone(),
                        socket,
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    metrics().upstream_failures.inc();
                    warn!(label = %label, backend = %backend, attempt, error = %e, "Upstream handshake failed");
                }
            }
        }

        warn!(label = %label, attempts = candidates.len(), "All backends failed");
        Err(ProxyError::Exhausted {
            attempts: candidates.len(),
        })
    }
}

/// Run the client side of the upgrade on `stream`.
///
/// A 101 is accepted whether or not the backend selects one of the offered
/// subprotocols; a selected one must have been offered. Negotiated extensions
/// are refused since frames are relayed without decompression. Returns any
/// bytes read past the response head.
pub async fn client_handshake<S>(stream: &mut S, request: &Request) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = request
        .headers()
        .get("Sec-WebSocket-Key")
        .ok_or_else(|| ProxyError::Internal("request without Sec-WebSocket-Key".to_string()))?;
    let expected_accept = derive_accept_key(key.as_bytes());

    stream.write_all(&request_head(request)).await?;
    stream.flush().await?;

    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];
    let (status, headers, len) = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::Handshake("connection closed before response".to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut slots = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut slots);
        match response.parse(&buf) {
            Ok(httparse::Status::Complete(len)) => {
                let headers: Vec<(String, String)> = response
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_ascii_lowercase(),
                            String::from_utf8_lossy(h.value).trim().to_string(),
                        )
                    })
                    .collect();
                break (response.code.unwrap_or(0), headers, len);
            }
            Ok(httparse::Status::Partial) if buf.len() < MAX_HEAD_SIZE => continue,
            Ok(httparse::Status::Partial) => {
                return Err(ProxyError::Handshake("response head too large".to_string()))
            }
            Err(e) => return Err(ProxyError::Handshake(format!("malformed response: {}", e))),
        }
    };

    let header = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    };

    if status != 101 {
        return Err(ProxyError::Handshake(format!("status {}", status)));
    }
    if !header("upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket")) {
        return Err(ProxyError::Handshake("missing Upgrade: websocket".to_string()));
    }
    if header("sec-websocket-accept") != Some(expected_accept.as_str()) {
        return Err(ProxyError::Handshake("Sec-WebSocket-Accept mismatch".to_string()));
    }
    if header("sec-websocket-extensions").is_some_and(|v| !v.is_empty()) {
        return Err(ProxyError::Handshake("extensions negotiated".to_string()));
    }
    if let Some(selected) = header("sec-websocket-protocol") {
        let offered = request
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !offered.split(',').any(|p| p.trim() == selected) {
            return Err(ProxyError::Handshake(format!("unexpected subprotocol {:?}", selected)));
        }
    }

    debug!(protocol = ?header("sec-websocket-protocol"), "Upstream handshake complete");
    Ok(buf.split_off(len))
}

fn request_head(request: &Request) -> Vec<u8> {
    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut head = format!("GET {} HTTP/1.1\r\n", target).into_bytes();
    for (name, value) in request.headers() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| ProxyError::Internal(format!("invalid header value: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RefusingDialer;

    #[async_trait]
    impl Dialer for RefusingDialer {
        async fn dial(&self, _host: &str, _port: u16) -> io::Result<TcpStream> {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        }
    }

    fn connector(config: &ProxyConfig) -> UpstreamConnector {
        UpstreamConnector::new(config, Arc::new(RefusingDialer))
    }

    #[test]
    fn test_url_uses_route_path_only() {
        let c = connector(&ProxyConfig::default());
        assert_eq!(c.url("shellshock.io", "/game/ABC"), "wss://shellshock.io/game/ABC");

        let config = ProxyConfig {
            upstream_scheme: "ws".to_string(),
            upstream_port: Some(9000),
            ..ProxyConfig::default()
        };
        assert_eq!(connector(&config).url("yolk.best", "/services/"), "ws://yolk.best:9000/services/");
    }

    #[test]
    fn test_protocol_list_order() {
        let params = HandshakeParams {
            route_path: "/matchmaker/",
            client_protocol: Some("game-v2"),
            token: Some("tok"),
            ..Default::default()
        };
        assert_eq!(params.protocols(), vec!["game-v2", "tok"]);

        let params = HandshakeParams {
            token: Some("tok"),
            ..Default::default()
        };
        assert_eq!(params.protocols(), vec!["tok"]);
    }

    #[test]
    fn test_build_request_headers() {
        let c = connector(&ProxyConfig::default());
        let params = HandshakeParams {
            route_path: "/matchmaker/",
            client_protocol: Some("game-v2"),
            token: Some("abc123"),
            extensions: Some("permessage-deflate"),
            origin: Some("https://shellshock.io"),
        };
        let req = c.build_request("eggwars.io", &params).unwrap();

        assert_eq!(req.uri().to_string(), "wss://eggwars.io/matchmaker/");
        let h = req.headers();
        assert_eq!(h.get("sec-websocket-protocol").unwrap(), "game-v2, abc123");
        assert_eq!(h.get("sec-websocket-extensions").unwrap(), "permessage-deflate");
        assert_eq!(h.get("origin").unwrap(), "https://shellshock.io");
        assert_eq!(h.get("upgrade").unwrap(), "websocket");
    }

    #[test]
    fn test_extensions_can_be_withheld() {
        let config = ProxyConfig {
            forward_extensions: false,
            ..ProxyConfig::default()
        };
        let params = HandshakeParams {
            route_path: "/matchmaker/",
            extensions: Some("permessage-deflate"),
            ..Default::default()
        };
        let req = connector(&config).build_request("eggwars.io", &params).unwrap();
        assert!(req.headers().get("sec-websocket-extensions").is_none());
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let c = connector(&ProxyConfig::default());
        let candidates = vec!["yolk.best".to_string(), "eggwars.io".to_string()];
        let params = HandshakeParams {
            route_path: "/matchmaker/",
            token: Some("t"),
            ..Default::default()
        };
        let err = c.connect_first(&candidates, &params, "test").await.err().unwrap();
        assert!(matches!(err, ProxyError::Exhausted { attempts: 2 }));
        assert_eq!(err.status().as_u16(), 503);
    }

    #[tokio::test]
    async fn test_tcp_dialer_override() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut config = ProxyConfig::default();
        config.resolve.insert("Yolk.Best".to_string(), addr.to_string());
        let dialer = TcpDialer::from_config(&config);

        let stream = dialer.dial("yolk.best", 443).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    /// Read the upgrade request off the server half and answer with
    /// `reply(accept_key)`.
    async fn answer<F>(mut server: tokio::io::DuplexStream, reply: F) -> String
    where
        F: FnOnce(&str) -> Vec<u8>,
    {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = server.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed before sending a request");
            buf.extend_from_slice(&chunk[..n]);
        }
        let head = String::from_utf8(buf).unwrap();
        let key = head
            .lines()
            .find_map(|l| l.strip_prefix("sec-websocket-key: "))
            .map(str::trim)
            .unwrap();
        let accept = derive_accept_key(key.as_bytes());
        server.write_all(&reply(&accept)).await.unwrap();
        // keep the pipe open until the client is done reading
        tokio::time::sleep(Duration::from_millis(50)).await;
        head
    }

    fn switching(accept: &str, extra: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n{}\r\n",
            accept, extra
        )
        .into_bytes()
    }

    fn token_only_request() -> Request {
        let c = UpstreamConnector::new(
            &ProxyConfig {
                upstream_scheme: "ws".to_string(),
                ..ProxyConfig::default()
            },
            Arc::new(RefusingDialer),
        );
        let params = HandshakeParams {
            route_path: "/matchmaker/",
            token: Some("abc123"),
            ..Default::default()
        };
        c.build_request("eggwars.io", &params).unwrap()
    }

    #[tokio::test]
    async fn test_handshake_without_selected_protocol() {
        use futures_util::StreamExt;
        use tokio_tungstenite::tungstenite::Message;

        let (mut client, server) = tokio::io::duplex(4096);
        let backend = tokio::spawn(answer(server, |accept| {
            // 101 followed by an unmasked "hi" text frame in the same write
            let mut reply = switching(accept, "");
            reply.extend_from_slice(&[0x81, 0x02, b'h', b'i']);
            reply
        }));

        let request = token_only_request();
        let leftover = client_handshake(&mut client, &request).await.unwrap();
        assert_eq!(leftover, vec![0x81, 0x02, b'h', b'i']);

        let mut socket = WebSocketStream::from_partially_read(client, leftover, Role::Client, None).await;
        let msg = socket.next().await.unwrap().unwrap();
        assert_eq!(msg, Message::Text("hi".to_string()));

        let head = backend.await.unwrap();
        assert!(head.starts_with("GET /matchmaker/ HTTP/1.1\r\n"));
        assert!(head.contains("host: eggwars.io\r\n"));
        assert!(head.contains("sec-websocket-protocol: abc123\r\n"));
    }

    #[tokio::test]
    async fn test_handshake_accepts_offered_protocol() {
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(answer(server, |accept| switching(accept, "Sec-WebSocket-Protocol: abc123\r\n")));

        let leftover = client_handshake(&mut client, &token_only_request()).await.unwrap();
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_rejects_unoffered_protocol() {
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(answer(server, |accept| switching(accept, "Sec-WebSocket-Protocol: chat\r\n")));

        let err = client_handshake(&mut client, &token_only_request()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Handshake(_)));
    }

    #[tokio::test]
    async fn test_handshake_rejects_bad_accept() {
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(answer(server, |_| switching("bogus", "")));

        let err = client_handshake(&mut client, &token_only_request()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Handshake(_)));
    }

    #[tokio::test]
    async fn test_handshake_rejects_non_101() {
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(answer(server, |_| {
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec()
        }));

        let err = client_handshake(&mut client, &token_only_request()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Handshake(ref m) if m == "status 404"));
    }

    #[tokio::test]
    async fn test_handshake_rejects_negotiated_compression() {
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(answer(server, |accept| {
            switching(accept, "Sec-WebSocket-Extensions: permessage-deflate\r\n")
        }));

        let err = client_handshake(&mut client, &token_only_request()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Handshake(_)));
    }

    #[tokio::test]
    async fn test_handshake_backend_hangs_up() {
        let (mut client, server) = tokio::io::duplex(4096);
        drop(server);

        let err = client_handshake(&mut client, &token_only_request()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Handshake(_) | ProxyError::Io(_)));
    }
}
