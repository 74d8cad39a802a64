//! Inbound upgrade request parsing

use crate::error::{ProxyError, Result};
use config::ProxyConfig;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Largest request head accepted from a client
pub const MAX_HEAD_SIZE: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;

/// Parsed HTTP/1.1 request head
#[derive(Debug, Clone, Default)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    /// Header names are lower-cased; order and duplicates are preserved
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse a complete head. Returns `Ok(None)` when more bytes are needed,
    /// otherwise the head and the number of bytes it occupied.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let len = match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(ProxyError::BadRequest(e.to_string())),
        };

        let target = req.path.unwrap_or("/");
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (target, None),
        };

        let headers = req
            .headers
            .iter()
            .filter(|h| !h.name.is_empty())
            .map(|h| {
                (
                    h.name.to_ascii_lowercase(),
                    String::from_utf8_lossy(h.value).trim().to_string(),
                )
            })
            .collect();

        Ok(Some((
            Self {
                method: req.method.unwrap_or("").to_string(),
                path: if path.is_empty() { "/".to_string() } else { path.to_string() },
                query,
                headers,
            },
            len,
        )))
    }

    /// First value of a header, if present and non-empty
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read a request head from a raw client stream.
///
/// Returns `Ok(None)` when the client goes away before sending a complete
/// head. Bytes read past the head are returned alongside it.
pub async fn read_head<S>(stream: &mut S) -> Result<Option<(RequestHead, Vec<u8>)>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            debug!(received = buf.len(), "Client closed before sending a complete request");
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some((head, len)) = RequestHead::parse(&buf)? {
            let rest = buf.split_off(len);
            return Ok(Some((head, rest)));
        }

        if buf.len() >= MAX_HEAD_SIZE {
            return Err(ProxyError::BadRequest("request head too large".to_string()));
        }
    }
}

/// Decode `application/x-www-form-urlencoded` pairs. The first occurrence of
/// a key wins.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params
            .entry(decode_component(key))
            .or_insert_with(|| decode_component(value));
    }
    params
}

fn decode_component(s: &str) -> String {
    let spaced = s.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// Parse `Cookie` header values into a map. Later duplicates win.
pub fn parse_cookies<'a>(headers: impl IntoIterator<Item = &'a str>) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for header in headers {
        for part in header.split(';') {
            if let Some((key, value)) = part.split_once('=') {
                let key = key.trim();
                if !key.is_empty() {
                    cookies.insert(key.to_string(), value.trim().to_string());
                }
            }
        }
    }
    cookies
}

/// Immutable snapshot of an inbound connection, taken once at request entry
#[derive(Debug, Clone, Default)]
pub struct InboundConnection {
    pub client_ip: Option<String>,
    pub country: String,
    pub user_agent: Option<String>,
    pub host: Option<String>,
    pub path: String,
    pub query: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    /// Requested subprotocols in client preference order
    pub subprotocols: Vec<String>,
    pub extensions: Option<String>,
    pub origin: Option<String>,
    /// `Upgrade: websocket` was present
    pub wants_websocket: bool,
    pub websocket_key: Option<String>,
}

impl InboundConnection {
    pub fn from_head(head: &RequestHead, config: &ProxyConfig) -> Self {
        let subprotocols = head
            .header("sec-websocket-protocol")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            client_ip: head.header(&config.client_ip_header).map(str::to_string),
            country: head
                .header(&config.country_header)
                .unwrap_or("unknown")
                .to_string(),
            user_agent: head.header("user-agent").map(str::to_string),
            host: head.header("host").map(str::to_string),
            path: head.path.clone(),
            query: head.query.as_deref().map(parse_query).unwrap_or_default(),
            cookies: parse_cookies(head.header_values("cookie")),
            subprotocols,
            extensions: head.header("sec-websocket-extensions").map(str::to_string),
            origin: head.header("origin").map(str::to_string),
            wants_websocket: head
                .header("upgrade")
                .is_some_and(|v| v.eq_ignore_ascii_case("websocket")),
            websocket_key: head.header("sec-websocket-key").map(str::to_string),
        }
    }

    /// The client's preferred subprotocol, echoed back on upgrade
    pub fn selected_protocol(&self) -> Option<&str> {
        self.subprotocols.first().map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn has_query_param(&self, name: &str) -> bool {
        self.query.contains_key(name)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Request came in through a host ending with `suffix`
    pub fn host_ends_with(&self, suffix: &str) -> bool {
        !suffix.is_empty()
            && self
                .host
                .as_deref()
                .is_some_and(|h| h.to_ascii_lowercase().ends_with(&suffix.to_ascii_lowercase()))
    }
}
