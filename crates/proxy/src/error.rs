//! Error types for the shellgate proxy

use http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Missing or automated user-agent
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// No signing secret is configured
    #[error("Server misconfigured: no HMAC secret")]
    Misconfigured,

    #[error("Expected WebSocket upgrade")]
    NotWebSocket,

    #[error("Unable to determine client IP")]
    MissingClientIp,

    /// Restricted route without a valid explicit backend
    #[error("Invalid upstream: {0:?}")]
    InvalidUpstream(String),

    #[error("Malformed request: {0}")]
    BadRequest(String),

    /// Upstream answered the upgrade with something other than a usable 101
    #[error("Upstream handshake failed: {0}")]
    Handshake(String),

    #[error("All backends failed after {attempts} attempts")]
    Exhausted { attempts: usize },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Status code reported to the client
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Forbidden(_) => StatusCode::FORBIDDEN,
            ProxyError::NotWebSocket => StatusCode::UPGRADE_REQUIRED,
            ProxyError::InvalidUpstream(_) | ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Handshake(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Exhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Misconfigured
            | ProxyError::MissingClientIp
            | ProxyError::Internal(_)
            | ProxyError::WebSocket(_)
            | ProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short plain-text body; never carries internal detail
    pub fn body(&self) -> &'static str {
        match self {
            ProxyError::Forbidden(_) => "Forbidden",
            ProxyError::Misconfigured => "Server misconfigured",
            ProxyError::NotWebSocket => "Expected WebSocket",
            ProxyError::MissingClientIp => "Unable to determine client IP",
            ProxyError::InvalidUpstream(_) => "Invalid upstream",
            ProxyError::BadRequest(_) => "Bad Request",
            ProxyError::Handshake(_) => "Bad gateway",
            ProxyError::Exhausted { .. } => "All backends failed",
            ProxyError::Internal(_) | ProxyError::WebSocket(_) | ProxyError::Io(_) => {
                "Internal server error"
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
