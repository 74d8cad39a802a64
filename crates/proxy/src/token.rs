//! Signed auth tokens for upstream handshakes
//!
//! A token binds the client IP to the moment the connection was attempted:
//!
//! ```text
//! base64url_nopad("<ip>|<timestamp_ms>|<hex(hmac_sha256(secret, "<ip>|<timestamp_ms>"))>")
//! ```
//!
//! The token rides in `Sec-WebSocket-Protocol` and is validated by the
//! upstream out of band.

use crate::error::ProxyError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// Keyed signing primitive used by [`TokenIssuer`]
pub trait Signer: Send + Sync {
    fn sign(&self, data: &[u8]) -> Vec<u8>;

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        self.sign(data) == signature
    }
}

/// HMAC-SHA256 signer
pub struct HmacSigner {
    key: Vec<u8>,
}

impl HmacSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length
        HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size")
    }
}

impl Signer for HmacSigner {
    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = self.mac();
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let mut mac = self.mac();
        mac.update(data);
        mac.verify_slice(signature).is_ok()
    }
}

/// Decoded token contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub ip: String,
    pub timestamp_ms: i64,
    pub signature: Vec<u8>,
}

impl TokenClaims {
    /// Check the signature against `signer`
    pub fn verify(&self, signer: &dyn Signer) -> bool {
        signer.verify(signing_input(&self.ip, self.timestamp_ms).as_bytes(), &self.signature)
    }
}

/// Mints tokens with the server-held secret
#[derive(Clone)]
pub struct TokenIssuer {
    signer: Option<Arc<dyn Signer>>,
}

impl TokenIssuer {
    /// Issuer backed by HMAC-SHA256. A missing secret yields an issuer that
    /// fails every request with [`ProxyError::Misconfigured`].
    pub fn from_secret(secret: Option<&str>) -> Self {
        Self {
            signer: secret
                .filter(|s| !s.is_empty())
                .map(|s| Arc::new(HmacSigner::new(s)) as Arc<dyn Signer>),
        }
    }

    pub fn with_signer(signer: Arc<dyn Signer>) -> Self {
        Self {
            signer: Some(signer),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.signer.is_some()
    }

    pub fn ensure_configured(&self) -> Result<(), ProxyError> {
        if self.is_configured() {
            Ok(())
        } else {
            Err(ProxyError::Misconfigured)
        }
    }

    /// Mint a token for `ip` stamped with the current time
    pub fn issue(&self, ip: &str) -> Result<String, ProxyError> {
        self.issue_at(ip, Utc::now().timestamp_millis())
    }

    pub fn issue_at(&self, ip: &str, timestamp_ms: i64) -> Result<String, ProxyError> {
        let signer = self.signer.as_ref().ok_or(ProxyError::Misconfigured)?;
        let data = signing_input(ip, timestamp_ms);
        let signature = signer.sign(data.as_bytes());
        let token = format!("{}|{}", data, hex::encode(signature));
        Ok(URL_SAFE_NO_PAD.encode(token))
    }
}

fn signing_input(ip: &str, timestamp_ms: i64) -> String {
    format!("{}|{}", ip, timestamp_ms)
}

/// Decode a token into its claims without verifying the signature.
///
/// The IP is taken from everything before the last two separators, so IPv6
/// addresses survive intact.
pub fn decode(token: &str) -> Option<TokenClaims> {
    let raw = URL_SAFE_NO_PAD.decode(token).ok()?;
    let text = String::from_utf8(raw).ok()?;
    let mut parts = text.rsplitn(3, '|');
    let signature = hex::decode(parts.next()?).ok()?;
    let timestamp_ms = parts.next()?.parse().ok()?;
    let ip = parts.next()?.to_string();
    Some(TokenClaims {
        ip,
        timestamp_ms,
        signature,
    })
}
