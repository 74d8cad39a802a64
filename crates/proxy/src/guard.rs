//! User-agent screening for inbound connections

use crate::error::ProxyError;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

static BOT_SIGNATURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)bot|crawler|spider|scraper").expect("bot pattern is valid"));

/// Rejects clients without a user-agent and known automation clients
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessGuard;

impl AccessGuard {
    pub fn check(&self, user_agent: Option<&str>, label: &str) -> Result<(), ProxyError> {
        let user_agent = match user_agent.map(str::trim).filter(|ua| !ua.is_empty()) {
            Some(ua) => ua,
            None => {
                warn!(label = %label, "Blocked: no User-Agent");
                return Err(ProxyError::Forbidden("missing user-agent".to_string()));
            }
        };

        if BOT_SIGNATURE.is_match(user_agent) {
            warn!(label = %label, user_agent = %user_agent, "Blocked: bot User-Agent");
            return Err(ProxyError::Forbidden("bot user-agent".to_string()));
        }

        Ok(())
    }
}
