//! Candidate backend ordering

use crate::allowlist::AllowList;
use crate::error::{ProxyError, Result};
use crate::route::RouteClass;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, error};

/// Default cap on upstream attempts per request
pub const DEFAULT_MAX_ATTEMPTS: usize = 30;

/// Builds the ordered list of backends to try for one request
#[derive(Debug, Clone, Copy)]
pub struct BackendSelector {
    allowlist: AllowList,
    max_attempts: usize,
}

impl Default for BackendSelector {
    fn default() -> Self {
        Self::new(AllowList::default(), DEFAULT_MAX_ATTEMPTS)
    }
}

impl BackendSelector {
    pub fn new(allowlist: AllowList, max_attempts: usize) -> Self {
        Self {
            allowlist,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn allowlist(&self) -> &AllowList {
        &self.allowlist
    }

    /// Ordered candidates for `route`, already truncated to the attempt cap.
    ///
    /// Restricted routes yield exactly the validated sticky host or fail with
    /// [`ProxyError::InvalidUpstream`]. Other routes yield the valid sticky
    /// host first followed by a shuffled copy of the allow-list without it.
    pub fn candidates<R: Rng + ?Sized>(
        &self,
        route: RouteClass,
        sticky: &str,
        rng: &mut R,
    ) -> Result<Vec<String>> {
        let sticky_valid = self.allowlist.is_valid_backend(sticky, route);

        if route.is_restricted() {
            if !sticky_valid {
                error!(route = %route, sticky = %sticky, "Missing or invalid ?up backend for game route");
                return Err(ProxyError::InvalidUpstream(sticky.to_string()));
            }
            return Ok(vec![sticky.to_string()]);
        }

        let mut candidates = Vec::with_capacity(self.allowlist.len() + 1);
        if sticky_valid {
            candidates.push(sticky.to_string());
            candidates.extend(shuffled(
                self.allowlist
                    .hosts()
                    .iter()
                    .filter(|host| !host.eq_ignore_ascii_case(sticky)),
                rng,
            ));
        } else {
            candidates.extend(shuffled(self.allowlist.hosts().iter(), rng));
        }

        candidates.truncate(self.max_attempts);
        debug!(
            route = %route,
            sticky = %sticky,
            sticky_valid,
            candidates = candidates.len(),
            "Built candidate list"
        );
        Ok(candidates)
    }
}

/// Uniform random permutation of a fresh copy
fn shuffled<'a, I, R>(hosts: I, rng: &mut R) -> Vec<String>
where
    I: Iterator<Item = &'a &'static str>,
    R: Rng + ?Sized,
{
    let mut copy: Vec<String> = hosts.map(|h| h.to_string()).collect();
    copy.shuffle(rng);
    copy
}
