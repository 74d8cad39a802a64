//! Route classification for inbound upgrade requests

use std::fmt;

/// Prefix of game-server routes (restricted)
pub const GAME_PREFIX: &str = "/game/";
/// Prefix of the transactional services route
pub const SERVICES_PREFIX: &str = "/services";

const MATCHMAKER_PATH: &str = "/matchmaker/";
const SERVICES_PATH: &str = "/services/";

/// Route category of an inbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    Matchmaker,
    Services,
    Game,
}

impl RouteClass {
    /// Classify a request path. Anything unrecognized is matchmaker traffic.
    pub fn classify(path: &str) -> Self {
        if path.starts_with(GAME_PREFIX) {
            RouteClass::Game
        } else if path.starts_with(SERVICES_PREFIX) {
            RouteClass::Services
        } else {
            RouteClass::Matchmaker
        }
    }

    /// Sessions close after the first upstream reply
    pub fn is_transactional(self) -> bool {
        self == RouteClass::Services
    }

    /// Requires one explicit, validated backend; no fallback and no affinity cookie
    pub fn is_restricted(self) -> bool {
        self == RouteClass::Game
    }

    /// Whether the upstream handshake carries the signed token.
    ///
    /// Every route attaches it today.
    pub fn attaches_token(self) -> bool {
        true
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RouteClass::Matchmaker => "matchmaker",
            RouteClass::Services => "services",
            RouteClass::Game => "game",
        }
    }
}

impl fmt::Display for RouteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified request path together with the path forwarded upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub class: RouteClass,
    /// Path used in the upstream URL; never includes the query string
    pub upstream_path: String,
}

impl Route {
    pub fn from_path(path: &str) -> Self {
        let class = RouteClass::classify(path);
        let upstream_path = match class {
            RouteClass::Game => path.to_string(),
            RouteClass::Services => SERVICES_PATH.to_string(),
            RouteClass::Matchmaker => MATCHMAKER_PATH.to_string(),
        };
        Self { class, upstream_path }
    }

    /// The bare game route (`/game/`), the only path that accepts probes
    pub fn is_probe_path(&self) -> bool {
        self.class == RouteClass::Game && self.upstream_path == GAME_PREFIX
    }
}
