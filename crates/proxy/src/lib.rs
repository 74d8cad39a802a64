//! shellgate-proxy: WebSocket gateway for shellgate
//!
//! Accepts browser upgrade requests, picks a backend from a fixed allow-list
//! (honouring sticky preferences), attaches a signed client token, fails over
//! across candidates and relays messages in both directions. Served by
//! Cloudflare's Pingora framework.

pub mod access_log;
pub mod allowlist;
pub mod error;
pub mod gateway;
pub mod guard;
pub mod metrics;
pub mod relay;
pub mod request;
pub mod response;
pub mod route;
pub mod selector;
pub mod service;
pub mod sticky;
pub mod token;
pub mod upstream;

pub use access_log::{AccessLogEntry, AccessLogger, LogFormat};
pub use allowlist::{AllowList, BACKENDS};
pub use error::*;
pub use gateway::{Gateway, Outcome};
pub use guard::AccessGuard;
pub use metrics::{metrics, wait_for_sessions_drain, MetricsRegistry, SessionGuard};
pub use relay::{RelayEnd, RelayPolicy, RelaySession};
pub use request::{InboundConnection, RequestHead};
pub use route::{Route, RouteClass};
pub use selector::BackendSelector;
pub use service::{gateway_service, GatewayService};
pub use sticky::{normalize_host, resolve_sticky};
pub use token::{HmacSigner, Signer, TokenClaims, TokenIssuer};
pub use upstream::{Dialer, TcpDialer, UpstreamConnector};
