//! Per-connection control flow: screen the upgrade request, pick a backend,
//! complete both handshakes and hand the pair to the relay.

use crate::access_log::{AccessLogEntry, AccessLogger};
use crate::allowlist::AllowList;
use crate::error::{ProxyError, Result};
use crate::guard::AccessGuard;
use crate::metrics::{metrics, SessionGuard};
use crate::relay::{send_probe_ping, RelayEnd, RelayPolicy, RelaySession};
use crate::request::{read_head, InboundConnection};
use crate::response::{affinity_cookie, write_error, write_switching_protocols, SwitchingProtocols};
use crate::route::{Route, RouteClass};
use crate::selector::BackendSelector;
use crate::sticky::resolve_sticky;
use crate::token::{Signer, TokenIssuer};
use crate::upstream::{Connected, Dialer, HandshakeParams, TcpDialer, UpstreamConnector};
use chrono::Utc;
use config::ProxyConfig;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Query parameter naming an explicit backend
pub const UPSTREAM_PARAM: &str = "up";
/// Query parameter marking a probe connection
pub const PROBE_PARAM: &str = "probe";

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// What happened to one inbound connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Status sent to the client, 0 if nothing was sent
    pub status: u16,
    pub route: Option<RouteClass>,
    pub backend: Option<String>,
    pub attempts: usize,
    pub relay: Option<RelayEnd>,
}

impl Outcome {
    fn silent() -> Self {
        Self {
            status: 0,
            route: None,
            backend: None,
            attempts: 0,
            relay: None,
        }
    }
}

/// Everything needed to serve connections; shared by all of them
pub struct Gateway {
    config: ProxyConfig,
    guard: AccessGuard,
    selector: BackendSelector,
    issuer: TokenIssuer,
    connector: UpstreamConnector,
    rng: Mutex<StdRng>,
    access_log: Option<AccessLogger>,
}

impl Gateway {
    pub fn new(config: ProxyConfig) -> Self {
        let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::from_config(&config));
        Self {
            guard: AccessGuard,
            selector: BackendSelector::new(AllowList::default(), config.max_attempts),
            issuer: TokenIssuer::from_secret(config.secret().as_deref()),
            connector: UpstreamConnector::new(&config, dialer),
            rng: Mutex::new(StdRng::from_entropy()),
            access_log: None,
            config,
        }
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.connector = UpstreamConnector::new(&self.config, dialer);
        self
    }

    /// Deterministic candidate shuffling
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.issuer = TokenIssuer::with_signer(signer);
        self
    }

    pub fn with_access_log(mut self, logger: AccessLogger) -> Self {
        self.access_log = Some(logger);
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Serve one raw client connection to completion
    pub async fn handle<S>(&self, mut stream: S) -> Outcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let started = Instant::now();
        let label = format!("conn-{}", NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed));

        let (head, leftover) = match read_head(&mut stream).await {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return Outcome::silent(),
            Err(e) => {
                debug!(label = %label, error = %e, "Unreadable request head");
                let status = e.status().as_u16();
                if let ProxyError::BadRequest(_) = e {
                    let _ = write_error(&mut stream, &e).await;
                    return Outcome {
                        status,
                        ..Outcome::silent()
                    };
                }
                return Outcome::silent();
            }
        };

        let conn = InboundConnection::from_head(&head, &self.config);
        let route = Route::from_path(&head.path);
        let probe = route.is_probe_path() && conn.has_query_param(PROBE_PARAM);

        metrics().requests_total.inc();
        metrics().requests_by_route.inc(route.class.as_str());
        info!(
            label = %label,
            ip = conn.client_ip.as_deref().unwrap_or("-"),
            country = %conn.country,
            path = %conn.path,
            route = %route.class,
            probe,
            "Upgrade request"
        );

        let mut outcome = Outcome {
            route: Some(route.class),
            ..Outcome::silent()
        };

        let mut connected = match self.negotiate(&conn, &route, &label).await {
            Ok(connected) => connected,
            Err(e) => {
                if let ProxyError::Exhausted { attempts } = e {
                    outcome.attempts = attempts;
                }
                outcome.status = e.status().as_u16();
                warn!(label = %label, status = outcome.status, error = %e, "Upgrade rejected");
                if let Err(io) = write_error(&mut stream, &e).await {
                    debug!(label = %label, error = %io, "Failed to write rejection");
                }
                self.record(&conn, &head.method, &route, &outcome, started);
                return outcome;
            }
        };

        outcome.backend = Some(connected.backend.clone());
        outcome.attempts = connected.attempts;

        if probe {
            send_probe_ping(&mut connected.socket, &label).await;
        }

        let set_cookie = (!route.class.is_restricted())
            .then(|| affinity_cookie(&self.config.affinity_cookie, &connected.backend));
        let response = SwitchingProtocols {
            websocket_key: conn.websocket_key.as_deref().unwrap_or_default(),
            protocol: conn.selected_protocol(),
            set_cookie,
        };
        if let Err(e) = write_switching_protocols(&mut stream, &response).await {
            warn!(label = %label, error = %e, "Client went away before upgrade");
            self.record(&conn, &head.method, &route, &outcome, started);
            if let Err(e) = connected.socket.close(None).await {
                debug!(label = %label, error = %e, "Upstream close after failed upgrade");
            }
            return outcome;
        }

        outcome.status = 101;
        info!(
            label = %label,
            backend = %connected.backend,
            attempts = connected.attempts,
            "Relay established"
        );
        self.record(&conn, &head.method, &route, &outcome, started);

        let policy = RelayPolicy {
            transactional: route.class.is_transactional(),
            probe_close: probe && conn.host_ends_with(&self.config.probe_host_suffix),
        };
        let client = WebSocketStream::from_partially_read(stream, leftover, Role::Server, None).await;

        let _session = SessionGuard::open();
        let end = RelaySession::new(client, connected.socket, policy, label.as_str())
            .run()
            .await;
        debug!(label = %label, ?end, "Relay finished");
        outcome.relay = Some(end);
        outcome
    }

    /// Run every check and the upstream failover loop. Nothing is written to
    /// the client here.
    async fn negotiate(
        &self,
        conn: &InboundConnection,
        route: &Route,
        label: &str,
    ) -> Result<Connected> {
        self.guard.check(conn.user_agent.as_deref(), label)?;
        self.issuer.ensure_configured()?;

        if !conn.wants_websocket || conn.websocket_key.is_none() {
            return Err(ProxyError::NotWebSocket);
        }

        let client_ip = conn.client_ip.as_deref().ok_or(ProxyError::MissingClientIp)?;

        let sticky = resolve_sticky(
            conn.query_param(UPSTREAM_PARAM),
            conn.cookie(&self.config.affinity_cookie),
            route.class,
        );
        let candidates = {
            let mut rng = self.rng.lock();
            self.selector.candidates(route.class, &sticky, &mut *rng)?
        };
        debug!(label = %label, sticky = %sticky, candidates = candidates.len(), "Candidates ready");

        let token = self.issuer.issue(client_ip)?;
        let params = HandshakeParams {
            route_path: &route.upstream_path,
            client_protocol: conn.selected_protocol(),
            token: route.class.attaches_token().then_some(token.as_str()),
            extensions: conn.extensions.as_deref(),
            origin: conn.origin.as_deref(),
        };

        self.connector.connect_first(&candidates, &params, label).await
    }

    fn record(
        &self,
        conn: &InboundConnection,
        method: &str,
        route: &Route,
        outcome: &Outcome,
        started: Instant,
    ) {
        metrics().requests_by_status.inc(&outcome.status.to_string());

        if let Some(logger) = &self.access_log {
            logger.log(&AccessLogEntry {
                timestamp: Utc::now(),
                client_ip: conn.client_ip.clone().unwrap_or_else(|| "-".to_string()),
                country: conn.country.clone(),
                method: method.to_string(),
                path: conn.path.clone(),
                route: route.class.as_str().to_string(),
                status: outcome.status,
                backend: outcome.backend.clone(),
                attempts: outcome.attempts,
                user_agent: conn.user_agent.clone().unwrap_or_default(),
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }
    }
}
