//! Pingora service wrapper around [`Gateway`]

use crate::gateway::Gateway;
use async_trait::async_trait;
use pingora_core::apps::ServerApp;
use pingora_core::protocols::Stream;
use pingora_core::server::ShutdownWatch;
use pingora_core::services::listening::Service;
use std::sync::Arc;
use tracing::{debug, info};

/// Raw-stream application: each accepted connection is one upgrade attempt
pub struct GatewayService {
    gateway: Arc<Gateway>,
}

impl GatewayService {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }
}

#[async_trait]
impl ServerApp for GatewayService {
    async fn process_new(
        self: &Arc<Self>,
        session: Stream,
        shutdown: &ShutdownWatch,
    ) -> Option<Stream> {
        let mut shutdown = shutdown.clone();
        tokio::select! {
            outcome = self.gateway.handle(session) => {
                debug!(status = outcome.status, backend = ?outcome.backend, "Connection finished");
            }
            _ = shutdown.changed() => {
                info!("Server shutting down, dropping connection");
            }
        }
        // Upgraded or rejected connections are never reused
        None
    }
}

/// Build a listening service; listeners are added by the caller
pub fn gateway_service(name: &str, gateway: Arc<Gateway>) -> Service<GatewayService> {
    Service::new(name.to_string(), GatewayService::new(gateway))
}
