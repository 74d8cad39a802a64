//! Process-wide gateway counters
//!
//! Plain atomics shared by every connection. Nothing here feeds backend
//! selection; the counters exist for logging and shutdown draining.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Global metrics registry
pub struct MetricsRegistry {
    /// Upgrade requests received
    pub requests_total: Counter,
    /// Responses by status code
    pub requests_by_status: CounterVec,
    /// Requests by route class
    pub requests_by_route: CounterVec,
    /// Upstream handshake attempts
    pub upstream_attempts: Counter,
    /// Upstream handshakes that failed
    pub upstream_failures: Counter,
    /// Relay sessions currently open
    pub active_sessions: Gauge,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            requests_total: Counter::new(),
            requests_by_status: CounterVec::new(),
            requests_by_route: CounterVec::new(),
            upstream_attempts: Counter::new(),
            upstream_failures: Counter::new(),
            active_sessions: Gauge::new(),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Simple atomic counter
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter with labels
pub struct CounterVec {
    values: RwLock<HashMap<String, u64>>,
}

impl CounterVec {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
        }
    }

    pub fn inc(&self, label: &str) {
        let mut values = self.values.write();
        *values.entry(label.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, label: &str) -> u64 {
        self.values.read().get(label).copied().unwrap_or(0)
    }
}

impl Default for CounterVec {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauge that can go up and down
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        // Saturate at zero
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts an open relay session for as long as it lives
pub struct SessionGuard(());

impl SessionGuard {
    pub fn open() -> Self {
        metrics().active_sessions.inc();
        Self(())
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        metrics().active_sessions.dec();
    }
}

static METRICS: once_cell::sync::Lazy<Arc<MetricsRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(MetricsRegistry::new()));

/// Get the global metrics registry
pub fn metrics() -> &'static Arc<MetricsRegistry> {
    &METRICS
}

/// Wait for open sessions to drain (with timeout).
/// Returns true if all sessions closed, false on timeout.
pub fn wait_for_sessions_drain(timeout: Duration) -> bool {
    let start = Instant::now();
    let check_interval = Duration::from_millis(100);

    loop {
        let active = metrics().active_sessions.get();
        if active == 0 {
            return true;
        }

        if start.elapsed() >= timeout {
            tracing::warn!(
                active_sessions = active,
                "Grace period expired with open sessions"
            );
            return false;
        }

        std::thread::sleep(check_interval);
    }
}
