//! Relay configuration

use std::time::Duration;

/// Configurable parameters for the relay, immutable after startup.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Max requests to queue for a session that has not yet sent Ready.
    pub max_pending_queue: usize,
    /// Max time a request may wait in the pre-ready queue.
    pub pending_queue_ttl: Duration,
    /// The relay's own domain. Requests for this host (or loopback hosts)
    /// that match no tunnel fall through to the static site instead of a 502.
    pub base_domain: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_pending_queue: 100,
            pending_queue_ttl: Duration::from_secs(5),
            base_domain: None,
        }
    }
}
