//! Server tunables.

use std::time::Duration;

/// Settings that control the behavior of a [`crate::server::Server`].
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Upper bound on the number of outstanding request tickets across the
    /// *entire* server (unregistered matcher plus every registered method's
    /// matcher combined share one backing pool and freelist). Each
    /// individual matcher's lock-free ticket stack is still sized to this
    /// same bound, since in the worst case every outstanding ticket could be
    /// for a single method.
    pub max_requested_calls: usize,

    /// Minimum interval between consecutive "waiting for N channels and M
    /// listeners" shutdown-progress log lines.
    pub shutdown_log_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_requested_calls: 32768,
            shutdown_log_interval: Duration::from_secs(1),
        }
    }
}
