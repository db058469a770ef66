//! Error types for the switchboard core.
//!
//! Only misuse-class failures are surfaced as `Result::Err`. Capacity
//! exhaustion and shutdown-in-progress are delivered asynchronously as a
//! posted completion with `success = false` (see [`crate::server`]), never as
//! an error return, matching the original source's split between synchronous
//! status codes and asynchronous completion failures.

use thiserror::Error;

/// Result type for switchboard operations.
pub type Result<T> = std::result::Result<T, SwitchboardError>;

/// Errors the switchboard core originates synchronously.
#[derive(Debug, Error)]
pub enum SwitchboardError {
    /// The completion queue passed as `cq_for_notification` was never
    /// registered with this server via [`crate::server::Server::register_completion_queue`].
    #[error("completion queue is not a registered server completion queue")]
    NotServerCompletionQueue,

    /// `destroy` was called before shutdown completed for a server that still
    /// has listeners.
    #[error("server destroyed before shutdown completed")]
    ShutdownIncomplete,

    /// `register_method` was called with an empty method string.
    #[error("method string cannot be empty")]
    EmptyMethod,

    /// `register_method` was called with a `(method, host)` pair that is
    /// already registered.
    #[error("duplicate registration for {method}@{host}", host = .host.as_deref().unwrap_or("*"))]
    DuplicateRegistration { method: String, host: Option<String> },

    /// `register_completion_queue` or `register_method` was called after
    /// [`crate::server::Server::start`] — both are build-time-only calls in
    /// the original, asserted against `server->started`.
    #[error("server already started")]
    AlreadyStarted,
}
