//! Error types for the fleet agent.

use std::time::Duration;

use thiserror::Error;

use crate::broker::docker::DockerError;

/// Errors surfaced by brokers, instances and the fleet manager.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Unknown backend kind or malformed backend configuration.
    #[error("config error: {0}")]
    Config(String),

    /// A bounded wait (startup, shutdown, readiness) ran out of time.
    #[error("timeout after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    /// The backend driver failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// Operation refused because the instance is pinned.
    #[error("instance {0} is pinned")]
    Pinned(String),

    /// A spec for one backend kind was handed to a broker of another.
    #[error("backend kind mismatch: broker is {expected}, spec is {actual}")]
    KindMismatch { expected: String, actual: String },

    /// No instance with this name is managed.
    #[error("instance not found: {0}")]
    NotFound(String),

    /// The backend exited while it was expected to come up.
    #[error("instance {0} exited during startup")]
    Crashed(String),

    /// The backend reported a state the driver does not know how to handle.
    #[error("instance {name} is in unknown state {state:?}")]
    UnknownState { name: String, state: String },

    /// The instance stopped while waiting for it to become ready.
    #[error("instance {0} is not running")]
    NotRunning(String),

    /// No endpoint is configured, or it is malformed.
    #[error("no usable address for {name}: {reason}")]
    NoAddress { name: String, reason: String },
}

impl FleetError {
    /// Returns true for startup, shutdown and readiness timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, FleetError::Timeout { .. })
    }

    /// Short machine-readable code, used by the admin API.
    pub fn code(&self) -> &'static str {
        match self {
            FleetError::Config(_) => "config_error",
            FleetError::Timeout { .. } => "timeout",
            FleetError::Backend(_) => "backend_error",
            FleetError::Pinned(_) => "pinned",
            FleetError::KindMismatch { .. } => "kind_mismatch",
            FleetError::NotFound(_) => "not_found",
            FleetError::Crashed(_) => "crashed",
            FleetError::UnknownState { .. } => "unknown_state",
            FleetError::NotRunning(_) => "not_running",
            FleetError::NoAddress { .. } => "no_address",
        }
    }
}

impl From<DockerError> for FleetError {
    fn from(err: DockerError) -> Self {
        FleetError::Backend(err.to_string())
    }
}

impl<E: Into<FleetError>> From<warden_reconcile::ReconcileError<E>> for FleetError {
    fn from(err: warden_reconcile::ReconcileError<E>) -> Self {
        match err {
            warden_reconcile::ReconcileError::Timeout { resource, elapsed } => FleetError::Timeout {
                what: resource,
                elapsed,
            },
            warden_reconcile::ReconcileError::Aborted(e) => e.into(),
        }
    }
}
