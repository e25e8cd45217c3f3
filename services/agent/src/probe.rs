//! Readiness probes and consumer notifications used by instances.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::broker::BackendAddress;

/// Decides whether a running backend accepts traffic yet.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// One probe attempt. `address` is `None` when the broker has no endpoint.
    async fn probe(&self, address: Option<&BackendAddress>) -> bool;
}

/// Ready once a TCP connection to the backend succeeds.
///
/// Backends without an address are ready as soon as they run.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    pub connect_timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn probe(&self, address: Option<&BackendAddress>) -> bool {
        let Some(address) = address else {
            return true;
        };
        let target = (address.host.as_str(), address.port);
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(address = %address, error = %e, "Readiness probe refused");
                false
            }
            Err(_) => {
                debug!(address = %address, "Readiness probe timed out");
                false
            }
        }
    }
}

/// Tells connected consumers about upcoming disruptions.
#[async_trait]
pub trait ConsumerNotifier: Send + Sync {
    /// `instance` restarts in `grace` to apply a new spec.
    async fn notify_restart(&self, instance: &str, consumers: &[String], grace: Duration);
}

/// Writes restart notices to the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl ConsumerNotifier for LogNotifier {
    async fn notify_restart(&self, instance: &str, consumers: &[String], grace: Duration) {
        if consumers.is_empty() {
            return;
        }
        info!(
            instance = %instance,
            consumers = ?consumers,
            grace_secs = grace.as_secs(),
            "Instance restarting to apply changes"
        );
    }
}
