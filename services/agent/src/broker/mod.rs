//! Backend broker interface and registry.
//!
//! A broker drives one backend for one instance:
//! - Status inspection and endpoint lookup
//! - Idempotent start/stop/remove, each bounded by the instance's timeouts
//! - Diffing a new spec against the live backend into a [`ReconcilePlan`]
//!
//! Brokers are created through a [`BrokerRegistry`] keyed by backend kind.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::FleetError;
use crate::spec::InstanceSpec;

pub mod command;
pub mod docker;
mod mock;

pub use command::{CommandBroker, CommandBrokerFactory};
pub use docker::{DockerBroker, DockerBrokerFactory};
pub use mock::{BrokerCall, MockBroker, MockBrokerFactory, MockPlan};

/// Observed backend state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Stopped,
    Removed,
    Unknown,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Removed => "removed",
            InstanceStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Network endpoint of a backend, as handed to the routing proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendAddress {
    pub host: String,
    pub port: u16,
}

impl BackendAddress {
    /// Parse `host:port`. IPv6 hosts may be bracketed.
    pub fn parse(name: &str, address: Option<&str>) -> Result<Self, FleetError> {
        let no_address = |reason: String| FleetError::NoAddress {
            name: name.to_string(),
            reason,
        };

        let address = address.ok_or_else(|| no_address("address is not set".to_string()))?;
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| no_address(format!("expected host:port, got {address:?}")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| no_address(format!("invalid port number {port:?}")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(no_address(format!("missing host in {address:?}")));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Work produced by [`Broker::reconcile`], executed by [`Broker::apply_plan`].
#[derive(Debug, Clone)]
pub enum ReconcilePlan {
    /// Nothing to do; the broker may already have adopted the new spec.
    NoOp,

    /// Adopt the new settings without touching the running backend.
    UpdateBookkeeping(Arc<InstanceSpec>),

    /// Tear the backend down and rebuild it from the new spec.
    Recreate {
        spec: Arc<InstanceSpec>,
        was_running: bool,
    },
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        matches!(self, ReconcilePlan::NoOp)
    }

    /// Spec the plan converges toward, if any.
    pub fn spec(&self) -> Option<&Arc<InstanceSpec>> {
        match self {
            ReconcilePlan::NoOp => None,
            ReconcilePlan::UpdateBookkeeping(spec) => Some(spec),
            ReconcilePlan::Recreate { spec, .. } => Some(spec),
        }
    }

    /// Whether executing the plan interrupts a running backend.
    pub fn is_disruptive(&self) -> bool {
        matches!(self, ReconcilePlan::Recreate { .. })
    }
}

/// Backend driver for a single instance.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Backend kind this broker drives.
    fn kind(&self) -> &str;

    /// Current backend state. A missing backend is `Removed`, never an error.
    async fn status(&self) -> InstanceStatus;

    /// Endpoint the proxy should route to.
    fn address(&self) -> Result<BackendAddress, FleetError>;

    async fn is_running(&self) -> bool {
        self.status().await == InstanceStatus::Running
    }

    /// Start the backend and wait until it runs. Idempotent.
    async fn start_server(&self) -> Result<(), FleetError>;

    /// Stop the backend and wait until it is stopped. Idempotent.
    async fn stop_server(&self) -> Result<(), FleetError>;

    /// Stop, then delete backend resources. Mounted data is kept.
    async fn remove_server(&self) -> Result<(), FleetError>;

    /// Diff `spec` against the live backend.
    async fn reconcile(&self, spec: Arc<InstanceSpec>) -> Result<ReconcilePlan, FleetError>;

    /// Execute a plan previously returned by [`Broker::reconcile`].
    async fn apply_plan(&self, plan: ReconcilePlan) -> Result<(), FleetError>;
}

/// Builds brokers for one backend kind.
pub trait BrokerFactory: Send + Sync {
    fn create(&self, spec: Arc<InstanceSpec>) -> Result<Arc<dyn Broker>, FleetError>;
}

/// Backend kind to broker factory.
#[derive(Clone, Default)]
pub struct BrokerRegistry {
    factories: BTreeMap<String, Arc<dyn BrokerFactory>>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every driver compiled into the agent.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let command = Arc::new(CommandBrokerFactory);
        registry.register("docker", Arc::new(DockerBrokerFactory::new()));
        registry.register("cmd", command.clone());
        registry.register("jar", command);
        registry
    }

    /// Add or replace the factory for `kind`.
    pub fn register(&mut self, kind: impl Into<String>, factory: Arc<dyn BrokerFactory>) {
        self.factories.insert(kind.into(), factory);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn BrokerFactory>> {
        self.factories.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Create a broker for `spec` using the factory for its kind.
    pub fn create(&self, spec: Arc<InstanceSpec>) -> Result<Arc<dyn Broker>, FleetError> {
        let factory = self.get(spec.kind()).ok_or_else(|| {
            FleetError::Config(format!(
                "no broker registered for kind {:?} (instance {})",
                spec.kind(),
                spec.name
            ))
        })?;
        factory.create(spec)
    }
}

impl fmt::Debug for BrokerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Fail with `KindMismatch` unless `spec` has the broker's kind.
pub(crate) fn ensure_kind(broker_kind: &str, spec: &InstanceSpec) -> Result<(), FleetError> {
    if spec.kind() != broker_kind {
        return Err(FleetError::KindMismatch {
            expected: broker_kind.to_string(),
            actual: spec.kind().to_string(),
        });
    }
    Ok(())
}
