//! Recording broker for tests and development.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tracing::info;

use super::{ensure_kind, BackendAddress, Broker, BrokerFactory, InstanceStatus, ReconcilePlan};
use crate::error::FleetError;
use crate::spec::InstanceSpec;

/// A call made against a [`MockBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Start,
    Stop,
    Remove,
    Reconcile,
    ApplyNoOp,
    ApplyUpdateBookkeeping,
    ApplyRecreate,
}

/// Forced outcome of [`MockBroker::reconcile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockPlan {
    NoOp,
    UpdateBookkeeping,
    Recreate,
}

struct MockBrokerState {
    status: InstanceStatus,
    address: Option<BackendAddress>,
    plan: Option<MockPlan>,
    start_delay: Duration,
    calls: Vec<BrokerCall>,
}

/// Broker that keeps its backend state in memory and records every call.
///
/// Without a forced plan, reconciling an identical spec yields
/// `UpdateBookkeeping` and any other spec yields `Recreate`.
pub struct MockBroker {
    name: String,
    kind: String,
    spec: ArcSwap<InstanceSpec>,
    fail_starts: AtomicBool,
    state: Mutex<MockBrokerState>,
}

impl MockBroker {
    pub fn new(spec: Arc<InstanceSpec>) -> Self {
        Self {
            name: spec.name.clone(),
            kind: spec.kind().to_string(),
            spec: ArcSwap::new(spec),
            fail_starts: AtomicBool::new(false),
            state: Mutex::new(MockBrokerState {
                status: InstanceStatus::Removed,
                address: None,
                plan: None,
                start_delay: Duration::ZERO,
                calls: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockBrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spec the broker currently operates on.
    pub fn spec(&self) -> Arc<InstanceSpec> {
        self.spec.load_full()
    }

    pub fn set_status(&self, status: InstanceStatus) {
        self.lock().status = status;
    }

    pub fn set_address(&self, address: BackendAddress) {
        self.lock().address = Some(address);
    }

    pub fn set_plan(&self, plan: MockPlan) {
        self.lock().plan = Some(plan);
    }

    pub fn set_start_delay(&self, delay: Duration) {
        self.lock().start_delay = delay;
    }

    pub fn fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls equal to `call`.
    pub fn count(&self, call: BrokerCall) -> usize {
        self.lock().calls.iter().filter(|c| **c == call).count()
    }

    fn record(&self, call: BrokerCall) {
        self.lock().calls.push(call);
    }
}

#[async_trait]
impl Broker for MockBroker {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn status(&self) -> InstanceStatus {
        self.lock().status
    }

    fn address(&self) -> Result<BackendAddress, FleetError> {
        self.lock()
            .address
            .clone()
            .ok_or_else(|| FleetError::NoAddress {
                name: self.name.clone(),
                reason: "address is not set".to_string(),
            })
    }

    async fn start_server(&self) -> Result<(), FleetError> {
        self.record(BrokerCall::Start);
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(FleetError::Backend(format!("[MOCK] {} failed to start", self.name)));
        }
        let delay = self.lock().start_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        info!(instance = %self.name, "[MOCK] Started");
        self.set_status(InstanceStatus::Running);
        Ok(())
    }

    async fn stop_server(&self) -> Result<(), FleetError> {
        self.record(BrokerCall::Stop);
        let mut state = self.lock();
        if state.status == InstanceStatus::Running {
            state.status = InstanceStatus::Stopped;
        }
        Ok(())
    }

    async fn remove_server(&self) -> Result<(), FleetError> {
        self.record(BrokerCall::Remove);
        self.set_status(InstanceStatus::Removed);
        Ok(())
    }

    async fn reconcile(&self, spec: Arc<InstanceSpec>) -> Result<ReconcilePlan, FleetError> {
        ensure_kind(&self.kind, &spec)?;
        let (forced, status) = {
            let mut state = self.lock();
            state.calls.push(BrokerCall::Reconcile);
            (state.plan, state.status)
        };

        let plan = match forced {
            Some(MockPlan::NoOp) => {
                self.spec.store(spec);
                ReconcilePlan::NoOp
            }
            Some(MockPlan::UpdateBookkeeping) => ReconcilePlan::UpdateBookkeeping(spec),
            Some(MockPlan::Recreate) => ReconcilePlan::Recreate {
                spec,
                was_running: status == InstanceStatus::Running,
            },
            None if *self.spec.load_full() == *spec => ReconcilePlan::UpdateBookkeeping(spec),
            None => ReconcilePlan::Recreate {
                spec,
                was_running: status == InstanceStatus::Running,
            },
        };
        Ok(plan)
    }

    async fn apply_plan(&self, plan: ReconcilePlan) -> Result<(), FleetError> {
        match plan {
            ReconcilePlan::NoOp => self.record(BrokerCall::ApplyNoOp),
            ReconcilePlan::UpdateBookkeeping(spec) => {
                self.record(BrokerCall::ApplyUpdateBookkeeping);
                self.spec.store(spec);
            }
            ReconcilePlan::Recreate { spec, was_running } => {
                self.record(BrokerCall::ApplyRecreate);
                self.spec.store(spec);
                let status = if was_running {
                    InstanceStatus::Running
                } else {
                    InstanceStatus::Stopped
                };
                self.set_status(status);
            }
        }
        Ok(())
    }
}

/// Factory handing out [`MockBroker`]s and remembering each one it built.
#[derive(Default)]
pub struct MockBrokerFactory {
    created: Mutex<Vec<Arc<MockBroker>>>,
    fail_creates: AtomicBool,
}

impl MockBrokerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Every broker built for `name`, oldest first.
    pub fn created(&self, name: &str) -> Vec<Arc<MockBroker>> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|b| b.name() == name)
            .cloned()
            .collect()
    }

    /// Most recent broker built for `name`.
    pub fn latest(&self, name: &str) -> Option<Arc<MockBroker>> {
        self.created(name).pop()
    }
}

impl BrokerFactory for MockBrokerFactory {
    fn create(&self, spec: Arc<InstanceSpec>) -> Result<Arc<dyn Broker>, FleetError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(FleetError::Config(format!(
                "[MOCK] refusing to build broker for {}",
                spec.name
            )));
        }
        let broker = Arc::new(MockBroker::new(spec));
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&broker));
        Ok(broker)
    }
}
