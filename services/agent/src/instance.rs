//! A managed instance: one broker plus cross-backend lifecycle policy.
//!
//! The instance owns:
//! - The current spec, swapped atomically once a reconciliation lands
//! - Pinning, which blocks stop and remove
//! - At most one scheduled idle shutdown and one scheduled reconciliation
//! - The set of connected consumers reported by the routing layer

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use warden_reconcile::{wait_until, Poll};

use crate::broker::{BackendAddress, Broker, InstanceStatus, ReconcilePlan};
use crate::error::FleetError;
use crate::probe::{ConsumerNotifier, LogNotifier, ReadinessProbe, TcpProbe};
use crate::spec::{InstanceSpec, ReconcileBehavior, ShutdownBehavior};

/// Interval between readiness probes.
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Collaborators shared by every instance of a fleet.
#[derive(Clone)]
pub struct InstanceServices {
    pub probe: Arc<dyn ReadinessProbe>,
    pub notifier: Arc<dyn ConsumerNotifier>,
}

impl Default for InstanceServices {
    fn default() -> Self {
        Self {
            probe: Arc::new(TcpProbe::default()),
            notifier: Arc::new(LogNotifier),
        }
    }
}

/// Operator-facing view of an instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub name: String,
    pub kind: String,
    pub status: InstanceStatus,
    pub pinned: bool,
    pub consumers: usize,
    pub pending_reconcile: bool,
    pub shutdown_scheduled: bool,
}

struct ScheduledTask {
    id: u64,
    handle: JoinHandle<()>,
}

struct PendingReconcile {
    id: u64,
    plan: ReconcilePlan,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Instance {
    name: String,
    spec: ArcSwap<InstanceSpec>,
    broker: Arc<dyn Broker>,
    services: InstanceServices,
    pinned: AtomicBool,
    consumers: Mutex<BTreeSet<String>>,
    pending: Mutex<Option<PendingReconcile>>,
    shutdown_task: Mutex<Option<ScheduledTask>>,
    reconcile_task: Mutex<Option<ScheduledTask>>,
    next_id: AtomicU64,
}

impl Instance {
    pub fn new(
        spec: Arc<InstanceSpec>,
        broker: Arc<dyn Broker>,
        services: InstanceServices,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: spec.name.clone(),
            spec: ArcSwap::new(spec),
            broker,
            services,
            pinned: AtomicBool::new(false),
            consumers: Mutex::new(BTreeSet::new()),
            pending: Mutex::new(None),
            shutdown_task: Mutex::new(None),
            reconcile_task: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spec currently in effect.
    pub fn spec(&self) -> Arc<InstanceSpec> {
        self.spec.load_full()
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    pub async fn status(&self) -> InstanceStatus {
        self.broker.status().await
    }

    pub async fn is_running(&self) -> bool {
        self.broker.is_running().await
    }

    pub fn address(&self) -> Result<BackendAddress, FleetError> {
        self.broker.address()
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::SeqCst)
    }

    pub fn consumer_count(&self) -> usize {
        lock(&self.consumers).len()
    }

    pub fn has_pending_reconcile(&self) -> bool {
        lock(&self.pending).is_some()
    }

    pub fn has_scheduled_shutdown(&self) -> bool {
        lock(&self.shutdown_task).is_some()
    }

    pub fn has_scheduled_reconcile(&self) -> bool {
        lock(&self.reconcile_task).is_some()
    }

    pub async fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            name: self.name.clone(),
            kind: self.broker.kind().to_string(),
            status: self.status().await,
            pinned: self.is_pinned(),
            consumers: self.consumer_count(),
            pending_reconcile: self.has_pending_reconcile(),
            shutdown_scheduled: self.has_scheduled_shutdown(),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Start the backend, cancelling any pending idle shutdown.
    pub async fn start_server(&self) -> Result<(), FleetError> {
        self.cancel_shutdown();
        info!(instance = %self.name, "Starting instance");
        self.broker.start_server().await
    }

    /// Stop the backend. A pending on-stop reconciliation runs afterwards.
    pub async fn stop_server(&self) -> Result<(), FleetError> {
        if self.is_pinned() {
            return Err(FleetError::Pinned(self.name.clone()));
        }
        info!(instance = %self.name, "Stopping instance");
        self.broker.stop_server().await?;

        let on_stop =
            self.spec.load().lifecycle.reconciliation_behavior == ReconcileBehavior::OnStop;
        if on_stop && self.has_pending_reconcile() {
            self.run_pending(None).await?;
            // A recreate must leave the backend stopped.
            self.broker.stop_server().await?;
        }
        Ok(())
    }

    /// Stop and delete the backend.
    pub async fn remove_server(&self) -> Result<(), FleetError> {
        if self.is_pinned() {
            return Err(FleetError::Pinned(self.name.clone()));
        }
        info!(instance = %self.name, "Removing instance");
        self.broker.remove_server().await
    }

    /// Schedule an idle shutdown after the inactive grace period.
    pub async fn schedule_shutdown(self: &Arc<Self>) {
        let delay = self.spec.load().lifecycle.timeouts.inactive_grace_period_secs;
        self.schedule_shutdown_after(delay).await;
    }

    /// Schedule an idle shutdown after `delay_secs`.
    ///
    /// No-op when the delay is negative, a shutdown is already scheduled, or
    /// the backend is not running. When it fires with consumers connected,
    /// nothing happens.
    pub async fn schedule_shutdown_after(self: &Arc<Self>, delay_secs: i64) {
        if delay_secs < 0 || self.has_scheduled_shutdown() || !self.is_running().await {
            return;
        }

        let mut slot = lock(&self.shutdown_task);
        if slot.is_some() {
            return;
        }

        let id = self.next_id();
        let delay = Duration::from_secs(delay_secs.unsigned_abs());
        let weak = Arc::downgrade(self);
        debug!(instance = %self.name, delay_secs, "Scheduling idle shutdown");

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(instance) = weak.upgrade() {
                instance.fire_shutdown(id).await;
            }
        });
        *slot = Some(ScheduledTask { id, handle });
    }

    async fn fire_shutdown(&self, id: u64) {
        {
            let mut slot = lock(&self.shutdown_task);
            if slot.as_ref().map(|task| task.id) != Some(id) {
                return;
            }
            *slot = None;
        }

        if self.consumer_count() > 0 {
            debug!(instance = %self.name, "Consumers reconnected, keeping instance");
            return;
        }

        let behavior = self.spec.load().lifecycle.shutdown_behavior;
        info!(instance = %self.name, behavior = ?behavior, "Instance idle, shutting down");
        let result = match behavior {
            ShutdownBehavior::Stop => self.stop_server().await,
            ShutdownBehavior::Remove => self.remove_server().await,
        };
        if let Err(e) = result {
            error!(instance = %self.name, error = %e, "Idle shutdown failed");
        }
    }

    /// Cancel a scheduled idle shutdown that has not fired yet.
    pub fn cancel_shutdown(&self) {
        if let Some(task) = lock(&self.shutdown_task).take() {
            debug!(instance = %self.name, "Cancelled idle shutdown");
            task.handle.abort();
        }
    }

    fn cancel_reconcile_task(&self) {
        if let Some(task) = lock(&self.reconcile_task).take() {
            debug!(instance = %self.name, "Cancelled scheduled reconciliation");
            task.handle.abort();
        }
    }

    /// Cancel every scheduled task. Used when the instance leaves the fleet.
    pub fn cancel_scheduled(&self) {
        self.cancel_shutdown();
        self.cancel_reconcile_task();
    }

    /// Converge toward `new_spec`.
    ///
    /// A no-op plan swaps the spec immediately. Anything else is kept pending
    /// and executed after the grace period (`force`) or on the next stop
    /// (`on_stop`). A newer call replaces an older pending plan.
    pub async fn reconcile(self: &Arc<Self>, new_spec: Arc<InstanceSpec>) -> Result<(), FleetError> {
        self.cancel_reconcile_task();

        let plan = self.broker.reconcile(Arc::clone(&new_spec)).await?;
        if plan.is_noop() {
            *lock(&self.pending) = None;
            self.spec.store(new_spec);
            debug!(instance = %self.name, "Reconciled without pending work");
            return Ok(());
        }

        let id = self.next_id();
        let disruptive = plan.is_disruptive();
        *lock(&self.pending) = Some(PendingReconcile { id, plan });

        match new_spec.lifecycle.reconciliation_behavior {
            ReconcileBehavior::Force => {
                let grace = new_spec.lifecycle.timeouts.reconciliation_grace();
                info!(
                    instance = %self.name,
                    grace_secs = grace.as_secs(),
                    disruptive,
                    "Reconciliation scheduled"
                );

                {
                    let mut slot = lock(&self.reconcile_task);
                    let weak = Arc::downgrade(self);
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        if let Some(instance) = weak.upgrade() {
                            instance.fire_reconcile(id).await;
                        }
                    });
                    *slot = Some(ScheduledTask { id, handle });
                }

                if disruptive {
                    let consumers = self.consumer_list();
                    self.services
                        .notifier
                        .notify_restart(&self.name, &consumers, grace)
                        .await;
                }
            }
            ReconcileBehavior::OnStop => {
                info!(instance = %self.name, disruptive, "Reconciliation deferred until next stop");
            }
        }
        Ok(())
    }

    async fn fire_reconcile(&self, id: u64) {
        {
            let mut slot = lock(&self.reconcile_task);
            if slot.as_ref().map(|task| task.id) != Some(id) {
                return;
            }
            *slot = None;
        }
        if let Err(e) = self.run_pending(Some(id)).await {
            error!(instance = %self.name, error = %e, "Scheduled reconciliation failed");
        }
    }

    /// Execute the pending plan, if any (and if it is `id` when given).
    async fn run_pending(&self, id: Option<u64>) -> Result<(), FleetError> {
        let pending = {
            let mut slot = lock(&self.pending);
            let matches = slot
                .as_ref()
                .is_some_and(|p| id.is_none_or(|id| p.id == id));
            if matches {
                slot.take()
            } else {
                None
            }
        };
        let Some(pending) = pending else {
            return Ok(());
        };

        let spec = pending.plan.spec().cloned();
        info!(instance = %self.name, "Applying reconciliation");
        self.broker.apply_plan(pending.plan).await?;
        if let Some(spec) = spec {
            self.spec.store(spec);
        }
        info!(instance = %self.name, "Reconciliation applied");
        Ok(())
    }

    /// Wait until the backend accepts traffic.
    ///
    /// Probes every 200 ms while the backend runs, bounded by the startup
    /// timeout. A zero timeout fails without probing.
    pub async fn await_ready(&self) -> Result<(), FleetError> {
        let timeout = self.spec.load().lifecycle.timeouts.startup();
        let this = self;

        wait_until(
            format!("{} readiness", self.name),
            timeout,
            READY_POLL_INTERVAL,
            move || async move {
                if !this.broker.is_running().await {
                    return Poll::Abort(FleetError::NotRunning(this.name.clone()));
                }
                let address = this.broker.address().ok();
                if this.services.probe.probe(address.as_ref()).await {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            },
        )
        .await
        .map_err(FleetError::from)
    }

    fn consumer_list(&self) -> Vec<String> {
        lock(&self.consumers).iter().cloned().collect()
    }

    /// Record a connected consumer.
    ///
    /// Consumers joining while a forced restart is scheduled get the restart
    /// notice too.
    pub async fn handle_connect(&self, consumer: &str) {
        lock(&self.consumers).insert(consumer.to_string());
        let restart_pending = lock(&self.pending)
            .as_ref()
            .is_some_and(|p| p.plan.is_disruptive());
        if restart_pending && self.has_scheduled_reconcile() {
            let grace = self.spec.load().lifecycle.timeouts.reconciliation_grace();
            self.services
                .notifier
                .notify_restart(&self.name, &[consumer.to_string()], grace)
                .await;
        }
    }

    /// Forget a consumer; the last one leaving may schedule an idle shutdown.
    pub async fn handle_disconnect(self: &Arc<Self>, consumer: &str) {
        let remaining = {
            let mut consumers = lock(&self.consumers);
            consumers.remove(consumer);
            consumers.len()
        };

        if remaining == 0 && self.spec.load().lifecycle.allow_auto_stop && !self.is_pinned() {
            self.schedule_shutdown().await;
        }
    }

    /// Pin the instance: stop and remove are refused until unpinned.
    pub fn pin(&self) {
        self.pinned.store(true, Ordering::SeqCst);
        self.cancel_shutdown();
        info!(instance = %self.name, "Instance pinned");
    }

    pub async fn unpin(self: &Arc<Self>) {
        self.pinned.store(false, Ordering::SeqCst);
        info!(instance = %self.name, "Instance unpinned");
        if self.consumer_count() == 0 && self.spec.load().lifecycle.allow_auto_stop {
            self.schedule_shutdown().await;
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        for slot in [&self.shutdown_task, &self.reconcile_task] {
            if let Some(task) = lock(slot).take() {
                task.handle.abort();
            }
        }
        if lock(&self.pending).is_some() {
            warn!(instance = %self.name, "Dropping instance with a pending reconciliation");
        }
    }
}
