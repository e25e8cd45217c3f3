//! Fleet manager: the registry of live instances and spec reload handling.
//!
//! A reload is diffed by instance name and processed in three buckets,
//! remove, then add, then update. Work inside a bucket runs concurrently and
//! a failing instance never aborts the rest of the batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::future::join_all;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};
use warden_reconcile::{diff_keys, index_by};

use crate::broker::{BrokerRegistry, InstanceStatus};
use crate::endpoints::EndpointRegistry;
use crate::error::FleetError;
use crate::instance::{Instance, InstanceServices, InstanceSummary};
use crate::spec::{FleetSpec, InstanceSpec, SpecReload};

/// What a single reload did, by instance name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    pub removed: Vec<String>,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<String>,
}

enum UpdateOutcome {
    Unchanged,
    Updated,
}

pub struct FleetManager {
    brokers: BrokerRegistry,
    endpoints: Arc<dyn EndpointRegistry>,
    services: InstanceServices,
    instances: RwLock<HashMap<String, Arc<Instance>>>,
    current: ArcSwap<FleetSpec>,
    maintenance_interval: watch::Sender<Duration>,
}

impl FleetManager {
    pub fn new(
        brokers: BrokerRegistry,
        endpoints: Arc<dyn EndpointRegistry>,
        services: InstanceServices,
    ) -> Arc<Self> {
        let current = FleetSpec::default();
        let (maintenance_interval, _) = watch::channel(current.maintenance_interval());
        Arc::new(Self {
            brokers,
            endpoints,
            services,
            instances: RwLock::new(HashMap::new()),
            current: ArcSwap::from_pointee(current),
            maintenance_interval,
        })
    }

    pub fn brokers(&self) -> &BrokerRegistry {
        &self.brokers
    }

    pub fn endpoints(&self) -> Arc<dyn EndpointRegistry> {
        Arc::clone(&self.endpoints)
    }

    /// Last fleet spec that was applied.
    pub fn current_spec(&self) -> Arc<FleetSpec> {
        self.current.load_full()
    }

    pub fn maintenance_interval(&self) -> Duration {
        *self.maintenance_interval.borrow()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Instance>> {
        self.instances.read().await.get(name).cloned()
    }

    async fn require(&self, name: &str) -> Result<Arc<Instance>, FleetError> {
        self.get(name)
            .await
            .ok_or_else(|| FleetError::NotFound(name.to_string()))
    }

    /// Managed instance names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instances.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn snapshot(&self) -> Vec<Arc<Instance>> {
        let mut instances: Vec<Arc<Instance>> =
            self.instances.read().await.values().cloned().collect();
        instances.sort_by(|a, b| a.name().cmp(b.name()));
        instances
    }

    /// Status of every instance, sorted by name.
    pub async fn status_all(&self) -> Vec<(String, InstanceStatus)> {
        let instances = self.snapshot().await;
        let statuses = join_all(instances.iter().map(|i| i.status())).await;
        instances
            .iter()
            .map(|i| i.name().to_string())
            .zip(statuses)
            .collect()
    }

    pub async fn summaries(&self) -> Vec<InstanceSummary> {
        let instances = self.snapshot().await;
        join_all(instances.iter().map(|i| i.summary())).await
    }

    /// Apply a reload event. Denied reloads leave the fleet untouched.
    pub async fn handle_reload(&self, reload: SpecReload) -> Option<ReloadReport> {
        if !reload.allowed {
            warn!("Spec reload denied, keeping the current fleet");
            return None;
        }

        let report = self.reconcile_fleet(&reload.old, &reload.new).await;
        self.current.store(Arc::clone(&reload.new));
        self.maintenance_interval
            .send_replace(reload.new.maintenance_interval());

        info!(
            removed = report.removed.len(),
            added = report.added.len(),
            updated = report.updated.len(),
            failed = report.failed.len(),
            "Fleet reloaded"
        );
        Some(report)
    }

    /// Converge the registry toward `new`.
    ///
    /// Buckets are computed against the registered names, so instances that
    /// failed to come up on an earlier reload are retried. `old` only serves
    /// the unchanged-spec short circuit.
    pub async fn reconcile_fleet(&self, old: &FleetSpec, new: &FleetSpec) -> ReloadReport {
        let old_index = index_by(old.instances.iter(), |i| i.name.clone());
        let new_index = index_by(new.instances.iter(), |i| i.name.clone());
        let diff = diff_keys(self.names().await, new_index.keys().cloned());
        let mut report = ReloadReport::default();

        let removals = join_all(diff.to_remove.iter().map(|name| self.remove_instance(name))).await;
        for (name, result) in diff.to_remove.iter().zip(removals) {
            match result {
                Ok(()) => report.removed.push(name.clone()),
                Err(e) => {
                    error!(instance = %name, error = %e, "Failed to remove instance");
                    report.failed.push(name.clone());
                }
            }
        }

        let additions = join_all(diff.to_add.iter().filter_map(|name| {
            new_index
                .get(name)
                .map(|spec| self.add_instance(Arc::new((*spec).clone())))
        }))
        .await;
        for (name, result) in diff.to_add.iter().zip(additions) {
            match result {
                Ok(_) => report.added.push(name.clone()),
                Err(e) => {
                    error!(instance = %name, error = %e, "Failed to add instance");
                    report.failed.push(name.clone());
                }
            }
        }

        let updates = join_all(diff.to_update.iter().filter_map(|name| {
            let new = new_index.get(name)?;
            Some(self.update_instance(old_index.get(name).copied(), new))
        }))
        .await;
        for (name, result) in diff.to_update.iter().zip(updates) {
            match result {
                Ok(UpdateOutcome::Updated) => report.updated.push(name.clone()),
                Ok(UpdateOutcome::Unchanged) => report.unchanged.push(name.clone()),
                Err(e) => {
                    error!(instance = %name, error = %e, "Failed to update instance");
                    report.failed.push(name.clone());
                }
            }
        }

        report
    }

    /// Remove the backend and forget the instance.
    ///
    /// The instance leaves the registry even when the backend refuses to be
    /// removed; the failure is logged.
    async fn remove_instance(&self, name: &str) -> Result<(), FleetError> {
        let Some(instance) = self.get(name).await else {
            debug!(instance = %name, "Instance not registered, nothing to remove");
            return Ok(());
        };

        if let Err(e) = instance.remove_server().await {
            warn!(instance = %name, error = %e, "Failed to remove backend");
        }
        instance.cancel_scheduled();
        self.instances.write().await.remove(name);
        if self.endpoints.unregister(name) {
            debug!(instance = %name, "Dropped dynamic endpoint");
        }
        info!(instance = %name, "Instance removed from fleet");
        Ok(())
    }

    async fn add_instance(&self, spec: Arc<InstanceSpec>) -> Result<Arc<Instance>, FleetError> {
        let broker = self.brokers.create(Arc::clone(&spec))?;
        let instance = Instance::new(spec, broker, self.services.clone());
        let name = instance.name().to_string();

        if !self.endpoints.contains(&name) {
            match instance.address() {
                Ok(address) => {
                    self.endpoints.register(&name, address);
                }
                Err(e) => warn!(instance = %name, error = %e, "Instance has no routable address"),
            }
        }

        let replaced = self
            .instances
            .write()
            .await
            .insert(name.clone(), Arc::clone(&instance));
        if let Some(old) = replaced {
            old.cancel_scheduled();
        }
        info!(instance = %name, kind = %instance.broker().kind(), "Instance added to fleet");
        Ok(instance)
    }

    async fn update_instance(
        &self,
        old: Option<&InstanceSpec>,
        new: &InstanceSpec,
    ) -> Result<UpdateOutcome, FleetError> {
        let spec = Arc::new(new.clone());
        let Some(instance) = self.get(&new.name).await else {
            self.add_instance(spec).await?;
            return Ok(UpdateOutcome::Updated);
        };

        let unchanged = match old {
            Some(old) => old == new,
            None => *instance.spec() == *new && !instance.has_pending_reconcile(),
        };
        if unchanged {
            return Ok(UpdateOutcome::Unchanged);
        }

        if instance.broker().kind() != new.kind() {
            info!(
                instance = %new.name,
                from = %instance.broker().kind(),
                to = %new.kind(),
                "Backend kind changed, replacing instance"
            );
            self.remove_instance(&new.name).await?;
            self.add_instance(spec).await?;
            return Ok(UpdateOutcome::Updated);
        }

        instance.reconcile(spec).await?;
        Ok(UpdateOutcome::Updated)
    }

    /// Schedule idle shutdowns for instances nobody uses.
    pub async fn sweep_idle(&self) {
        for instance in self.snapshot().await {
            let auto_stop = instance.spec().lifecycle.allow_auto_stop;
            if instance.consumer_count() == 0 && auto_stop && !instance.is_pinned() {
                instance.schedule_shutdown().await;
            }
        }
    }

    /// Run the idle sweep until shutdown. The interval follows reloads.
    pub async fn run_maintenance(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval_rx = self.maintenance_interval.subscribe();
        info!(
            interval_secs = interval_rx.borrow().as_secs(),
            "Starting maintenance loop"
        );

        loop {
            let period = *interval_rx.borrow_and_update();
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    debug!("Running idle sweep");
                    self.sweep_idle().await;
                }
                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    debug!(interval_secs = interval_rx.borrow().as_secs(), "Maintenance interval changed");
                }
                _ = shutdown.changed() => {
                    info!("Maintenance loop shutting down");
                    break;
                }
            }
        }
    }

    /// Apply reload events until the channel closes or shutdown.
    pub async fn run_reloads(
        &self,
        mut reloads: mpsc::Receiver<SpecReload>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                reload = reloads.recv() => {
                    match reload {
                        Some(reload) => {
                            self.handle_reload(reload).await;
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    info!("Reload handler shutting down");
                    break;
                }
            }
        }
    }

    /// Start an instance if needed and wait until it accepts traffic.
    ///
    /// Used by the routing layer when a consumer asks for a stopped backend.
    pub async fn ensure_ready(&self, name: &str) -> Result<Arc<Instance>, FleetError> {
        let instance = self.require(name).await?;
        if !instance.is_running().await {
            if !instance.spec().lifecycle.allow_auto_start {
                return Err(FleetError::NotRunning(name.to_string()));
            }
            instance.start_server().await?;
        }
        instance.await_ready().await?;
        Ok(instance)
    }

    pub async fn start(&self, name: &str) -> Result<(), FleetError> {
        let instance = self.require(name).await?;
        instance.start_server().await?;
        instance.await_ready().await
    }

    pub async fn stop(&self, name: &str) -> Result<(), FleetError> {
        self.require(name).await?.stop_server().await
    }

    /// Remove the backend. The instance stays managed and can be started again.
    pub async fn remove(&self, name: &str) -> Result<(), FleetError> {
        self.require(name).await?.remove_server().await
    }

    /// Re-apply the desired spec from the current fleet spec.
    pub async fn reconcile_instance(&self, name: &str) -> Result<(), FleetError> {
        let instance = self.require(name).await?;
        let desired = self
            .current
            .load()
            .instance(name)
            .cloned()
            .ok_or_else(|| FleetError::NotFound(name.to_string()))?;
        instance.reconcile(Arc::new(desired)).await
    }

    pub async fn pin(&self, name: &str) -> Result<(), FleetError> {
        self.require(name).await?.pin();
        Ok(())
    }

    pub async fn unpin(&self, name: &str) -> Result<(), FleetError> {
        self.require(name).await?.unpin().await;
        Ok(())
    }

    pub async fn status(&self, name: &str) -> Result<InstanceSummary, FleetError> {
        Ok(self.require(name).await?.summary().await)
    }
}
