//! Integration tests for instance lifecycle policy.
//!
//! Instances run on `MockBroker` so that timers, pinning and deferred
//! reconciliation can be observed without a real backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use warden_agent::broker::{BackendAddress, BrokerCall, InstanceStatus, MockBroker, MockPlan};
use warden_agent::probe::{ConsumerNotifier, ReadinessProbe};
use warden_agent::spec::{
    BackendConfig, CommandSettings, InstanceSpec, LifecycleSettings, ReconcileBehavior,
    ShutdownBehavior,
};
use warden_agent::{FleetError, Instance, InstanceServices};

#[derive(Default)]
struct CountingProbe {
    probes: AtomicUsize,
    ready_after: usize,
}

#[async_trait]
impl ReadinessProbe for CountingProbe {
    async fn probe(&self, _address: Option<&BackendAddress>) -> bool {
        let n = self.probes.fetch_add(1, Ordering::SeqCst) + 1;
        n > self.ready_after
    }
}

#[derive(Default)]
struct RecordingNotifier {
    notices: Mutex<Vec<(String, Vec<String>, Duration)>>,
}

#[async_trait]
impl ConsumerNotifier for RecordingNotifier {
    async fn notify_restart(&self, instance: &str, consumers: &[String], grace: Duration) {
        self.notices
            .lock()
            .unwrap()
            .push((instance.to_string(), consumers.to_vec(), grace));
    }
}

fn spec(command: &str) -> InstanceSpec {
    InstanceSpec {
        name: "lobby".to_string(),
        backend: BackendConfig::Cmd(CommandSettings {
            command: vec![command.to_string()],
            working_dir: None,
            env: BTreeMap::new(),
            address: Some("127.0.0.1:25565".to_string()),
        }),
        lifecycle: LifecycleSettings::default(),
    }
}

struct Harness {
    instance: Arc<Instance>,
    broker: Arc<MockBroker>,
    probe: Arc<CountingProbe>,
    notifier: Arc<RecordingNotifier>,
}

fn harness(spec: InstanceSpec) -> Harness {
    let spec = Arc::new(spec);
    let broker = Arc::new(MockBroker::new(spec.clone()));
    let probe = Arc::new(CountingProbe::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let services = InstanceServices {
        probe: probe.clone(),
        notifier: notifier.clone(),
    };
    let instance = Instance::new(spec, broker.clone(), services);
    Harness {
        instance,
        broker,
        probe,
        notifier,
    }
}

#[tokio::test(start_paused = true)]
async fn test_double_schedule_shutdown_stops_once() {
    let h = harness(spec("server"));
    h.instance.start_server().await.unwrap();

    h.instance.schedule_shutdown().await;
    h.instance.schedule_shutdown().await;
    tokio::time::sleep(Duration::from_secs(301)).await;

    assert_eq!(h.broker.count(BrokerCall::Stop), 1);
    assert_eq!(h.instance.status().await, InstanceStatus::Stopped);
    assert!(!h.instance.has_scheduled_shutdown());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_not_scheduled_when_stopped_or_negative() {
    let h = harness(spec("server"));
    h.instance.schedule_shutdown().await;
    assert!(!h.instance.has_scheduled_shutdown());

    h.instance.start_server().await.unwrap();
    h.instance.schedule_shutdown_after(-1).await;
    assert!(!h.instance.has_scheduled_shutdown());
}

#[tokio::test(start_paused = true)]
async fn test_start_cancels_scheduled_shutdown() {
    let h = harness(spec("server"));
    h.instance.start_server().await.unwrap();
    h.instance.schedule_shutdown_after(10).await;
    assert!(h.instance.has_scheduled_shutdown());

    h.instance.start_server().await.unwrap();
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(h.broker.count(BrokerCall::Stop), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_before_shutdown_keeps_instance() {
    let h = harness(spec("server"));
    h.instance.start_server().await.unwrap();
    h.instance.handle_connect("alex").await;
    h.instance.handle_disconnect("alex").await;
    assert!(h.instance.has_scheduled_shutdown());

    h.instance.handle_connect("sam").await;
    tokio::time::sleep(Duration::from_secs(301)).await;

    assert_eq!(h.broker.count(BrokerCall::Stop), 0);
    assert_eq!(h.instance.status().await, InstanceStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn test_idle_remove_behavior() {
    let mut remove_on_idle = spec("server");
    remove_on_idle.lifecycle.shutdown_behavior = ShutdownBehavior::Remove;
    remove_on_idle.lifecycle.timeouts.inactive_grace_period_secs = 5;
    let h = harness(remove_on_idle);
    h.instance.start_server().await.unwrap();

    h.instance.handle_connect("alex").await;
    h.instance.handle_disconnect("alex").await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(h.broker.count(BrokerCall::Remove), 1);
    assert_eq!(h.instance.status().await, InstanceStatus::Removed);
}

#[tokio::test]
async fn test_pinned_instance_refuses_stop_and_remove() {
    let h = harness(spec("server"));
    h.instance.start_server().await.unwrap();
    h.instance.pin();

    assert!(matches!(h.instance.stop_server().await, Err(FleetError::Pinned(_))));
    assert!(matches!(h.instance.remove_server().await, Err(FleetError::Pinned(_))));
    assert_eq!(h.broker.count(BrokerCall::Stop), 0);

    h.instance.unpin().await;
    h.instance.stop_server().await.unwrap();
    assert_eq!(h.instance.status().await, InstanceStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_await_ready_zero_timeout_never_probes() {
    let mut no_wait = spec("server");
    no_wait.lifecycle.timeouts.startup_secs = 0;
    let h = harness(no_wait);
    h.instance.start_server().await.unwrap();

    let err = h.instance.await_ready().await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(h.probe.probes.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_await_ready_probes_until_ready() {
    let spec = Arc::new(spec("server"));
    let broker = Arc::new(MockBroker::new(spec.clone()));
    let probe = Arc::new(CountingProbe {
        probes: AtomicUsize::new(0),
        ready_after: 3,
    });
    let services = InstanceServices {
        probe: probe.clone(),
        notifier: Arc::new(RecordingNotifier::default()),
    };
    let instance = Instance::new(spec, broker, services);
    instance.start_server().await.unwrap();

    instance.await_ready().await.unwrap();
    assert_eq!(probe.probes.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_await_ready_fails_when_not_running() {
    let h = harness(spec("server"));
    let err = h.instance.await_ready().await.unwrap_err();
    assert!(matches!(err, FleetError::NotRunning(_)));
}

#[tokio::test(start_paused = true)]
async fn test_force_reconcile_swaps_spec_after_grace() {
    let mut current = spec("server");
    current.lifecycle.reconciliation_behavior = ReconcileBehavior::Force;
    current.lifecycle.timeouts.reconciliation_grace_period_secs = 5;
    let h = harness(current.clone());
    h.instance.start_server().await.unwrap();
    h.instance.handle_connect("alex").await;

    let mut desired = current;
    desired.backend = spec("server-v2").backend;
    let desired = Arc::new(desired);
    h.instance.reconcile(desired.clone()).await.unwrap();

    assert_ne!(h.instance.spec(), desired);
    assert!(h.instance.has_pending_reconcile());
    {
        let notices = h.notifier.notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].1, vec!["alex"]);
        assert_eq!(notices[0].2, Duration::from_secs(5));
    }

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_ne!(h.instance.spec(), desired);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.instance.spec(), desired);
    assert!(!h.instance.has_pending_reconcile());
    assert_eq!(h.broker.count(BrokerCall::ApplyRecreate), 1);
    assert_eq!(h.instance.status().await, InstanceStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn test_newer_reconcile_replaces_scheduled_one() {
    let mut current = spec("server");
    current.lifecycle.reconciliation_behavior = ReconcileBehavior::Force;
    current.lifecycle.timeouts.reconciliation_grace_period_secs = 5;
    let h = harness(current.clone());

    let mut first = current.clone();
    first.backend = spec("server-v2").backend;
    h.instance.reconcile(Arc::new(first)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    let mut second = current;
    second.backend = spec("server-v3").backend;
    let second = Arc::new(second);
    h.instance.reconcile(second.clone()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.instance.spec(), second);
    assert_eq!(h.broker.count(BrokerCall::ApplyRecreate), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_force_reconcile_with_zero_grace_always_applies() {
    for _ in 0..50 {
        let mut current = spec("server");
        current.lifecycle.reconciliation_behavior = ReconcileBehavior::Force;
        current.lifecycle.timeouts.reconciliation_grace_period_secs = 0;
        let h = harness(current.clone());

        let mut desired = current;
        desired.backend = spec("server-v2").backend;
        let desired = Arc::new(desired);
        h.instance.reconcile(desired.clone()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.instance.spec() != desired {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert!(!h.instance.has_pending_reconcile());
        assert!(!h.instance.has_scheduled_reconcile());
        assert_eq!(h.broker.count(BrokerCall::ApplyRecreate), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_consumer_joining_during_force_grace_is_notified() {
    let mut current = spec("server");
    current.lifecycle.reconciliation_behavior = ReconcileBehavior::Force;
    let h = harness(current.clone());

    let mut desired = current;
    desired.backend = spec("server-v2").backend;
    h.instance.reconcile(Arc::new(desired)).await.unwrap();
    h.instance.handle_connect("sam").await;

    let notices = h.notifier.notices.lock().unwrap();
    assert_eq!(notices.last().map(|n| n.1.clone()), Some(vec!["sam".to_string()]));
}

#[tokio::test]
async fn test_on_stop_reconcile_runs_on_next_stop() {
    let h = harness(spec("server"));
    h.instance.start_server().await.unwrap();

    let desired = Arc::new(spec("server-v2"));
    h.instance.reconcile(desired.clone()).await.unwrap();
    assert!(h.instance.has_pending_reconcile());
    assert!(!h.instance.has_scheduled_reconcile());
    assert_ne!(h.instance.spec(), desired);

    h.instance.stop_server().await.unwrap();
    assert_eq!(h.instance.spec(), desired);
    assert!(!h.instance.has_pending_reconcile());
    assert_eq!(h.broker.count(BrokerCall::ApplyRecreate), 1);
    assert_eq!(h.broker.count(BrokerCall::Stop), 2);
    assert_eq!(h.instance.status().await, InstanceStatus::Stopped);
}

#[tokio::test]
async fn test_noop_plan_swaps_spec_immediately() {
    let h = harness(spec("server"));
    h.broker.set_plan(MockPlan::NoOp);

    let desired = Arc::new(spec("server-v2"));
    h.instance.reconcile(desired.clone()).await.unwrap();

    assert_eq!(h.instance.spec(), desired);
    assert!(!h.instance.has_pending_reconcile());
}

#[tokio::test]
async fn test_summary_reports_policy_state() {
    let h = harness(spec("server"));
    h.instance.start_server().await.unwrap();
    h.instance.pin();
    h.instance.handle_connect("alex").await;

    let summary = h.instance.summary().await;
    assert_eq!(summary.name, "lobby");
    assert_eq!(summary.kind, "cmd");
    assert_eq!(summary.status, InstanceStatus::Running);
    assert!(summary.pinned);
    assert_eq!(summary.consumers, 1);
}
