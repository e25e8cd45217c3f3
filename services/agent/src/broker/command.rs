//! Raw process backend for the `cmd` and `jar` kinds.
//!
//! The process is a child of the agent. It does not survive an agent restart,
//! so a fresh broker always reports `Removed` until started.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::process::Stdio;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::{ensure_kind, BackendAddress, Broker, BrokerFactory, InstanceStatus, ReconcilePlan};
use crate::error::FleetError;
use crate::spec::{BackendConfig, CommandSettings, InstanceSpec};

fn command_settings(spec: &InstanceSpec) -> Result<CommandSettings, FleetError> {
    let settings = match &spec.backend {
        BackendConfig::Cmd(cmd) => cmd.clone(),
        BackendConfig::Jar(jar) => jar.to_command(),
        other => {
            return Err(FleetError::KindMismatch {
                expected: "cmd or jar".to_string(),
                actual: other.kind().to_string(),
            })
        }
    };
    if settings.command.is_empty() {
        return Err(FleetError::Config(format!(
            "instance {}: command must not be empty",
            spec.name
        )));
    }
    Ok(settings)
}

/// Broker running the instance as a local child process.
pub struct CommandBroker {
    name: String,
    kind: String,
    spec: ArcSwap<InstanceSpec>,
    command: ArcSwap<CommandSettings>,
    child: Mutex<Option<Child>>,
    /// Whether a process has been started since creation or the last remove.
    created: AtomicBool,
}

impl CommandBroker {
    pub fn new(spec: Arc<InstanceSpec>) -> Result<Self, FleetError> {
        let command = command_settings(&spec)?;
        Ok(Self {
            name: spec.name.clone(),
            kind: spec.kind().to_string(),
            spec: ArcSwap::new(spec),
            command: ArcSwap::from_pointee(command),
            child: Mutex::new(None),
            created: AtomicBool::new(false),
        })
    }

    /// Argv currently in effect.
    pub fn command(&self) -> Vec<String> {
        self.command.load().command.clone()
    }

    fn spawn(&self) -> Result<Child, FleetError> {
        let settings = self.command.load();
        let (program, args) = settings
            .command
            .split_first()
            .ok_or_else(|| FleetError::Config(format!("instance {}: empty command", self.name)))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&settings.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &settings.working_dir {
            command.current_dir(dir);
        }

        command
            .spawn()
            .map_err(|e| FleetError::Backend(format!("failed to spawn {program}: {e}")))
    }
}

#[async_trait]
impl Broker for CommandBroker {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn status(&self) -> InstanceStatus {
        let mut child = self.child.lock().await;
        match child.as_mut().map(|c| c.try_wait()) {
            Some(Ok(None)) => InstanceStatus::Running,
            Some(Ok(Some(exit))) => {
                debug!(instance = %self.name, status = %exit, "Process has exited");
                *child = None;
                InstanceStatus::Stopped
            }
            Some(Err(e)) => {
                warn!(instance = %self.name, error = %e, "Failed to poll process");
                InstanceStatus::Unknown
            }
            None if self.created.load(Ordering::SeqCst) => InstanceStatus::Stopped,
            None => InstanceStatus::Removed,
        }
    }

    fn address(&self) -> Result<BackendAddress, FleetError> {
        BackendAddress::parse(&self.name, self.command.load().address.as_deref())
    }

    async fn start_server(&self) -> Result<(), FleetError> {
        let mut child = self.child.lock().await;
        if let Some(running) = child.as_mut() {
            if matches!(running.try_wait(), Ok(None)) {
                return Ok(());
            }
        }

        let spawned = self.spawn()?;
        info!(instance = %self.name, pid = ?spawned.id(), "Process started");
        *child = Some(spawned);
        self.created.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_server(&self) -> Result<(), FleetError> {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };
        if !matches!(child.try_wait(), Ok(None)) {
            return Ok(());
        }

        if let Err(e) = child.start_kill() {
            return Err(FleetError::Backend(format!("failed to signal process: {e}")));
        }
        let timeout = self.spec.load().lifecycle.timeouts.shutdown();
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(exit)) => {
                info!(instance = %self.name, status = %exit, "Process stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(FleetError::Backend(format!("failed to reap process: {e}"))),
            Err(_) => {
                *guard = Some(child);
                Err(FleetError::Timeout {
                    what: format!("{} shutdown", self.name),
                    elapsed: timeout,
                })
            }
        }
    }

    async fn remove_server(&self) -> Result<(), FleetError> {
        self.stop_server().await?;
        self.created.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn reconcile(&self, spec: Arc<InstanceSpec>) -> Result<ReconcilePlan, FleetError> {
        ensure_kind(&self.kind, &spec)?;
        let desired = command_settings(&spec)?;

        if *self.command.load_full() != desired {
            let was_running = self.is_running().await;
            Ok(ReconcilePlan::Recreate { spec, was_running })
        } else {
            Ok(ReconcilePlan::UpdateBookkeeping(spec))
        }
    }

    async fn apply_plan(&self, plan: ReconcilePlan) -> Result<(), FleetError> {
        match plan {
            ReconcilePlan::NoOp => Ok(()),
            ReconcilePlan::UpdateBookkeeping(spec) => {
                self.command.store(Arc::new(command_settings(&spec)?));
                self.spec.store(spec);
                Ok(())
            }
            ReconcilePlan::Recreate { spec, was_running } => {
                let desired = command_settings(&spec)?;
                self.remove_server().await?;
                self.command.store(Arc::new(desired));
                self.spec.store(spec);
                if was_running {
                    self.start_server().await?;
                }
                Ok(())
            }
        }
    }
}

/// Builds [`CommandBroker`]s for both `cmd` and `jar`.
pub struct CommandBrokerFactory;

impl BrokerFactory for CommandBrokerFactory {
    fn create(&self, spec: Arc<InstanceSpec>) -> Result<Arc<dyn Broker>, FleetError> {
        Ok(Arc::new(CommandBroker::new(spec)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{JarSettings, LifecycleSettings};
    use std::collections::BTreeMap;

    fn cmd_spec(name: &str, command: &[&str]) -> Arc<InstanceSpec> {
        Arc::new(InstanceSpec {
            name: name.to_string(),
            backend: BackendConfig::Cmd(CommandSettings {
                command: command.iter().map(|s| s.to_string()).collect(),
                working_dir: None,
                env: BTreeMap::new(),
                address: Some("127.0.0.1:25565".to_string()),
            }),
            lifecycle: LifecycleSettings::default(),
        })
    }

    #[tokio::test]
    async fn test_process_lifecycle() {
        let broker = CommandBroker::new(cmd_spec("sleeper", &["sleep", "30"])).unwrap();
        assert_eq!(broker.status().await, InstanceStatus::Removed);

        broker.start_server().await.unwrap();
        assert_eq!(broker.status().await, InstanceStatus::Running);
        broker.start_server().await.unwrap();

        broker.stop_server().await.unwrap();
        assert_eq!(broker.status().await, InstanceStatus::Stopped);
        broker.stop_server().await.unwrap();

        broker.remove_server().await.unwrap();
        assert_eq!(broker.status().await, InstanceStatus::Removed);
    }

    #[tokio::test]
    async fn test_reconcile_detects_command_change() {
        let broker = CommandBroker::new(cmd_spec("sleeper", &["sleep", "30"])).unwrap();

        let same = broker.reconcile(cmd_spec("sleeper", &["sleep", "30"])).await.unwrap();
        assert!(matches!(same, ReconcilePlan::UpdateBookkeeping(_)));

        let changed = broker.reconcile(cmd_spec("sleeper", &["sleep", "60"])).await.unwrap();
        assert!(matches!(
            changed,
            ReconcilePlan::Recreate {
                was_running: false,
                ..
            }
        ));
        broker.apply_plan(changed).await.unwrap();
        assert_eq!(broker.command(), vec!["sleep", "60"]);
        assert_eq!(broker.status().await, InstanceStatus::Removed);
    }

    #[tokio::test]
    async fn test_reconcile_rejects_other_kind() {
        let broker = CommandBroker::new(cmd_spec("sleeper", &["sleep", "30"])).unwrap();
        let jar = Arc::new(InstanceSpec {
            name: "sleeper".to_string(),
            backend: BackendConfig::Jar(JarSettings {
                jar_file: "server.jar".to_string(),
                java: "java".to_string(),
                java_flags: vec![],
                flags: vec![],
                working_dir: None,
                env: BTreeMap::new(),
                address: None,
            }),
            lifecycle: LifecycleSettings::default(),
        });
        let err = broker.reconcile(jar).await.unwrap_err();
        assert!(matches!(err, FleetError::KindMismatch { .. }));
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(matches!(
            CommandBroker::new(cmd_spec("empty", &[])),
            Err(FleetError::Config(_))
        ));
    }
}
