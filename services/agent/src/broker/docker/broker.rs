//! Container lifecycle driver.
//!
//! The broker maps the live container state onto start/stop actions:
//!
//! | live state                | start                         | stop                    |
//! |---------------------------|-------------------------------|-------------------------|
//! | running                   | no-op                         | stop, await terminal    |
//! | restarting                | await running                 | stop, await terminal    |
//! | created / paused / exited | start, await running          | no-op                   |
//! | removing                  | await removal, then start     | await removal           |
//! | dead                      | remove, then create and start | remove                  |
//! | absent                    | create and start              | no-op                   |
//!
//! Images are acquired in a background task per pull policy; container
//! creation waits for the outstanding pull.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use warden_reconcile::{wait_until, Poll};

use super::api::{
    ContainerApi, ContainerInspect, CreateContainer, CreateHostConfig, DockerClient, DockerError,
    RestartPolicy,
};
use super::settings::{ImageRef, PortMapping, VolumeBind};
use crate::broker::{
    ensure_kind, BackendAddress, Broker, BrokerFactory, InstanceStatus, ReconcilePlan,
};
use crate::error::FleetError;
use crate::spec::{BackendConfig, DockerSettings, InstanceSpec, PullPolicy, Timeouts};

/// Interval between container state polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

const KIND: &str = "docker";

/// Opens an Engine API client for a Docker host string.
pub type DockerConnector =
    Arc<dyn Fn(&str) -> Result<Arc<dyn ContainerApi>, DockerError> + Send + Sync>;

/// `None` while the pull is in flight.
type PullState = Option<Result<(), String>>;

fn default_connector() -> DockerConnector {
    Arc::new(|host: &str| {
        let client: Arc<dyn ContainerApi> = Arc::new(DockerClient::new(host)?);
        Ok(client)
    })
}

fn docker_settings(spec: &InstanceSpec) -> Result<&DockerSettings, FleetError> {
    match &spec.backend {
        BackendConfig::Docker(settings) => Ok(settings),
        other => Err(FleetError::KindMismatch {
            expected: KIND.to_string(),
            actual: other.kind().to_string(),
        }),
    }
}

fn status_from_state(state: &str) -> InstanceStatus {
    match state {
        "running" => InstanceStatus::Running,
        "restarting" | "created" | "paused" | "exited" | "removing" | "dead" => {
            InstanceStatus::Stopped
        }
        _ => InstanceStatus::Unknown,
    }
}

/// Live container state string, `None` if the container does not exist.
async fn container_state(
    client: &dyn ContainerApi,
    name: &str,
) -> Result<Option<String>, FleetError> {
    match client.inspect_container(name).await {
        Ok(inspect) => Ok(Some(inspect.state.status)),
        Err(DockerError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn acquire_image(
    client: &dyn ContainerApi,
    image: &ImageRef,
    policy: PullPolicy,
) -> Result<(), DockerError> {
    match policy {
        PullPolicy::Always => client.pull_image(image).await,
        PullPolicy::IfNotPresent => match client.inspect_image(image).await {
            Ok(()) => Ok(()),
            Err(DockerError::NotFound(_)) => {
                info!(image = %image, "Image not present, pulling");
                client.pull_image(image).await
            }
            Err(e) => Err(e),
        },
        PullPolicy::Never => Ok(()),
    }
}

fn desired_ports(settings: &DockerSettings) -> Result<Vec<PortMapping>, FleetError> {
    settings.ports.iter().map(|p| PortMapping::parse(p)).collect()
}

fn desired_binds(settings: &DockerSettings) -> Result<BTreeSet<String>, FleetError> {
    settings
        .volumes
        .iter()
        .map(|v| VolumeBind::parse(v).map(|b| b.to_string()))
        .collect()
}

fn desired_env(settings: &DockerSettings) -> BTreeSet<String> {
    settings
        .env
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect()
}

fn port_set(ports: &[PortMapping]) -> BTreeSet<(String, String, String)> {
    ports
        .iter()
        .map(|p| (p.port_key(), p.host_ip.clone(), p.host_port.clone()))
        .collect()
}

fn live_port_set(inspect: &ContainerInspect) -> BTreeSet<(String, String, String)> {
    let mut set = BTreeSet::new();
    for (key, bindings) in inspect.host_config.port_bindings.iter().flatten() {
        for binding in bindings.iter().flatten() {
            set.insert((key.clone(), binding.host_ip.clone(), binding.host_port.clone()));
        }
    }
    set
}

/// Build the create request for `settings`.
fn create_request(settings: &DockerSettings) -> Result<CreateContainer, FleetError> {
    let ports = desired_ports(settings)?;
    let mut body = CreateContainer {
        image: ImageRef::parse(&settings.image).to_string(),
        env: desired_env(settings).into_iter().collect(),
        tty: true,
        open_stdin: true,
        host_config: CreateHostConfig {
            binds: desired_binds(settings)?.into_iter().collect(),
            restart_policy: RestartPolicy {
                name: "unless-stopped".to_string(),
            },
            ..Default::default()
        },
        ..Default::default()
    };
    for port in &ports {
        body.exposed_ports
            .insert(port.port_key(), serde_json::Value::Object(Default::default()));
        body.host_config
            .port_bindings
            .entry(port.port_key())
            .or_default()
            .push(port.binding());
    }
    Ok(body)
}

/// Broker for one container, named after the instance.
pub struct DockerBroker {
    name: String,
    spec: ArcSwap<InstanceSpec>,
    settings: ArcSwap<DockerSettings>,
    client: ArcSwap<Arc<dyn ContainerApi>>,
    connector: DockerConnector,
    pull: ArcSwap<watch::Receiver<PullState>>,
}

impl DockerBroker {
    /// Create a broker and start acquiring its image.
    pub fn new(spec: Arc<InstanceSpec>, connector: DockerConnector) -> Result<Self, FleetError> {
        let settings = docker_settings(&spec)?.clone();
        create_request(&settings)?;
        let client = connector(&settings.host).map_err(|e| FleetError::Config(e.to_string()))?;
        let (_, idle) = watch::channel(Some(Ok(())));

        let broker = Self {
            name: spec.name.clone(),
            spec: ArcSwap::new(spec),
            settings: ArcSwap::from_pointee(settings),
            client: ArcSwap::from_pointee(client),
            connector,
            pull: ArcSwap::from_pointee(idle),
        };
        broker.start_pull(&broker.settings.load());
        Ok(broker)
    }

    /// Create a broker that talks to `client` whatever host the spec names.
    pub fn with_client(
        spec: Arc<InstanceSpec>,
        client: Arc<dyn ContainerApi>,
    ) -> Result<Self, FleetError> {
        Self::new(spec, Arc::new(move |_: &str| Ok(Arc::clone(&client))))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Settings currently in effect.
    pub fn settings(&self) -> Arc<DockerSettings> {
        self.settings.load_full()
    }

    fn client(&self) -> Arc<dyn ContainerApi> {
        let guard = self.client.load();
        Arc::clone(&**guard)
    }

    fn timeouts(&self) -> Timeouts {
        self.spec.load().lifecycle.timeouts.clone()
    }

    /// Spawn image acquisition for `settings`, replacing any outstanding pull.
    fn start_pull(&self, settings: &DockerSettings) {
        let image = ImageRef::parse(&settings.image);
        let policy = settings.pull_policy;
        let (tx, rx) = watch::channel(None);

        if policy == PullPolicy::Never {
            debug!(instance = %self.name, image = %image, "Skipping image pull");
            tx.send_replace(Some(Ok(())));
        } else {
            let client = self.client();
            let name = self.name.clone();
            tokio::spawn(async move {
                let result = acquire_image(&*client, &image, policy).await;
                match &result {
                    Ok(()) => debug!(instance = %name, image = %image, "Image ready"),
                    Err(e) => error!(instance = %name, image = %image, error = %e, "Image pull failed"),
                }
                tx.send_replace(Some(result.map_err(|e| e.to_string())));
            });
        }

        self.pull.store(Arc::new(rx));
    }

    async fn await_pull(&self) -> Result<(), FleetError> {
        let mut rx = (**self.pull.load()).clone();
        let outcome = rx
            .wait_for(|state| state.is_some())
            .await
            .map_err(|_| FleetError::Backend(format!("image pull for {} was abandoned", self.name)))?
            .clone();
        match outcome {
            Some(Err(e)) => Err(FleetError::Backend(format!("image pull failed: {e}"))),
            _ => Ok(()),
        }
    }

    /// Swap in new settings, reconnecting and re-pulling as needed.
    fn replace_settings(
        &self,
        spec: Arc<InstanceSpec>,
        desired: DockerSettings,
        image_prefetched: bool,
    ) -> Result<(), FleetError> {
        let previous = self.settings.load_full();
        let host_changed = previous.host != desired.host;
        let image_changed = ImageRef::parse(&previous.image) != ImageRef::parse(&desired.image);
        let policy_changed = previous.pull_policy != desired.pull_policy;

        if host_changed {
            let client = (self.connector)(&desired.host)
                .map_err(|e| FleetError::Config(e.to_string()))?;
            self.client.store(Arc::new(client));
            info!(instance = %self.name, host = %desired.host, "Docker host changed");
        }

        let desired = Arc::new(desired);
        self.spec.store(spec);
        self.settings.store(Arc::clone(&desired));

        if host_changed || policy_changed || (image_changed && !image_prefetched) {
            self.start_pull(&desired);
        }
        Ok(())
    }

    async fn create_container(&self, client: &Arc<dyn ContainerApi>) -> Result<(), FleetError> {
        self.await_pull().await?;
        let body = create_request(&self.settings.load())?;
        client.create_container(&self.name, &body).await?;
        info!(instance = %self.name, image = %body.image, "Container created");
        Ok(())
    }

    async fn start_container(&self, client: &Arc<dyn ContainerApi>) -> Result<(), FleetError> {
        client.start_container(&self.name).await?;
        self.await_running(client).await?;
        info!(instance = %self.name, "Container running");
        Ok(())
    }

    async fn create_and_start(&self, client: &Arc<dyn ContainerApi>) -> Result<(), FleetError> {
        self.create_container(client).await?;
        self.start_container(client).await
    }

    async fn stop_container(&self, client: &Arc<dyn ContainerApi>) -> Result<(), FleetError> {
        match client.stop_container(&self.name).await {
            Ok(()) => {}
            Err(DockerError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        self.await_stopped(client).await?;
        info!(instance = %self.name, "Container stopped");
        Ok(())
    }

    async fn delete_container(&self, client: &Arc<dyn ContainerApi>) -> Result<(), FleetError> {
        match client.remove_container(&self.name).await {
            Ok(()) => {
                info!(instance = %self.name, "Container removed");
                Ok(())
            }
            Err(DockerError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Poll until running. `exited` first means the container crashed.
    async fn await_running(&self, client: &Arc<dyn ContainerApi>) -> Result<(), FleetError> {
        let name = self.name.as_str();
        let client = Arc::clone(client);
        wait_until(
            format!("{name} startup"),
            self.timeouts().startup(),
            POLL_INTERVAL,
            move || {
                let client = Arc::clone(&client);
                async move {
                    match container_state(&*client, name).await {
                        Ok(Some(state)) if state == "running" => Poll::Ready(()),
                        Ok(Some(state)) if state == "exited" => {
                            Poll::Abort(FleetError::Crashed(name.to_string()))
                        }
                        Ok(_) => Poll::Pending,
                        Err(e) => Poll::Abort(e),
                    }
                }
            },
        )
        .await
        .map_err(FleetError::from)
    }

    /// Poll until exited, dead or gone.
    async fn await_stopped(&self, client: &Arc<dyn ContainerApi>) -> Result<(), FleetError> {
        let name = self.name.as_str();
        let client = Arc::clone(client);
        wait_until(
            format!("{name} shutdown"),
            self.timeouts().shutdown(),
            POLL_INTERVAL,
            move || {
                let client = Arc::clone(&client);
                async move {
                    match container_state(&*client, name).await {
                        Ok(None) => Poll::Ready(()),
                        Ok(Some(state)) if state == "exited" || state == "dead" => Poll::Ready(()),
                        Ok(Some(_)) => Poll::Pending,
                        Err(e) => Poll::Abort(e),
                    }
                }
            },
        )
        .await
        .map_err(FleetError::from)
    }

    fn unknown_state(&self, state: &str) -> FleetError {
        FleetError::UnknownState {
            name: self.name.clone(),
            state: state.to_string(),
        }
    }
}

#[async_trait]
impl Broker for DockerBroker {
    fn kind(&self) -> &str {
        KIND
    }

    async fn status(&self) -> InstanceStatus {
        match container_state(&*self.client(), &self.name).await {
            Ok(Some(state)) => status_from_state(&state),
            Ok(None) => InstanceStatus::Removed,
            Err(e) => {
                warn!(instance = %self.name, error = %e, "Failed to inspect container");
                InstanceStatus::Unknown
            }
        }
    }

    fn address(&self) -> Result<BackendAddress, FleetError> {
        BackendAddress::parse(&self.name, self.settings.load().address.as_deref())
    }

    async fn start_server(&self) -> Result<(), FleetError> {
        let client = self.client();
        let state = container_state(&*client, &self.name).await?;
        debug!(instance = %self.name, state = ?state, "Starting container");

        match state.as_deref() {
            Some("running") => Ok(()),
            Some("restarting") => self.await_running(&client).await,
            Some("created" | "paused" | "exited") => self.start_container(&client).await,
            Some("removing") => {
                self.await_stopped(&client).await?;
                match container_state(&*client, &self.name).await? {
                    None => self.create_and_start(&client).await,
                    Some(_) => self.start_container(&client).await,
                }
            }
            Some("dead") => {
                self.delete_container(&client).await?;
                self.create_and_start(&client).await
            }
            None => self.create_and_start(&client).await,
            Some(other) => Err(self.unknown_state(other)),
        }
    }

    async fn stop_server(&self) -> Result<(), FleetError> {
        let client = self.client();
        let state = container_state(&*client, &self.name).await?;
        debug!(instance = %self.name, state = ?state, "Stopping container");

        match state.as_deref() {
            Some("running" | "restarting") => self.stop_container(&client).await,
            Some("created" | "paused" | "exited") | None => Ok(()),
            Some("removing") => self.await_stopped(&client).await,
            Some("dead") => self.delete_container(&client).await,
            Some(other) => Err(self.unknown_state(other)),
        }
    }

    async fn remove_server(&self) -> Result<(), FleetError> {
        self.stop_server().await?;
        self.delete_container(&self.client()).await
    }

    async fn reconcile(&self, spec: Arc<InstanceSpec>) -> Result<ReconcilePlan, FleetError> {
        ensure_kind(KIND, &spec)?;
        let desired = docker_settings(&spec)?.clone();
        let ports = desired_ports(&desired)?;
        let binds = desired_binds(&desired)?;

        let inspect = match self.client().inspect_container(&self.name).await {
            Ok(inspect) => inspect,
            Err(DockerError::NotFound(_)) => {
                debug!(instance = %self.name, "No container, adopting new settings");
                self.replace_settings(spec, desired, false)?;
                return Ok(ReconcilePlan::NoOp);
            }
            Err(e) => return Err(e.into()),
        };

        let current = self.settings.load_full();
        let host_changed = current.host != desired.host;
        let image_changed =
            ImageRef::parse(&inspect.config.image) != ImageRef::parse(&desired.image);
        let ports_changed = live_port_set(&inspect) != port_set(&ports);
        let live_binds: BTreeSet<String> =
            inspect.host_config.binds.iter().flatten().cloned().collect();
        let volumes_changed = live_binds != binds;
        let live_env: BTreeSet<String> = inspect.config.env.iter().flatten().cloned().collect();
        let env_changed = !desired_env(&desired).is_subset(&live_env);

        if image_changed && !host_changed {
            self.start_pull(&desired);
        }

        if image_changed || host_changed || ports_changed || volumes_changed || env_changed {
            info!(
                instance = %self.name,
                image_changed,
                host_changed,
                ports_changed,
                volumes_changed,
                env_changed,
                "Container drifted from spec"
            );
            Ok(ReconcilePlan::Recreate {
                spec,
                was_running: inspect.state.status == "running",
            })
        } else {
            Ok(ReconcilePlan::UpdateBookkeeping(spec))
        }
    }

    async fn apply_plan(&self, plan: ReconcilePlan) -> Result<(), FleetError> {
        match plan {
            ReconcilePlan::NoOp => Ok(()),
            ReconcilePlan::UpdateBookkeeping(spec) => {
                let desired = docker_settings(&spec)?.clone();
                self.replace_settings(spec, desired, false)
            }
            ReconcilePlan::Recreate { spec, was_running } => {
                let desired = docker_settings(&spec)?.clone();
                info!(instance = %self.name, was_running, "Recreating container");

                self.remove_server().await?;
                self.replace_settings(spec, desired, true)?;

                let client = self.client();
                self.create_container(&client).await?;
                if was_running {
                    self.start_container(&client).await?;
                }
                Ok(())
            }
        }
    }
}

/// Builds [`DockerBroker`]s, one Engine client per broker.
pub struct DockerBrokerFactory {
    connector: DockerConnector,
}

impl DockerBrokerFactory {
    pub fn new() -> Self {
        Self {
            connector: default_connector(),
        }
    }

    pub fn with_connector(connector: DockerConnector) -> Self {
        Self { connector }
    }

    /// Factory whose brokers all share `client`.
    pub fn with_client(client: Arc<dyn ContainerApi>) -> Self {
        Self::with_connector(Arc::new(move |_: &str| Ok(Arc::clone(&client))))
    }
}

impl Default for DockerBrokerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerFactory for DockerBrokerFactory {
    fn create(&self, spec: Arc<InstanceSpec>) -> Result<Arc<dyn Broker>, FleetError> {
        let broker = DockerBroker::new(spec, Arc::clone(&self.connector))?;
        Ok(Arc::new(broker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("running", InstanceStatus::Running)]
    #[case("restarting", InstanceStatus::Stopped)]
    #[case("created", InstanceStatus::Stopped)]
    #[case("paused", InstanceStatus::Stopped)]
    #[case("exited", InstanceStatus::Stopped)]
    #[case("removing", InstanceStatus::Stopped)]
    #[case("dead", InstanceStatus::Stopped)]
    #[case("frozen", InstanceStatus::Unknown)]
    fn test_status_mapping(#[case] state: &str, #[case] expected: InstanceStatus) {
        assert_eq!(status_from_state(state), expected);
    }

    #[test]
    fn test_create_request() {
        let settings = DockerSettings {
            image: "itzg/minecraft-server".to_string(),
            ports: vec!["25566:25565".to_string(), "19132/udp".to_string()],
            volumes: vec!["/srv/lobby:/data".to_string()],
            env: [("EULA".to_string(), "TRUE".to_string())].into(),
            ..Default::default()
        };
        let body = create_request(&settings).unwrap();

        assert_eq!(body.image, "itzg/minecraft-server:latest");
        assert_eq!(body.env, vec!["EULA=TRUE"]);
        assert!(body.tty);
        assert!(body.open_stdin);
        assert_eq!(body.host_config.restart_policy.name, "unless-stopped");
        assert_eq!(body.host_config.binds, vec!["/srv/lobby:/data"]);
        assert_eq!(
            body.host_config.port_bindings["25565/tcp"][0].host_port,
            "25566"
        );
        assert!(body.exposed_ports.contains_key("19132/udp"));
    }

    #[test]
    fn test_create_request_rejects_bad_port() {
        let settings = DockerSettings {
            ports: vec!["lobby".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            create_request(&settings),
            Err(FleetError::Config(_))
        ));
    }
}
