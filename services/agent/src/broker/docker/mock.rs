//! In-memory Docker Engine for tests and local development.
//!
//! State transitions after `start` and `stop` can be scripted: each scripted
//! state is reported by one successive container inspection.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::api::{
    ContainerApi, ContainerConfig, ContainerInspect, ContainerState, CreateContainer, DockerError,
    HostConfig,
};
use super::settings::ImageRef;

/// A call made against the mock, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockDockerCall {
    Inspect(String),
    Create(String),
    Start(String),
    Stop(String),
    Remove(String),
    InspectImage(String),
    Pull(String),
}

#[derive(Debug, Clone)]
struct MockContainer {
    status: String,
    body: CreateContainer,
    pending: VecDeque<String>,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    images: HashSet<String>,
    failing_pulls: HashSet<String>,
    start_scripts: HashMap<String, Vec<String>>,
    stop_scripts: HashMap<String, Vec<String>>,
    calls: Vec<MockDockerCall>,
}

/// Mock Engine API.
#[derive(Default)]
pub struct MockDocker {
    state: Mutex<MockState>,
}

impl MockDocker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a container in the given state.
    pub fn insert_container(&self, name: &str, status: &str, body: CreateContainer) {
        self.lock().containers.insert(
            name.to_string(),
            MockContainer {
                status: status.to_string(),
                body,
                pending: VecDeque::new(),
            },
        );
    }

    /// Force a container into a state, dropping any scripted transitions.
    pub fn set_status(&self, name: &str, status: &str) {
        if let Some(container) = self.lock().containers.get_mut(name) {
            container.status = status.to_string();
            container.pending.clear();
        }
    }

    /// Mark an image as already present.
    pub fn add_image(&self, image: &str) {
        self.lock()
            .images
            .insert(ImageRef::parse(image).to_string());
    }

    /// Make pulls of `image` fail.
    pub fn fail_pull(&self, image: &str) {
        self.lock()
            .failing_pulls
            .insert(ImageRef::parse(image).to_string());
    }

    /// States reported after the next start, one per inspection.
    /// Without a script a started container is `running` immediately.
    pub fn script_start(&self, name: &str, states: &[&str]) {
        self.lock().start_scripts.insert(
            name.to_string(),
            states.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// States reported after the next stop. Without a script it is `exited`.
    pub fn script_stop(&self, name: &str, states: &[&str]) {
        self.lock().stop_scripts.insert(
            name.to_string(),
            states.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// States reported by the next inspections of an existing container.
    pub fn script_states(&self, name: &str, states: &[&str]) {
        if let Some(container) = self.lock().containers.get_mut(name) {
            container.pending = states.iter().map(|s| s.to_string()).collect();
        }
    }

    /// Current state without recording a call or advancing scripts.
    pub fn status_of(&self, name: &str) -> Option<String> {
        self.lock().containers.get(name).map(|c| c.status.clone())
    }

    /// Create request the container was built from.
    pub fn container_body(&self, name: &str) -> Option<CreateContainer> {
        self.lock().containers.get(name).map(|c| c.body.clone())
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.lock()
            .images
            .contains(&ImageRef::parse(image).to_string())
    }

    pub fn calls(&self) -> Vec<MockDockerCall> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&MockDockerCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

fn inspect_of(container: &MockContainer) -> ContainerInspect {
    let body = &container.body;
    let port_bindings: BTreeMap<_, _> = body
        .host_config
        .port_bindings
        .iter()
        .map(|(k, v)| (k.clone(), Some(v.clone())))
        .collect();

    ContainerInspect {
        state: ContainerState {
            status: container.status.clone(),
        },
        config: ContainerConfig {
            image: body.image.clone(),
            env: Some(body.env.clone()),
        },
        host_config: HostConfig {
            binds: Some(body.host_config.binds.clone()),
            port_bindings: Some(port_bindings),
        },
    }
}

#[async_trait]
impl ContainerApi for MockDocker {
    async fn inspect_container(&self, name: &str) -> Result<ContainerInspect, DockerError> {
        let mut state = self.lock();
        state.calls.push(MockDockerCall::Inspect(name.to_string()));
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| DockerError::NotFound(name.to_string()))?;
        if let Some(next) = container.pending.pop_front() {
            container.status = next;
        }
        Ok(inspect_of(container))
    }

    async fn create_container(
        &self,
        name: &str,
        body: &CreateContainer,
    ) -> Result<(), DockerError> {
        let mut state = self.lock();
        state.calls.push(MockDockerCall::Create(name.to_string()));
        if state.containers.contains_key(name) {
            return Err(DockerError::Api {
                status: 409,
                message: format!("container name {name:?} is already in use"),
            });
        }
        if !state.images.contains(&body.image) {
            return Err(DockerError::NotFound(body.image.clone()));
        }
        state.containers.insert(
            name.to_string(),
            MockContainer {
                status: "created".to_string(),
                body: body.clone(),
                pending: VecDeque::new(),
            },
        );
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<(), DockerError> {
        let mut state = self.lock();
        state.calls.push(MockDockerCall::Start(name.to_string()));
        let script = state.start_scripts.remove(name);
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| DockerError::NotFound(name.to_string()))?;
        if container.status == "running" {
            return Ok(());
        }
        match script {
            Some(states) => container.pending = states.into(),
            None => container.status = "running".to_string(),
        }
        debug!(container = name, "[MOCK] Container started");
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<(), DockerError> {
        let mut state = self.lock();
        state.calls.push(MockDockerCall::Stop(name.to_string()));
        let script = state.stop_scripts.remove(name);
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| DockerError::NotFound(name.to_string()))?;
        if container.status != "running" && container.status != "restarting" {
            return Ok(());
        }
        match script {
            Some(states) => container.pending = states.into(),
            None => container.status = "exited".to_string(),
        }
        debug!(container = name, "[MOCK] Container stopped");
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<(), DockerError> {
        let mut state = self.lock();
        state.calls.push(MockDockerCall::Remove(name.to_string()));
        let status = state.containers.get(name).map(|c| c.status.clone());
        match status.as_deref() {
            None => Err(DockerError::NotFound(name.to_string())),
            Some("running") => Err(DockerError::Api {
                status: 409,
                message: format!("cannot remove running container {name}"),
            }),
            Some(_) => {
                state.containers.remove(name);
                Ok(())
            }
        }
    }

    async fn inspect_image(&self, image: &ImageRef) -> Result<(), DockerError> {
        let mut state = self.lock();
        let image = image.to_string();
        state.calls.push(MockDockerCall::InspectImage(image.clone()));
        if state.images.contains(&image) {
            Ok(())
        } else {
            Err(DockerError::NotFound(image))
        }
    }

    async fn pull_image(&self, image: &ImageRef) -> Result<(), DockerError> {
        let mut state = self.lock();
        let image = image.to_string();
        state.calls.push(MockDockerCall::Pull(image.clone()));
        if state.failing_pulls.contains(&image) {
            return Err(DockerError::Pull(format!("manifest for {image} not found")));
        }
        state.images.insert(image);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_start() {
        let docker = MockDocker::new();
        docker.insert_container("lobby", "exited", CreateContainer::default());
        docker.script_start("lobby", &["restarting", "running"]);

        docker.start_container("lobby").await.unwrap();
        assert_eq!(docker.status_of("lobby").as_deref(), Some("exited"));
        let first = docker.inspect_container("lobby").await.unwrap();
        assert_eq!(first.state.status, "restarting");
        let second = docker.inspect_container("lobby").await.unwrap();
        assert_eq!(second.state.status, "running");
        let third = docker.inspect_container("lobby").await.unwrap();
        assert_eq!(third.state.status, "running");
    }

    #[tokio::test]
    async fn test_remove_running_conflicts() {
        let docker = MockDocker::new();
        docker.insert_container("lobby", "running", CreateContainer::default());
        assert!(matches!(
            docker.remove_container("lobby").await,
            Err(DockerError::Api { status: 409, .. })
        ));
        assert!(matches!(
            docker.remove_container("missing").await,
            Err(DockerError::NotFound(_))
        ));
    }
}
