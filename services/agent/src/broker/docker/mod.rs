//! Docker container backend.
//!
//! - `api`: Engine API client over a Unix socket or TCP
//! - `settings`: port, volume and image reference parsing
//! - `broker`: the container lifecycle state machine and drift detection
//! - `mock`: an in-memory Engine for tests

mod api;
mod broker;
mod mock;
mod settings;

pub use api::{
    ContainerApi, ContainerConfig, ContainerInspect, ContainerState, CreateContainer,
    CreateHostConfig, DockerClient, DockerError, HostConfig, PortBinding, RestartPolicy,
};
pub use broker::{DockerBroker, DockerBrokerFactory, DockerConnector, POLL_INTERVAL};
pub use mock::{MockDocker, MockDockerCall};
pub use settings::{ImageRef, PortMapping, VolumeBind};
