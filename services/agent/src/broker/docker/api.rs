//! Docker Engine API client.
//!
//! Speaks the subset of the Engine API the broker needs, over either a Unix
//! socket (`unix:///var/run/docker.sock`) or plain TCP (`tcp://host:2375`).
//!
//! Reference: https://docs.docker.com/engine/api/

use std::collections::BTreeMap;

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use super::settings::ImageRef;

/// Errors from the Docker Engine API.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("Docker API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid Docker host {0:?}, expected unix:// or tcp://")]
    InvalidHost(String),

    #[error("image pull failed: {0}")]
    Pull(String),
}

impl From<hyper::http::Error> for DockerError {
    fn from(err: hyper::http::Error) -> Self {
        DockerError::Api {
            status: 0,
            message: err.to_string(),
        }
    }
}

/// `GET /containers/{name}/json`, reduced to the fields the broker reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    #[serde(default)]
    pub state: ContainerState,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default)]
    pub host_config: HostConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    /// created, restarting, running, removing, paused, exited or dead.
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub env: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    #[serde(default)]
    pub binds: Option<Vec<String>>,
    #[serde(default)]
    pub port_bindings: Option<BTreeMap<String, Option<Vec<PortBinding>>>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortBinding {
    #[serde(default)]
    pub host_ip: String,
    #[serde(default)]
    pub host_port: String,
}

/// `POST /containers/create` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainer {
    pub image: String,
    pub env: Vec<String>,
    pub tty: bool,
    pub open_stdin: bool,
    pub exposed_ports: BTreeMap<String, serde_json::Value>,
    pub host_config: CreateHostConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateHostConfig {
    pub binds: Vec<String>,
    pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
    pub restart_policy: RestartPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RestartPolicy {
    pub name: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// One line of the `POST /images/create` progress stream.
#[derive(Deserialize)]
struct PullProgress {
    #[serde(default)]
    error: Option<String>,
}

/// Container operations used by the broker.
///
/// `start_container` and `stop_container` treat "not modified" as success.
/// Missing containers and images surface as [`DockerError::NotFound`].
#[async_trait]
pub trait ContainerApi: Send + Sync {
    async fn inspect_container(&self, name: &str) -> Result<ContainerInspect, DockerError>;

    async fn create_container(&self, name: &str, body: &CreateContainer)
        -> Result<(), DockerError>;

    async fn start_container(&self, name: &str) -> Result<(), DockerError>;

    async fn stop_container(&self, name: &str) -> Result<(), DockerError>;

    /// Delete the container. Anonymous and bind-mounted volumes are kept.
    async fn remove_container(&self, name: &str) -> Result<(), DockerError>;

    async fn inspect_image(&self, image: &ImageRef) -> Result<(), DockerError>;

    /// Pull and wait for the pull to finish.
    async fn pull_image(&self, image: &ImageRef) -> Result<(), DockerError>;
}

enum Transport {
    Unix {
        client: Client<UnixConnector>,
        socket_path: String,
    },
    Tcp {
        client: Client<HttpConnector>,
        authority: String,
    },
}

/// Engine API client for one Docker host.
pub struct DockerClient {
    host: String,
    transport: Transport,
}

impl DockerClient {
    /// Create a client for `unix:///path/to/socket` or `tcp://host:port`.
    pub fn new(host: &str) -> Result<Self, DockerError> {
        let transport = if let Some(socket_path) = host.strip_prefix("unix://") {
            Transport::Unix {
                client: Client::unix(),
                socket_path: socket_path.to_string(),
            }
        } else if let Some(authority) = host
            .strip_prefix("tcp://")
            .or_else(|| host.strip_prefix("http://"))
        {
            Transport::Tcp {
                client: Client::new(),
                authority: authority.trim_end_matches('/').to_string(),
            }
        } else {
            return Err(DockerError::InvalidHost(host.to_string()));
        };

        Ok(Self {
            host: host.to_string(),
            transport,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn uri(&self, path: &str) -> Result<hyper::Uri, DockerError> {
        match &self.transport {
            Transport::Unix { socket_path, .. } => Ok(hyperlocal::Uri::new(socket_path, path).into()),
            Transport::Tcp { authority, .. } => format!("http://{authority}{path}")
                .parse()
                .map_err(|e: hyper::http::uri::InvalidUri| DockerError::Api {
                    status: 0,
                    message: e.to_string(),
                }),
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes), DockerError> {
        let uri = self.uri(path)?;

        debug!(method = %method, path = path, "Docker API request");

        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        let request = match body {
            Some(bytes) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(bytes))?,
            None => builder.body(Body::empty())?,
        };

        let response = match &self.transport {
            Transport::Unix { client, .. } => client.request(request).await?,
            Transport::Tcp { client, .. } => client.request(request).await?,
        };
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await?;
        Ok((status, body))
    }

    fn api_error(status: StatusCode, body: &[u8], what: &str) -> DockerError {
        if status == StatusCode::NOT_FOUND {
            return DockerError::NotFound(what.to_string());
        }
        let message = serde_json::from_slice::<ErrorBody>(body)
            .map(|b| b.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());
        error!(status = %status, message = %message, "Docker API error");
        DockerError::Api {
            status: status.as_u16(),
            message,
        }
    }

    async fn post_action(&self, name: &str, action: &str) -> Result<(), DockerError> {
        let (status, body) = self
            .send(Method::POST, &format!("/containers/{name}/{action}"), None)
            .await?;
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            Ok(())
        } else {
            Err(Self::api_error(status, &body, name))
        }
    }
}

#[async_trait]
impl ContainerApi for DockerClient {
    async fn inspect_container(&self, name: &str) -> Result<ContainerInspect, DockerError> {
        let (status, body) = self
            .send(Method::GET, &format!("/containers/{name}/json"), None)
            .await?;
        if status.is_success() {
            Ok(serde_json::from_slice(&body)?)
        } else {
            Err(Self::api_error(status, &body, name))
        }
    }

    async fn create_container(
        &self,
        name: &str,
        body: &CreateContainer,
    ) -> Result<(), DockerError> {
        let payload = serde_json::to_vec(body)?;
        let (status, response) = self
            .send(
                Method::POST,
                &format!("/containers/create?name={name}"),
                Some(payload),
            )
            .await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::api_error(status, &response, &body.image))
        }
    }

    async fn start_container(&self, name: &str) -> Result<(), DockerError> {
        self.post_action(name, "start").await
    }

    async fn stop_container(&self, name: &str) -> Result<(), DockerError> {
        self.post_action(name, "stop").await
    }

    async fn remove_container(&self, name: &str) -> Result<(), DockerError> {
        let (status, body) = self
            .send(Method::DELETE, &format!("/containers/{name}?v=false"), None)
            .await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::api_error(status, &body, name))
        }
    }

    async fn inspect_image(&self, image: &ImageRef) -> Result<(), DockerError> {
        let (status, body) = self
            .send(Method::GET, &format!("/images/{image}/json"), None)
            .await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::api_error(status, &body, &image.to_string()))
        }
    }

    async fn pull_image(&self, image: &ImageRef) -> Result<(), DockerError> {
        let path = match image.tag() {
            Some(tag) => format!("/images/create?fromImage={}&tag={tag}", image.repository()),
            None => format!("/images/create?fromImage={image}"),
        };
        let (status, body) = self.send(Method::POST, &path, None).await?;
        if !status.is_success() {
            return Err(Self::api_error(status, &body, &image.to_string()));
        }

        // Failures after the headers arrive are reported inside the progress stream.
        for line in body.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            if let Ok(PullProgress { error: Some(e) }) = serde_json::from_slice(line) {
                return Err(DockerError::Pull(e));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_host_schemes() {
        assert!(DockerClient::new("unix:///var/run/docker.sock").is_ok());
        assert!(DockerClient::new("tcp://127.0.0.1:2375").is_ok());
        assert!(matches!(
            DockerClient::new("/var/run/docker.sock"),
            Err(DockerError::InvalidHost(_))
        ));
    }

    #[test]
    fn test_tcp_uri() {
        let client = DockerClient::new("tcp://10.0.0.5:2375/").unwrap();
        let uri = client.uri("/containers/lobby/json").unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.5:2375/containers/lobby/json");
    }

    #[test]
    fn test_inspect_decodes_nulls() {
        let json = r#"{
            "State": {"Status": "running", "Running": true},
            "Config": {"Image": "nginx:latest", "Env": null},
            "HostConfig": {"Binds": null, "PortBindings": {"80/tcp": null}}
        }"#;
        let inspect: ContainerInspect = serde_json::from_str(json).unwrap();
        assert_eq!(inspect.state.status, "running");
        assert_eq!(inspect.config.image, "nginx:latest");
        assert!(inspect.config.env.is_none());
        assert!(inspect.host_config.binds.is_none());
    }

    #[test]
    fn test_create_body_field_names() {
        let body = CreateContainer {
            image: "nginx:latest".to_string(),
            tty: true,
            open_stdin: true,
            host_config: CreateHostConfig {
                restart_policy: RestartPolicy {
                    name: "unless-stopped".to_string(),
                },
                ..Default::default()
            },
            ..Default::default()
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["Tty"], true);
        assert_eq!(json["OpenStdin"], true);
        assert_eq!(json["HostConfig"]["RestartPolicy"]["Name"], "unless-stopped");
    }
}
