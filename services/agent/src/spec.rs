//! Declarative fleet specification.
//!
//! A [`FleetSpec`] is decoded from TOML at the loader boundary. Every value in
//! here is immutable once loaded; a new version of an instance is a full
//! replacement shared through `Arc<InstanceSpec>`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::de::{Deserializer, Error as _};
use serde::{Deserialize, Serialize};

/// Default seconds between idle sweeps.
pub const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 300;

/// The whole desired fleet.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FleetSpec {
    /// Desired instances. Names are unique within a fleet.
    #[serde(default)]
    pub instances: Vec<InstanceSpec>,

    /// Seconds between idle sweeps.
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

impl Default for FleetSpec {
    fn default() -> Self {
        Self {
            instances: Vec::new(),
            maintenance_interval_secs: DEFAULT_MAINTENANCE_INTERVAL_SECS,
        }
    }
}

impl FleetSpec {
    /// Parse a fleet spec from TOML text. Blank input is the empty fleet.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        toml::from_str(text)
    }

    /// Look up an instance by name.
    pub fn instance(&self, name: &str) -> Option<&InstanceSpec> {
        self.instances.iter().find(|i| i.name == name)
    }

    /// Sweep interval as a `Duration`, never shorter than one second.
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }
}

fn default_maintenance_interval() -> u64 {
    DEFAULT_MAINTENANCE_INTERVAL_SECS
}

/// One desired instance.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceSpec {
    /// Unique name, also used as the container name.
    pub name: String,

    /// Backend driver and its settings.
    pub backend: BackendConfig,

    /// Cross-backend lifecycle policy.
    #[serde(default)]
    pub lifecycle: LifecycleSettings,
}

impl InstanceSpec {
    /// Backend kind tag (`docker`, `cmd`, `jar`, ...).
    pub fn kind(&self) -> &str {
        self.backend.kind()
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

/// Backend configuration, tagged by `kind`.
///
/// Kinds compiled into the agent decode into typed settings. Any other kind is
/// kept as a raw table so that additionally registered drivers can decode it
/// themselves.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendConfig {
    Docker(DockerSettings),
    Cmd(CommandSettings),
    Jar(JarSettings),
    Custom { kind: String, settings: toml::Table },
}

impl BackendConfig {
    pub fn kind(&self) -> &str {
        match self {
            BackendConfig::Docker(_) => "docker",
            BackendConfig::Cmd(_) => "cmd",
            BackendConfig::Jar(_) => "jar",
            BackendConfig::Custom { kind, .. } => kind,
        }
    }
}

impl<'de> Deserialize<'de> for BackendConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut table = toml::Table::deserialize(deserializer)?;
        let kind = match table.remove("kind") {
            Some(toml::Value::String(kind)) => kind,
            Some(other) => {
                return Err(D::Error::custom(format!(
                    "backend kind must be a string, got {}",
                    other.type_str()
                )))
            }
            None => return Err(D::Error::missing_field("kind")),
        };

        match kind.as_str() {
            "docker" => toml::Value::Table(table)
                .try_into()
                .map(BackendConfig::Docker)
                .map_err(|e| D::Error::custom(format!("docker backend: {e}"))),
            "cmd" => toml::Value::Table(table)
                .try_into()
                .map(BackendConfig::Cmd)
                .map_err(|e| D::Error::custom(format!("cmd backend: {e}"))),
            "jar" => toml::Value::Table(table)
                .try_into()
                .map(BackendConfig::Jar)
                .map_err(|e| D::Error::custom(format!("jar backend: {e}"))),
            _ => Ok(BackendConfig::Custom {
                kind,
                settings: table,
            }),
        }
    }
}

/// When to pull the container image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

/// Settings for the `docker` backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DockerSettings {
    /// Endpoint the proxy should route to (`host:port`).
    #[serde(default)]
    pub address: Option<String>,

    #[serde(default = "default_image")]
    pub image: String,

    #[serde(default)]
    pub pull_policy: PullPolicy,

    /// Accepted so existing fleet files keep parsing. Creates on demand always
    /// start, and a recreate restarts only a container that was running.
    #[serde(default)]
    pub auto_start_on_create: bool,

    /// Port mappings, `[ip:][hostPort:]containerPort[/proto]`.
    #[serde(default = "default_ports")]
    pub ports: Vec<String>,

    /// Docker daemon, `unix:///path` or `tcp://host:port`.
    #[serde(default = "default_docker_host")]
    pub host: String,

    /// Bind mounts, `host:container[:mode]`.
    #[serde(default)]
    pub volumes: Vec<String>,

    #[serde(default = "default_env")]
    pub env: BTreeMap<String, String>,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            address: None,
            image: default_image(),
            pull_policy: PullPolicy::default(),
            auto_start_on_create: false,
            ports: default_ports(),
            host: default_docker_host(),
            volumes: Vec::new(),
            env: default_env(),
        }
    }
}

fn default_image() -> String {
    "itzg/minecraft-server".to_string()
}

fn default_ports() -> Vec<String> {
    vec!["25565:25565".to_string()]
}

fn default_docker_host() -> String {
    "unix:///var/run/docker.sock".to_string()
}

fn default_env() -> BTreeMap<String, String> {
    BTreeMap::from([("ONLINE_MODE".to_string(), "false".to_string())])
}

/// Settings for the `cmd` backend: run an argv as a child process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSettings {
    /// Program followed by its arguments.
    pub command: Vec<String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub address: Option<String>,
}

/// Settings for the `jar` backend, sugar over `cmd`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JarSettings {
    pub jar_file: String,

    #[serde(default = "default_java")]
    pub java: String,

    #[serde(default)]
    pub java_flags: Vec<String>,

    /// Arguments passed to the jar itself.
    #[serde(default)]
    pub flags: Vec<String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub address: Option<String>,
}

fn default_java() -> String {
    "java".to_string()
}

impl JarSettings {
    /// Expand to `java <java_flags> -jar <jar_file> <flags>`.
    pub fn to_command(&self) -> CommandSettings {
        let mut command = Vec::with_capacity(self.java_flags.len() + self.flags.len() + 3);
        command.push(self.java.clone());
        command.extend(self.java_flags.iter().cloned());
        command.push("-jar".to_string());
        command.push(self.jar_file.clone());
        command.extend(self.flags.iter().cloned());

        CommandSettings {
            command,
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            address: self.address.clone(),
        }
    }
}

/// When a pending reconciliation is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileBehavior {
    /// After the grace period, restarting the backend if needed.
    Force,
    /// The next time the instance is stopped.
    #[default]
    OnStop,
}

/// What an idle shutdown does to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownBehavior {
    #[default]
    Stop,
    Remove,
}

/// Bounded waits and grace periods, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    pub startup_secs: u64,
    pub shutdown_secs: u64,
    pub reconciliation_grace_period_secs: u64,
    /// Negative disables idle shutdown.
    pub inactive_grace_period_secs: i64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            startup_secs: 120,
            shutdown_secs: 120,
            reconciliation_grace_period_secs: 60,
            inactive_grace_period_secs: 300,
        }
    }
}

impl Timeouts {
    pub fn startup(&self) -> Duration {
        Duration::from_secs(self.startup_secs)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs)
    }

    pub fn reconciliation_grace(&self) -> Duration {
        Duration::from_secs(self.reconciliation_grace_period_secs)
    }
}

/// Cross-backend lifecycle policy for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LifecycleSettings {
    pub timeouts: Timeouts,
    pub allow_auto_start: bool,
    pub allow_auto_stop: bool,
    pub reconciliation_behavior: ReconcileBehavior,
    pub shutdown_behavior: ShutdownBehavior,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            allow_auto_start: true,
            allow_auto_stop: true,
            reconciliation_behavior: ReconcileBehavior::default(),
            shutdown_behavior: ShutdownBehavior::default(),
        }
    }
}

/// A spec change emitted by the loader.
#[derive(Debug, Clone)]
pub struct SpecReload {
    pub old: Arc<FleetSpec>,
    pub new: Arc<FleetSpec>,
    /// False when the new spec failed to parse or a guard vetoed it.
    pub allowed: bool,
}
