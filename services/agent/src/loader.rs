//! Fleet spec file loading and change detection.
//!
//! The watcher polls the spec file's modification time and emits a
//! [`SpecReload`] whenever the parsed spec changes. A file that fails to
//! parse, or names a backend kind no broker is registered for, produces a
//! denied reload so the fleet stays as it is.

use std::collections::{BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::spec::{FleetSpec, SpecReload};

/// Errors loading a fleet spec file.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("instance {name}: no broker registered for kind {kind:?}")]
    UnknownKind { name: String, kind: String },

    #[error("instance name {0:?} is used more than once")]
    DuplicateName(String),
}

/// Veto hook consulted before a reload is emitted.
pub trait ReloadGuard: Send + Sync {
    /// Return false to deny `reload`.
    fn allow(&self, reload: &SpecReload) -> bool;
}

/// Read and validate a fleet spec. A missing file is the empty fleet.
pub async fn load_spec(path: &Path, known_kinds: &BTreeSet<String>) -> Result<FleetSpec, SpecError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Spec file missing, using empty fleet");
            return Ok(FleetSpec::default());
        }
        Err(source) => {
            return Err(SpecError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let spec = FleetSpec::from_toml(&text).map_err(|source| SpecError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    validate(&spec, known_kinds)?;
    Ok(spec)
}

fn validate(spec: &FleetSpec, known_kinds: &BTreeSet<String>) -> Result<(), SpecError> {
    let mut seen = HashSet::new();
    for instance in &spec.instances {
        if !seen.insert(instance.name.as_str()) {
            return Err(SpecError::DuplicateName(instance.name.clone()));
        }
        if !known_kinds.contains(instance.kind()) {
            return Err(SpecError::UnknownKind {
                name: instance.name.clone(),
                kind: instance.kind().to_string(),
            });
        }
    }
    Ok(())
}

/// Polls a spec file and turns changes into reload events.
pub struct SpecWatcher {
    path: PathBuf,
    poll_interval: Duration,
    known_kinds: BTreeSet<String>,
    guards: Vec<Arc<dyn ReloadGuard>>,
    current: Arc<FleetSpec>,
    last_modified: Option<SystemTime>,
}

impl SpecWatcher {
    pub fn new(
        path: impl Into<PathBuf>,
        poll_interval: Duration,
        known_kinds: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            known_kinds: known_kinds.into_iter().collect(),
            guards: Vec::new(),
            current: Arc::new(FleetSpec::default()),
            last_modified: None,
        }
    }

    pub fn with_guard(mut self, guard: Arc<dyn ReloadGuard>) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last spec that was emitted as an allowed reload.
    pub fn current(&self) -> Arc<FleetSpec> {
        Arc::clone(&self.current)
    }

    async fn modified(&self) -> Option<SystemTime> {
        let metadata = tokio::fs::metadata(&self.path).await.ok()?;
        metadata.modified().ok()
    }

    /// Load the file and build a reload against the current spec.
    ///
    /// Always returns an event; the first load goes out even when the file
    /// describes the empty fleet.
    pub async fn load(&mut self) -> SpecReload {
        self.last_modified = self.modified().await;
        let old = self.current();

        let new = match load_spec(&self.path, &self.known_kinds).await {
            Ok(spec) => Arc::new(spec),
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Invalid fleet spec");
                return SpecReload {
                    new: Arc::clone(&old),
                    old,
                    allowed: false,
                };
            }
        };

        let mut reload = SpecReload {
            old,
            new,
            allowed: true,
        };
        if let Some(index) = self.guards.iter().position(|g| !g.allow(&reload)) {
            warn!(guard = index, "Spec reload vetoed");
            reload.allowed = false;
            return reload;
        }

        self.current = Arc::clone(&reload.new);
        reload
    }

    /// Check the file once. Returns an event if it changed since the last load.
    pub async fn poll(&mut self) -> Option<SpecReload> {
        let modified = self.modified().await;
        if modified == self.last_modified {
            return None;
        }

        let reload = self.load().await;
        if reload.allowed && reload.old == reload.new {
            debug!(path = %self.path.display(), "Spec file touched without changes");
            return None;
        }
        Some(reload)
    }

    /// Poll until shutdown, forwarding reloads to `tx`.
    pub async fn run(mut self, tx: mpsc::Sender<SpecReload>, mut shutdown: watch::Receiver<bool>) {
        info!(
            path = %self.path.display(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Watching fleet spec"
        );
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Some(reload) = self.poll().await {
                        if tx.send(reload).await.is_err() {
                            debug!("Reload receiver dropped, stopping watcher");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Spec watcher shutting down");
                    break;
                }
            }
        }
    }
}
