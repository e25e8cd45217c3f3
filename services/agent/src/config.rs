//! Configuration for the warden agent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::broker::BackendAddress;

/// Shortest accepted spec poll interval.
pub const MIN_SPEC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Fleet spec file.
    pub spec_path: PathBuf,

    /// Interval between spec file checks.
    pub spec_poll_interval: Duration,

    /// Admin API listen address.
    pub admin_addr: SocketAddr,

    /// Endpoints the proxy knows without a managed instance.
    pub static_endpoints: Vec<(String, BackendAddress)>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let spec_path = std::env::var("WARDEN_SPEC_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("warden.toml"));

        let spec_poll_interval = std::env::var("WARDEN_SPEC_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(5))
            .max(MIN_SPEC_POLL_INTERVAL);

        let admin_addr = std::env::var("WARDEN_ADMIN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:7878".to_string())
            .parse()
            .context("Invalid WARDEN_ADMIN_ADDR")?;

        let static_endpoints = match std::env::var("WARDEN_STATIC_ENDPOINTS") {
            Ok(raw) => parse_static_endpoints(&raw).context("Invalid WARDEN_STATIC_ENDPOINTS")?,
            Err(_) => Vec::new(),
        };

        let log_level = std::env::var("WARDEN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            spec_path,
            spec_poll_interval,
            admin_addr,
            static_endpoints,
            log_level,
        })
    }
}

/// Parse `name=host:port,name=host:port`.
pub fn parse_static_endpoints(raw: &str) -> Result<Vec<(String, BackendAddress)>> {
    let mut endpoints = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((name, address)) = entry.split_once('=') else {
            bail!("expected name=host:port, got {entry:?}");
        };
        let name = name.trim();
        if name.is_empty() {
            bail!("missing endpoint name in {entry:?}");
        }
        let address = BackendAddress::parse(name, Some(address.trim()))?;
        endpoints.push((name.to_string(), address));
    }
    Ok(endpoints)
}
