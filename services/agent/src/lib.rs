//! warden agent library
//!
//! The agent keeps a fleet of backend instances converged toward a live spec
//! file and starts, stops and rebuilds them on demand.
//!
//! ## Architecture
//!
//! ```text
//! SpecWatcher ──SpecReload──▶ FleetManager ──▶ Instance ──▶ Broker (docker | cmd | jar)
//!                                  ▲
//!                      admin API ──┘
//! ```
//!
//! ## Modules
//!
//! - `broker`: backend drivers and the kind registry
//! - `instance`: per-instance lifecycle policy (pinning, idle shutdown, deferred reconciliation)
//! - `fleet`: the instance registry and reload handling
//! - `loader`: spec file parsing and change detection
//! - `admin`: operator HTTP API

pub mod admin;
pub mod broker;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod fleet;
pub mod instance;
pub mod loader;
pub mod probe;
pub mod spec;

pub use error::FleetError;
pub use fleet::{FleetManager, ReloadReport};
pub use instance::{Instance, InstanceServices, InstanceSummary};
pub use spec::{FleetSpec, InstanceSpec, SpecReload};
