//! warden agent
//!
//! Watches the fleet spec file, keeps every instance converged toward it and
//! serves the operator API.
//!
//! ## Architecture
//!
//! - **Spec Watcher**: Polls the spec file and emits reload events
//! - **Reload Handler**: Applies reloads to the fleet manager
//! - **Maintenance Loop**: Schedules idle shutdowns
//! - **Admin API**: Operator commands over HTTP

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use warden_agent::broker::BrokerRegistry;
use warden_agent::config::Config;
use warden_agent::endpoints::InMemoryEndpoints;
use warden_agent::loader::SpecWatcher;
use warden_agent::{admin, FleetManager, InstanceServices};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting warden agent");
    info!(
        spec_path = %config.spec_path.display(),
        admin_addr = %config.admin_addr,
        static_endpoints = config.static_endpoints.len(),
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let brokers = BrokerRegistry::with_defaults();
    let endpoints = Arc::new(InMemoryEndpoints::with_static(config.static_endpoints.clone()));
    let fleet = FleetManager::new(brokers, endpoints, InstanceServices::default());

    // Initial load, applied as a reload from the empty fleet
    let mut watcher = SpecWatcher::new(
        config.spec_path.clone(),
        config.spec_poll_interval,
        fleet.brokers().kinds(),
    );
    let initial = watcher.load().await;
    if fleet.handle_reload(initial).await.is_none() {
        error!("Initial fleet spec rejected, starting with an empty fleet");
    }

    let (reload_tx, reload_rx) = mpsc::channel(16);
    let watcher_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { watcher.run(reload_tx, shutdown_rx).await }
    });

    let reload_handle = tokio::spawn({
        let fleet = Arc::clone(&fleet);
        let shutdown_rx = shutdown_rx.clone();
        async move { fleet.run_reloads(reload_rx, shutdown_rx).await }
    });

    let maintenance_handle = tokio::spawn({
        let fleet = Arc::clone(&fleet);
        let shutdown_rx = shutdown_rx.clone();
        async move { fleet.run_maintenance(shutdown_rx).await }
    });

    let listener = tokio::net::TcpListener::bind(config.admin_addr)
        .await
        .with_context(|| format!("Failed to bind admin API on {}", config.admin_addr))?;
    info!(addr = %config.admin_addr, "Admin API listening");
    let admin_handle = tokio::spawn({
        let router = admin::router(Arc::clone(&fleet));
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = watcher_handle => {
            info!("Spec watcher exited");
        }
        _ = reload_handle => {
            info!("Reload handler exited");
        }
        _ = maintenance_handle => {
            info!("Maintenance loop exited");
        }
        result = admin_handle => {
            match result {
                Ok(Ok(())) => info!("Admin API exited normally"),
                Ok(Err(e)) => error!(error = %e, "Admin API error"),
                Err(e) => error!(error = %e, "Admin API task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    info!("warden agent shutdown complete");
    Ok(())
}
