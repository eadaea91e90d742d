//! fleetd - fleet connection supervisor daemon.
//!
//! Keeps every instance in the roster connected, repairs broken sessions
//! and restores their modes after each reconnect.
//!
//! ## Architecture
//!
//! - **Instance Pool**: one supervisor actor per roster entry
//! - **Aggregate Relay**: republishes the fleet summary on every status change
//! - **Status Loop**: logs fleet health periodically

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_supervisor::config::Config;
use fleet_supervisor::connection::{LineConnector, TcpProber};
use fleet_supervisor::modes::CommandEffector;
use fleet_supervisor::remote::UnconfiguredRemote;
use fleet_supervisor::roster::SqliteRoster;
use fleet_supervisor::status_loop::run_status_loop;
use fleet_supervisor::{InstancePool, PoolDeps, StatusBroadcaster};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        roster_path = %config.roster_path,
        status_interval_secs = config.status_interval_secs,
        "Starting fleetd"
    );

    if let Some(parent) = Path::new(&config.roster_path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let roster = SqliteRoster::open(&config.roster_path)
        .with_context(|| format!("failed to open roster at {}", config.roster_path))?;

    let pool = Arc::new(InstancePool::new(PoolDeps {
        connector: Arc::new(LineConnector::new()),
        prober: Arc::new(TcpProber::new()),
        effector: Arc::new(CommandEffector),
        remote: Arc::new(UnconfiguredRemote),
        roster: Arc::new(roster),
        broadcaster: Arc::new(StatusBroadcaster::default()),
        timings: config.timings.clone(),
    }));

    let loaded = pool.start().await.context("failed to load roster")?;
    info!(instances = loaded, "Roster loaded");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let relay_handle = pool.spawn_aggregate_relay();
    let status_handle = tokio::spawn({
        let pool = Arc::clone(&pool);
        let interval = Duration::from_secs(config.status_interval_secs);
        async move { run_status_loop(pool, interval, shutdown_rx).await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = status_handle => {
            match result {
                Ok(Ok(())) => info!("Status loop exited normally"),
                Ok(Err(e)) => error!(error = %e, "Status loop error"),
                Err(e) => error!(error = %e, "Status loop task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    pool.shutdown().await;
    relay_handle.abort();

    info!("fleetd shutdown complete");
    Ok(())
}
