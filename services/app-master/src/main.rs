//! roost Application Master
//!
//! Keeps one distributed application's running footprint in sync with the
//! operator-declared role targets, requesting and releasing containers from
//! the cluster resource manager and supervising the role processes forked
//! into them.
//!
//! ## Architecture
//!
//! - **Reconciliation Loop**: single owner of all role counters, fed by a
//!   bounded event channel
//! - **Role History**: placement-affinity records, persisted across restarts
//! - **Process Supervisors**: per-instance forked-process lifecycle with
//!   timeout watchdogs

use std::sync::Arc;

use anyhow::Result;
use roost_master::config::Config;
use roost_master::master::ApplicationMaster;
use roost_master::rm::MockResourceManager;
use roost_master::state::AppState;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting roost application master");

    // Load configuration
    let config = Config::from_env()?;
    info!(
        roles = %config.role_set_path.display(),
        heartbeat_secs = config.heartbeat_interval_secs,
        "Configuration loaded"
    );

    // Validate the operator target before touching the resource manager.
    let role_set = config.load_role_set()?;
    let launcher = Arc::new(config.load_launcher()?);

    // Thaw placement history from the previous incarnation, if any.
    let history = match &config.history_path {
        Some(path) => roost_placement::load_history(path, config.anti_affinity_limit)?,
        None => roost_placement::RoleHistory::new(config.anti_affinity_limit),
    };

    let state = AppState::new(&role_set, history, config.unanswered_warn_ticks)?;

    // Resource manager client (mock for now)
    let rm = Arc::new(MockResourceManager::new());

    let (master, _gateway, _snapshot_rx) = ApplicationMaster::new(&config, state, rm, launcher);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let master_handle = tokio::spawn(master.run(shutdown_rx));

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = master_handle => {
            match result {
                Ok(Ok(())) => info!("Reconciliation loop exited normally"),
                Ok(Err(e)) => error!(error = %e, "Reconciliation loop error"),
                Err(e) => error!(error = %e, "Reconciliation task panicked"),
            }
        }
    }

    // Signal shutdown to the loop
    let _ = shutdown_tx.send(true);

    // Give supervised processes time to stop gracefully
    info!("Waiting for shutdown...");
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    info!("Application master shutdown complete");
    Ok(())
}
