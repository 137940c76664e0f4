//! # Subnet Manager Runtime
//!
//! Brings up the sweep engine against a simulated fabric described in TOML
//! and keeps it running until Ctrl+C.
//!
//! ```text
//! SM_CONFIG ──→ SmConfig ─┐
//!                         ├──→ spawn ──→ SmHandle ──→ status log
//! SM_FABRIC ──→ FabricFile ──→ SimulatedFabric
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use sm_02_sweep::{completion_channel, spawn, SimulatedFabric, SmHandle, SubnetManagerApi};
use sm_runtime::{load_config, FabricFile, FABRIC_ENV};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Log role changes and finished sweeps until the engine stops.
async fn watch_status(sm: SmHandle) {
    let mut rx = sm.subscribe();
    let mut last = rx.borrow().clone();
    while rx.changed().await.is_ok() {
        let status = rx.borrow_and_update().clone();
        if status.role != last.role {
            info!(from = %last.role, to = %status.role, "role changed");
        }
        if status.last_outcome != last.last_outcome && status.state.is_idle() {
            info!(
                outcome = ?status.last_outcome,
                heavy = status.heavy_sweeps,
                light = status.light_sweeps,
                generation = status.generation,
                "sweep finished"
            );
        }
        last = status;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config()?;
    let fabric = match std::env::var(FABRIC_ENV) {
        Ok(path) => FabricFile::load(&path)?,
        Err(_) => {
            warn!("{} not set, starting with an empty fabric", FABRIC_ENV);
            FabricFile::default()
        }
    };

    let (sink, completions) = completion_channel();
    let sim = Arc::new(SimulatedFabric::new(sink));
    fabric.populate(&sim);

    let (sm, task) = spawn(
        config,
        Arc::clone(&sim),
        Arc::clone(&sim),
        Arc::clone(&sim),
        completions,
    )
    .context("starting subnet manager")?;
    tokio::spawn(watch_status(sm.clone()));

    let joined = fabric.join_groups(&sm).await?;
    if joined > 0 {
        info!(members = joined, "multicast members joined");
    }

    info!("Subnet manager is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    let status = sm.status();
    sm.shutdown().await?;
    task.await.context("engine task")?;

    println!("{}", serde_json::to_string_pretty(&status)?);
    print!("{}", sm.dump_forwarding_tables());
    Ok(())
}
