//! armada fleet manager
//!
//! Sizes the cluster's EC2 fleets to batch pod demand, one reconciliation
//! tick at a time. Dry-run by default; pass `--live` to apply changes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use armada_fleet_manager::clients::{Ec2FleetApi, KubeClusterApi};
use armada_fleet_manager::config::{Config, DEFAULT_CONFIG_PATH};
use armada_fleet_manager::runner::Manager;

/// Fleet capacity manager for batch clusters.
#[derive(Debug, Parser)]
#[command(name = "armada-fleet-manager")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Apply changes. Without this flag the manager only logs what it
    /// would do.
    #[arg(long)]
    live: bool,

    /// Path to the configuration file.
    #[arg(long, env = "ARMADA_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cli = Cli::parse();

    // A configuration problem is the one fatal startup error.
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, path = %cli.config.display(), "Failed to load configuration");
            std::process::exit(1);
        }
    };
    info!(
        cluster = %config.cluster_name,
        sectors = config.sectors.len(),
        fleets = config.fleets().count(),
        live = cli.live,
        "Configuration loaded"
    );

    let cluster = Arc::new(
        KubeClusterApi::connect()
            .await
            .context("failed to connect to the orchestrator")?,
    );
    let fleets = Arc::new(Ec2FleetApi::connect().await);

    // A signal lets the in-flight iteration finish before the loop exits.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received; finishing current iteration");
        let _ = shutdown_tx.send(true);
    });

    let manager = Manager::new(config, cli.live, cluster, fleets);
    manager.run(shutdown_rx).await;

    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
