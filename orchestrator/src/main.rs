use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser as _;
use disk_tunnel_orchestrator::api;
use disk_tunnel_orchestrator::catalog::WorkloadCatalog;
use disk_tunnel_orchestrator::cli::CliArgs;
use disk_tunnel_orchestrator::config::Config;
use disk_tunnel_orchestrator::orchestrator::Orchestrator;
use disk_tunnel_orchestrator::shutdown::start_shutdown_listener;
use disk_tunnel_runner::prelude::PlanSource as _;
use disk_tunnel_thresholds::ThresholdTable;

/// Extra time on top of the engine stop grace for the final record to be written on shutdown.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = CliArgs::parse();
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    let catalog = match &config.catalog.workloads_path {
        Some(path) => WorkloadCatalog::load(path)?,
        None => WorkloadCatalog::builtin()?,
    };
    let thresholds = match &config.catalog.thresholds_path {
        Some(path) => ThresholdTable::load(path)?,
        None => ThresholdTable::builtin()?,
    };

    let unrated: Vec<String> = catalog
        .workloads()
        .into_iter()
        .filter(|workload| !thresholds.has_workload(workload))
        .collect();
    if !unrated.is_empty() {
        anyhow::bail!(
            "No thresholds defined for workload(s): {}",
            unrated.join(", ")
        );
    }
    log::info!(
        "Loaded {} workload(s), threshold table {} ({})",
        catalog.len(),
        thresholds.version(),
        thresholds.digest()
    );

    let orchestrator = Orchestrator::open(&config, Arc::new(catalog), thresholds)?;

    let shutdown_handle = start_shutdown_listener();
    let mut shutdown_listener = shutdown_handle.new_listener();

    let listener = tokio::net::TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen))?;
    log::info!("Listening on {}", config.server.listen);

    axum::serve(listener, api::router(orchestrator.clone()))
        .with_graceful_shutdown(async move { shutdown_listener.wait_for_shutdown().await })
        .await
        .context("HTTP server failed")?;

    orchestrator
        .shutdown(Duration::from_secs(config.engine.stop_grace_secs) + SHUTDOWN_SLACK)
        .await;
    log::info!("Shut down cleanly");

    Ok(())
}
