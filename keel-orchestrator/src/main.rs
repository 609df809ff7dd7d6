//! Keel orchestrator binary
//!
//! Runs the cluster and workspace controllers and the workload dispatcher
//! until Ctrl-C, then drains in-flight provisioning jobs.
//!
//! Derived workload objects are written to an in-process API client; no
//! external cluster API is wired in. Set `KEEL_SIMULATE_READY=true` to have
//! that client report deployments ready as soon as they are applied.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keel_orchestrator::config::Config;
use keel_orchestrator::db;
use keel_orchestrator::dispatcher::{DispatcherConfig, ResourceDispatcher, WorkloadReconciler};
use keel_orchestrator::external::{InMemoryApiClient, ShellProvisioner};
use keel_orchestrator::metrics::TracingMetrics;
use keel_orchestrator::repository::Stores;
use keel_orchestrator::service::ControlPlane;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel_orchestrator=info,keel_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Keel Orchestrator...");

    let config = load_config()?;
    info!(
        "Loaded configuration: scripts_dir={}, work_dir={}",
        config.scripts_dir.display(),
        config.work_dir.display()
    );

    let stores = match &config.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let pool = db::create_pool(url)
                .await
                .context("Failed to create database pool")?;
            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            info!("Database ready");
            Stores::postgres(pool)
        }
        None => {
            warn!("DATABASE_URL not set, state will not survive a restart");
            Stores::in_memory()
        }
    };

    let metrics = Arc::new(TracingMetrics);
    let backend = Arc::new(ShellProvisioner::new(config.scripts_dir.clone()));
    let plane = ControlPlane::new(&config, &stores, backend, metrics.clone());

    plane
        .recover()
        .await
        .context("Failed to recover persisted resources")?;

    let api = if config.simulate_ready {
        warn!("Simulating readiness of derived deployments");
        InMemoryApiClient::new().with_ready_on_apply()
    } else {
        InMemoryApiClient::new()
    };
    let reconciler = WorkloadReconciler::new(Arc::clone(&stores.workloads), Arc::new(api));
    let dispatcher = ResourceDispatcher::new(
        DispatcherConfig {
            queue_capacity: config.reconcile_queue_capacity,
            retry_delay: config.reconcile_retry_delay,
        },
        Arc::new(reconciler),
        metrics,
    );

    let shutdown = CancellationToken::new();
    let resync = spawn_resync(&config, &stores, dispatcher.clone(), shutdown.clone());

    info!("Orchestrator running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown requested");
    shutdown.cancel();
    let _ = resync.await;
    dispatcher.shutdown();

    let guard = plane.drain(config.drain_poll_interval).await;
    info!("All provisioning jobs finished, exiting");
    guard.release();

    Ok(())
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<Config> {
    match Config::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(e) => {
            warn!("Failed to load config from environment, using defaults: {}", e);
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Periodically queues every watched workload for reconciliation
fn spawn_resync(
    config: &Config,
    stores: &Stores,
    dispatcher: ResourceDispatcher,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let workloads = Arc::clone(&stores.workloads);
    let interval = config.resync_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match workloads.list().await {
                Ok(items) => {
                    for workload in &items {
                        dispatcher.notify(&workload.key());
                    }
                }
                Err(e) => warn!("Failed to list workloads for resync: {}", e),
            }
        }
    })
}
