//! Training job controller
//!
//! Runs the reconciliation loop against an in-process cluster. Job
//! manifests are loaded from `TRAINJOB_MANIFEST_DIR` at startup.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trainjob_api::Scheme;
use trainjob_controller::{
    config, Clock, Controller, InMemoryCluster, JobStore, StaticAutoscaler, StoreError,
    SystemClock,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to TRAINJOB_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting training job controller");
    info!(
        workers = config.workers,
        resync_interval_secs = config.resync_interval.as_secs(),
        dev_mode = config.dev_mode,
        "Configuration loaded"
    );

    let mut scheme = Scheme::new();
    trainjob_api::register(&mut scheme)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cluster = Arc::new(InMemoryCluster::new(Arc::clone(&clock)).with_auto_run(config.dev_mode));
    let autoscaler = Arc::new(StaticAutoscaler::new());

    if let Some(dir) = &config.manifest_dir {
        let loaded = load_manifests(&scheme, cluster.as_ref(), clock.as_ref(), dir).await?;
        info!(dir = %dir.display(), jobs = loaded, "Loaded job manifests");
    }

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let controller = Controller::new(
        &config,
        cluster.clone(),
        cluster,
        autoscaler,
        Arc::clone(&clock),
    );
    let controller_handle = tokio::spawn(controller.run(shutdown_rx));

    // Wait for shutdown signal (Ctrl+C)
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");

    // Signal shutdown to the controller
    let _ = shutdown_tx.send(true);

    info!("Waiting for controller to shut down...");
    if let Err(e) = tokio::time::timeout(config.shutdown_timeout, controller_handle).await {
        warn!(error = %e, "Controller did not shut down in time");
    }

    info!("Controller shutdown complete");
    Ok(())
}

/// Decode every `*.json` file in `dir` and store the jobs it contains.
async fn load_manifests(
    scheme: &Scheme,
    store: &dyn JobStore,
    clock: &dyn Clock,
    dir: &Path,
) -> Result<usize> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read manifest directory {}", dir.display()))?;

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut loaded = 0;
    for path in paths {
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let jobs = match scheme.decode_jobs(&bytes, clock.now()) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Rejected job manifest");
                continue;
            }
        };
        for job in jobs {
            let key = job.key.clone();
            match store.create(job).await {
                Ok(_) => loaded += 1,
                Err(StoreError::AlreadyExists(_)) => {
                    warn!(job = %key, path = %path.display(), "Duplicate job manifest, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(loaded)
}
