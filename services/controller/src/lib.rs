//! Training job controller library.
//!
//! This crate ships a `trainjob-controller` binary, but the controller is a
//! library so it can run against any store, substrate and autoscaler, and so
//! the integration tests can drive it pass by pass.
//!
//! The pieces:
//! - [`Watcher`] turns store changes and periodic resyncs into queue keys.
//! - [`WorkQueue`] deduplicates keys and serializes passes per job.
//! - [`WorkerPool`] runs [`Reconciler::reconcile`] for each key.

pub mod autoscaler;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod error;
pub mod memory;
pub mod queue;
pub mod reconciler;
pub mod store;
pub mod substrate;
pub mod watcher;
pub mod worker;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

pub use autoscaler::{Autoscaler, AutoscalerBinding, StaticAutoscaler};
pub use cancel::{CancelRegistry, CancelToken};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{AutoscalerError, ControllerError, StoreError, SubstrateError};
pub use memory::InMemoryCluster;
pub use queue::{BackoffPolicy, WorkQueue};
pub use reconciler::{PassOutcome, Reconciler};
pub use store::{ChangeKind, JobStore, WatchEvent, WatchStream};
pub use substrate::Substrate;
pub use watcher::Watcher;
pub use worker::WorkerPool;

/// The assembled controller: one watcher feeding a pool of workers.
pub struct Controller {
    watcher: Watcher,
    workers: WorkerPool,
    queue: Arc<WorkQueue>,
}

impl Controller {
    pub fn new(
        config: &Config,
        store: Arc<dyn JobStore>,
        substrate: Arc<dyn Substrate>,
        autoscaler: Arc<dyn Autoscaler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queue = WorkQueue::new(BackoffPolicy::new(config.requeue_base, config.requeue_max));
        let cancels = Arc::new(CancelRegistry::new());
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            substrate,
            autoscaler,
            clock,
        ));

        let watcher = Watcher::new(
            store,
            Arc::clone(&queue),
            Arc::clone(&cancels),
            config.resync_interval,
        );
        let workers = WorkerPool::new(reconciler, Arc::clone(&queue), cancels, config.workers);

        Self {
            watcher,
            workers,
            queue,
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!("Starting training job controller");

        let Self {
            watcher, workers, ..
        } = self;
        let watcher_handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { watcher.run(shutdown).await }
        });

        workers.run(shutdown).await;

        if let Err(e) = watcher_handle.await {
            error!(error = %e, "Job watcher panicked");
        }
        info!("Training job controller stopped");
    }
}
