//! Worker pool draining the work queue.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use trainjob_id::JobKey;

use crate::cancel::CancelRegistry;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;

pub struct WorkerPool {
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    cancels: Arc<CancelRegistry>,
    workers: usize,
}

impl WorkerPool {
    pub fn new(
        reconciler: Arc<Reconciler>,
        queue: Arc<WorkQueue>,
        cancels: Arc<CancelRegistry>,
        workers: usize,
    ) -> Self {
        Self {
            reconciler,
            queue,
            cancels,
            workers: workers.max(1),
        }
    }

    /// Run until `shutdown` flips. In-flight passes finish before this
    /// returns.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(workers = self.workers, "Starting reconcile workers");

        let mut handles = Vec::with_capacity(self.workers);
        for id in 0..self.workers {
            let reconciler = Arc::clone(&self.reconciler);
            let queue = Arc::clone(&self.queue);
            let cancels = Arc::clone(&self.cancels);
            handles.push(tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    handle(&reconciler, &queue, &cancels, key).await;
                }
                debug!(worker = id, "Reconcile worker stopped");
            }));
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!("Reconcile workers shutting down");
        self.queue.shutdown();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Reconcile worker panicked");
            }
        }
    }
}

/// Run one pass for `key` and always release it, even if the pass panics.
async fn handle(
    reconciler: &Reconciler,
    queue: &WorkQueue,
    cancels: &CancelRegistry,
    key: JobKey,
) {
    let pass = AssertUnwindSafe(process(reconciler, queue, cancels, &key))
        .catch_unwind()
        .await;
    if let Err(panic) = pass {
        cancels.finish(&key);
        error!(
            job = %key,
            panic = panic_message(panic.as_ref()),
            attempt = queue.num_requeues(&key),
            "Reconciliation panicked"
        );
        queue.add_rate_limited(key.clone());
    }
    queue.done(&key);
}

async fn process(
    reconciler: &Reconciler,
    queue: &WorkQueue,
    cancels: &CancelRegistry,
    key: &JobKey,
) {
    let token = cancels.begin(key);
    let result = reconciler.reconcile(key, &token).await;
    cancels.finish(key);
    let key = key.clone();

    match result {
        Ok(outcome) if outcome.failed_operations > 0 => {
            debug!(
                job = %key,
                failed = outcome.failed_operations,
                attempt = queue.num_requeues(&key),
                "Pass left failed operations, backing off"
            );
            queue.add_rate_limited(key);
        }
        Ok(outcome) => {
            queue.forget(&key);
            if outcome.convergence.is_converging() {
                debug!(job = %key, queued = queue.len(), "Job still converging");
            }
            if let Some(delay) = outcome.requeue_after {
                queue.add_after(key, delay);
            }
        }
        Err(e) if e.is_conflict() => {
            debug!(job = %key, "Stale read, requeueing");
            queue.add(key);
        }
        Err(crate::ControllerError::Cancelled(_)) => {
            debug!(job = %key, "Pass cancelled, requeueing for cleanup");
            queue.add(key);
        }
        Err(e) if e.is_transient() => {
            warn!(
                job = %key,
                error = %e,
                attempt = queue.num_requeues(&key),
                "Reconciliation failed, will retry"
            );
            queue.add_rate_limited(key);
        }
        Err(e) => {
            error!(job = %key, error = %e, "Reconciliation failed");
            queue.add_rate_limited(key);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
