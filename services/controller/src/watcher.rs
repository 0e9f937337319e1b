//! Feeds the work queue from the store's change feed and a periodic resync.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelRegistry;
use crate::queue::WorkQueue;
use crate::store::{ChangeKind, JobStore, WatchEvent};

pub struct Watcher {
    store: Arc<dyn JobStore>,
    queue: Arc<WorkQueue>,
    cancels: Arc<CancelRegistry>,
    resync_interval: Duration,
}

impl Watcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<WorkQueue>,
        cancels: Arc<CancelRegistry>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            cancels,
            resync_interval,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            resync_interval_secs = self.resync_interval.as_secs(),
            "Starting job watcher"
        );

        // Subscribe before listing so nothing between the two is missed.
        let mut events = self.store.watch();
        self.resync().await;

        let mut interval = tokio::time::interval(self.resync_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(WatchEvent::Changed { key, kind }) => {
                        debug!(job = %key, %kind, "Job changed");
                        if kind == ChangeKind::Deleted && self.cancels.cancel(&key) {
                            info!(job = %key, "Cancelled in-flight pass for deleted job");
                        }
                        self.queue.add(key);
                    }
                    Some(WatchEvent::Resync) => {
                        warn!("Change feed lagged, resyncing");
                        self.resync().await;
                    }
                    None => {
                        warn!("Change feed closed, resubscribing");
                        events = self.store.watch();
                        self.resync().await;
                    }
                },
                _ = interval.tick() => {
                    self.resync().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Job watcher shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Queue every known job.
    async fn resync(&self) {
        match self.store.list_jobs().await {
            Ok(jobs) => {
                debug!(count = jobs.len(), "Resync");
                for job in jobs {
                    self.queue.add(job.key);
                }
            }
            Err(e) => warn!(error = %e, "Failed to list jobs for resync"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::InMemoryCluster;
    use crate::queue::BackoffPolicy;
    use trainjob_testing::{at, JobBuilder};

    #[tokio::test]
    async fn test_existing_and_new_jobs_are_queued() {
        let cluster = Arc::new(InMemoryCluster::new(Arc::new(ManualClock::new(at(0)))));
        let existing = JobBuilder::new("existing").workers(1).build();
        cluster.create(existing.clone()).await.unwrap();

        let queue = WorkQueue::new(BackoffPolicy::default());
        let watcher = Watcher::new(
            cluster.clone(),
            Arc::clone(&queue),
            Arc::new(CancelRegistry::new()),
            Duration::from_secs(60),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { watcher.run(shutdown_rx).await });

        let first = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .unwrap();
        assert_eq!(first, Some(existing.key.clone()));

        let added = JobBuilder::new("added").workers(1).build();
        cluster.create(added.clone()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .unwrap();
        assert_eq!(second, Some(added.key.clone()));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
