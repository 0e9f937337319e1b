//! Cooperative cancellation of in-flight passes.
//!
//! The watcher cancels a job's pass when the job is deleted. The pass checks
//! its token before each side effect; calls already issued complete and
//! whatever they created is cleaned up by the next pass.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;
use trainjob_id::JobKey;

/// Cancellation flag handed to one reconciliation pass.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// In-flight passes by job.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    in_flight: Mutex<HashMap<JobKey, watch::Sender<bool>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pass for `key` and return its token.
    pub fn begin(&self, key: &JobKey) -> CancelToken {
        let (tx, rx) = watch::channel(false);
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.clone(), tx);
        CancelToken { rx }
    }

    /// Cancel the pass for `key`, if one is running. Returns whether it was.
    pub fn cancel(&self, key: &JobKey) -> bool {
        let in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match in_flight.get(key) {
            Some(tx) => {
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub fn finish(&self, key: &JobKey) {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
    }
}
