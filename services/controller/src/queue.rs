//! Deduplicating work queue keyed by job.
//!
//! A key is either queued, in flight, or both (in flight with one pending
//! follow-up). Adding a key that is already queued is a no-op; adding a key
//! that is in flight marks it dirty and it is queued again when the current
//! pass calls [`WorkQueue::done`]. So any number of notifications for a job
//! coalesce into at most one pending plus one in-flight pass, and no key is
//! ever handed to two workers at once.
//!
//! Delayed adds keep one due time per key, the earliest requested. Waiting
//! workers sleep until the nearest due time, so timers cost no tasks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;
use trainjob_id::JobKey;
use trainjob_reconcile::{DEFAULT_REQUEUE_BASE, DEFAULT_REQUEUE_MAX};

// =============================================================================
// Backoff
// =============================================================================

/// Exponential requeue backoff with jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_REQUEUE_BASE,
            max: DEFAULT_REQUEUE_MAX,
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2.0_f64.powi(attempt.min(32) as i32);
        let delay = (self.base.as_millis() as f64 * exp).min(self.max.as_millis() as f64);

        let range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if range > 0.0 {
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

// =============================================================================
// Queue
// =============================================================================

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<JobKey>,
    /// Keys waiting to be processed, whether queued or parked behind an
    /// in-flight pass.
    dirty: HashSet<JobKey>,
    processing: HashSet<JobKey>,
    /// Delayed adds by due time.
    waiting: HashMap<JobKey, Instant>,
    failures: HashMap<JobKey, u32>,
    shutting_down: bool,
}

impl QueueState {
    /// Mark `key` dirty, queueing it unless it is in flight. Returns whether
    /// the queue grew.
    fn enqueue(&mut self, key: JobKey) -> bool {
        if self.shutting_down || !self.dirty.insert(key.clone()) {
            return false;
        }
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    /// Move delayed adds due at `now` into the queue.
    fn promote_due(&mut self, now: Instant) {
        let due: Vec<JobKey> = self
            .waiting
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            self.waiting.remove(&key);
            self.enqueue(key);
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.waiting.values().min().copied()
    }
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: BackoffPolicy,
}

impl WorkQueue {
    pub fn new(backoff: BackoffPolicy) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, key: JobKey) {
        let queued = self.lock().enqueue(key);
        if queued {
            self.notify.notify_one();
        }
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<JobKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                state.promote_due(Instant::now());
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                state.next_due()
            };

            match next_due {
                Some(due) => {
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = tokio::time::sleep_until(due) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark the pass for `key` finished, requeueing it if it was re-added
    /// meanwhile.
    pub fn done(&self, key: &JobKey) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Add `key` after `delay`. A key already waiting keeps whichever due
    /// time is earlier.
    pub fn add_after(&self, key: JobKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        // Past any reachable instant; the periodic resync covers it.
        let Some(due) = Instant::now().checked_add(delay) else {
            return;
        };

        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        let earlier = match state.waiting.get(&key) {
            Some(current) if *current <= due => false,
            _ => {
                state.waiting.insert(key, due);
                true
            }
        };
        drop(state);
        if earlier {
            self.notify.notify_waiters();
        }
    }

    /// Add `key` after a delay that grows with each consecutive failure.
    pub fn add_rate_limited(&self, key: JobKey) {
        let attempt = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let attempt = *failures;
            *failures = failures.saturating_add(1);
            attempt
        };
        self.add_after(key, self.backoff.delay(attempt));
    }

    /// Reset the failure count for `key`.
    pub fn forget(&self, key: &JobKey) {
        self.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &JobKey) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Keys queued and not yet handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shutting_down = true;
        state.waiting.clear();
        drop(state);
        self.notify.notify_waiters();
    }
}
