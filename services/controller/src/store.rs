//! Job store interface.
//!
//! A versioned key-value store for job objects with optimistic concurrency
//! and a change feed. Worker unit listings are served from the same store,
//! keyed by the owning job.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use trainjob_api::{Job, WorkerUnit};
use trainjob_id::{JobKey, ResourceVersion};

use crate::error::StoreError;

/// What changed about a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    /// One of the job's worker units changed.
    UnitChanged,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
            ChangeKind::UnitChanged => "unit_changed",
        };
        f.write_str(s)
    }
}

/// One item of the change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Changed { key: JobKey, kind: ChangeKind },
    /// The feed lost events; every job should be re-listed.
    Resync,
}

pub type WatchStream = Pin<Box<dyn Stream<Item = WatchEvent> + Send>>;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, key: &JobKey) -> Result<Job, StoreError>;

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;

    async fn list_worker_units(&self, key: &JobKey) -> Result<Vec<WorkerUnit>, StoreError>;

    /// Store a new job.
    async fn create(&self, job: Job) -> Result<ResourceVersion, StoreError>;

    /// Replace the job's status if the stored version is still `expected`.
    async fn update(
        &self,
        job: &Job,
        expected: ResourceVersion,
    ) -> Result<ResourceVersion, StoreError>;

    /// Remove the job if the stored version is still `expected`.
    async fn delete(&self, key: &JobKey, expected: ResourceVersion) -> Result<(), StoreError>;

    /// Subscribe to job and unit changes from now on.
    fn watch(&self) -> WatchStream;
}
