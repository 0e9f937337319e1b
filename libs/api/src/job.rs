//! The job object as held by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trainjob_id::{JobKey, JobUid, ResourceVersion};

use crate::spec::JobSpec;
use crate::status::JobStatus;

/// A training job: identity, immutable spec, derived status and the version
/// token of the stored copy it was read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub key: JobKey,
    pub uid: JobUid,
    pub created_at: DateTime<Utc>,
    pub resource_version: ResourceVersion,
    pub spec: JobSpec,
    #[serde(default)]
    pub status: JobStatus,
}

impl Job {
    /// A new, never-reconciled job.
    pub fn new(key: JobKey, spec: JobSpec, now: DateTime<Utc>) -> Self {
        Self {
            key,
            uid: JobUid::new(),
            created_at: now,
            resource_version: ResourceVersion::INITIAL,
            spec,
            status: JobStatus::default(),
        }
    }

    /// Copy of this job carrying `status`, for an optimistic update.
    pub fn with_status(&self, status: JobStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}
