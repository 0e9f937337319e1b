//! Controller error types.
//!
//! Errors are classified by how the work queue reacts to them: conflicts are
//! requeued immediately, everything else with backoff. None of them ever
//! changes a job's phase; only policy decisions do that.

use thiserror::Error;
use trainjob_id::{JobKey, ResourceVersion, UnitId};
use trainjob_reconcile::ReconcileError;

/// Job store errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobKey),

    #[error("job already exists: {0}")]
    AlreadyExists(JobKey),

    /// The stored version moved on since the caller read it.
    #[error("version conflict on {key}: expected {expected}, found {actual}")]
    Conflict {
        key: JobKey,
        expected: ResourceVersion,
        actual: ResourceVersion,
    },

    #[error("job store unavailable: {0}")]
    Unavailable(String),
}

/// Orchestration substrate errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubstrateError {
    /// A unit with the same name already exists.
    #[error("worker unit already exists: {0}")]
    AlreadyExists(String),

    #[error("worker unit not found: {0}")]
    NotFound(UnitId),

    #[error("substrate unavailable: {0}")]
    Unavailable(String),
}

/// Autoscaler errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AutoscalerError {
    /// No proposal for this job right now.
    #[error("no proposal available for {0}")]
    Unavailable(JobKey),

    #[error("autoscaler binding failed for {key}: {reason}")]
    Binding { key: JobKey, reason: String },
}

/// Errors that abort a reconciliation pass.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    #[error(transparent)]
    Autoscaler(#[from] AutoscalerError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// The job was deleted while the pass was running.
    #[error("reconciliation of {0} cancelled")]
    Cancelled(JobKey),
}

impl ControllerError {
    /// A status write lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::Store(StoreError::Conflict { .. }))
    }

    /// Worth retrying as-is after a delay.
    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::Store(StoreError::Unavailable(_))
            | ControllerError::Store(StoreError::NotFound(_))
            | ControllerError::Substrate(SubstrateError::Unavailable(_))
            | ControllerError::Autoscaler(_)
            | ControllerError::Cancelled(_) => true,
            ControllerError::Store(StoreError::Conflict { .. }) => true,
            ControllerError::Store(StoreError::AlreadyExists(_))
            | ControllerError::Substrate(_)
            | ControllerError::Reconcile(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> JobKey {
        JobKey::new("default", "bert").unwrap()
    }

    #[test]
    fn test_conflict_classification() {
        let err = ControllerError::from(StoreError::Conflict {
            key: key(),
            expected: ResourceVersion::new(3),
            actual: ResourceVersion::new(4),
        });
        assert!(err.is_conflict());
        assert!(err.is_transient());
        assert_eq!(
            err.to_string(),
            "version conflict on default/bert: expected 3, found 4"
        );
    }

    #[test]
    fn test_substrate_outage_is_transient() {
        let err = ControllerError::from(SubstrateError::Unavailable("timeout".into()));
        assert!(err.is_transient());
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_reconcile_error_is_not_transient() {
        let err = ControllerError::from(ReconcileError::MissingReplicaSpec {
            job: "default/bert".into(),
            replica_type: trainjob_api::ReplicaType::Master,
        });
        assert!(!err.is_transient());
    }
}
