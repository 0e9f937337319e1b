//! Reconciliation primitives for training jobs.
//!
//! Everything here is a pure function of a job and its observed units. The
//! controller service does the I/O; this crate decides what the I/O should
//! be.
//!
//! - **Aggregation** ([`aggregate`]): units to per-type counts and a phase.
//! - **Planning** ([`plan_membership`]): desired counts and rendezvous block.
//! - **Restarts** ([`plan_restarts`], [`charge`]): the restart budget.
//! - **Diffing** ([`diff_units`], [`cleanup_targets`]): creates and deletes.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - Restart counters never decrease
//! - Desired elastic Worker counts stay within `[min, max]`

use std::time::Duration;

use thiserror::Error;
use trainjob_api::ReplicaType;

mod diff;
mod planner;
mod rendezvous;
mod restart;
mod status;

pub use diff::{
    cleanup_targets, diff_units, expired_targets, DeleteReason, UnitCreation, UnitDeletion,
    UnitDiff,
};
pub use planner::{
    bounds, expected_workers, plan_membership, select_scale_down_victims, DesiredState,
    ElasticBounds,
};
pub use rendezvous::*;
pub use restart::{
    budget_exceeded, charge, may_restart, plan_restarts, prune_ledger, RestartDenial, RestartPlan,
    RestartRefusal, RestartTicket, RestartTracker,
};
pub use status::{aggregate, deadline_exceeded, is_owned, StatusSnapshot};

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A unit was requested for a replica type the job does not declare.
    #[error("job {job} has no {replica_type} replica spec")]
    MissingReplicaSpec {
        job: String,
        replica_type: ReplicaType,
    },
}

/// Convergence status for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Observed units match the desired state.
    Converged,

    /// Creates or deletes are still outstanding.
    Converging,

    /// The job is terminal; only cleanup remains.
    Finished,
}

impl ConvergenceStatus {
    /// Returns true if the job has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged | Self::Finished)
    }

    /// Returns true if the job is still converging.
    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging)
    }
}

/// Default full resync interval.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default requeue backoff base.
pub const DEFAULT_REQUEUE_BASE: Duration = Duration::from_millis(100);

/// Default requeue backoff ceiling.
pub const DEFAULT_REQUEUE_MAX: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convergence_status() {
        assert!(ConvergenceStatus::Converged.is_converged());
        assert!(ConvergenceStatus::Finished.is_converged());
        assert!(ConvergenceStatus::Converging.is_converging());
        assert!(!ConvergenceStatus::Converging.is_converged());
    }

    #[test]
    fn test_missing_replica_error_message() {
        let err = ReconcileError::MissingReplicaSpec {
            job: "default/bert".to_string(),
            replica_type: ReplicaType::Master,
        };
        assert_eq!(err.to_string(), "job default/bert has no Master replica spec");
    }
}
