//! Reconciliation pass for one job.
//!
//! Level-triggered: every pass starts from the stored job and the listed
//! units and recomputes everything. Nothing is carried between passes in
//! memory, so a pass interrupted at any point is finished by the next one.
//!
//! # Write ordering
//!
//! Restarts are charged in a status write that lands before the failed
//! units are deleted. If that write loses a version race the pass aborts
//! before touching any unit. If the controller dies after the write but
//! before the delete, the ledger shows the unit as already charged and the
//! next pass deletes and recreates it without charging again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use trainjob_api::{ConditionReason, Job, JobPhase, JobStatus, UnitPhase, WorkerUnit};
use trainjob_id::{JobKey, UnitId};
use trainjob_reconcile::{
    aggregate, bounds, charge, cleanup_targets, diff_units, expired_targets, plan_membership,
    prune_ledger, render_unit_spec, ConvergenceStatus, DesiredState, UnitCreation, UnitDeletion,
};

use crate::autoscaler::{Autoscaler, AutoscalerBinding};
use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::error::{ControllerError, StoreError, SubstrateError};
use crate::store::JobStore;
use crate::substrate::Substrate;

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassOutcome {
    /// Phase after the pass; `None` when the job no longer exists.
    pub phase: Option<JobPhase>,
    pub created: u32,
    pub deleted: u32,
    /// Creates or deletes that failed and will be retried.
    pub failed_operations: u32,
    pub restarts_charged: u32,
    pub status_written: bool,
    /// The job object itself was removed (TTL).
    pub job_deleted: bool,
    pub convergence: ConvergenceStatus,
    /// Come back after this long even without a change notification.
    pub requeue_after: Option<Duration>,
}

impl PassOutcome {
    fn new(phase: Option<JobPhase>, convergence: ConvergenceStatus) -> Self {
        Self {
            phase,
            created: 0,
            deleted: 0,
            failed_operations: 0,
            restarts_charged: 0,
            status_written: false,
            job_deleted: false,
            convergence,
            requeue_after: None,
        }
    }

    fn with_applied(mut self, applied: &Applied) -> Self {
        self.created = applied.created;
        self.deleted = applied.deleted;
        self.failed_operations = applied.failed;
        if applied.failed > 0 {
            self.convergence = ConvergenceStatus::Converging;
        }
        self
    }

    /// Whether the pass issued any create or delete.
    pub fn had_side_effects(&self) -> bool {
        self.created > 0 || self.deleted > 0
    }
}

/// Tally of the substrate calls issued by a pass.
#[derive(Debug, Default)]
struct Applied {
    created: u32,
    deleted: u32,
    failed: u32,
    /// Units confirmed gone, including ones that were already missing.
    gone: HashSet<UnitId>,
}

/// Drives one job toward its desired state.
pub struct Reconciler {
    store: Arc<dyn JobStore>,
    substrate: Arc<dyn Substrate>,
    autoscaler: Arc<dyn Autoscaler>,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn JobStore>,
        substrate: Arc<dyn Substrate>,
        autoscaler: Arc<dyn Autoscaler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            substrate,
            autoscaler,
            clock,
        }
    }

    /// Run one pass for `key`.
    #[instrument(skip(self, key, cancel), fields(job = %key))]
    pub async fn reconcile(
        &self,
        key: &JobKey,
        cancel: &CancelToken,
    ) -> Result<PassOutcome, ControllerError> {
        let job = match self.store.get(key).await {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => return self.cleanup_orphans(key).await,
            Err(e) => return Err(e.into()),
        };

        let mut units = self.store.list_worker_units(key).await?;
        let now = self.clock.now();
        self.refresh_unknown(&mut units, now).await;

        let outcome = if job.status.phase.is_terminal() {
            self.finish(job, &units, now, cancel).await?
        } else {
            self.converge(job, &units, now, cancel).await?
        };

        if outcome.had_side_effects() || outcome.failed_operations > 0 {
            info!(
                phase = ?outcome.phase,
                created = outcome.created,
                deleted = outcome.deleted,
                failed = outcome.failed_operations,
                restarts_charged = outcome.restarts_charged,
                "Reconciliation pass complete"
            );
        } else {
            debug!(phase = ?outcome.phase, "Reconciliation pass complete, no changes");
        }
        Ok(outcome)
    }

    /// Drive a live job toward its desired state.
    async fn converge(
        &self,
        job: Job,
        units: &[WorkerUnit],
        now: DateTime<Utc>,
        cancel: &CancelToken,
    ) -> Result<PassOutcome, ControllerError> {
        // Last status known to be persisted.
        let mut stored = job.status.clone();
        let mut working = job;
        if working.status.start_time.is_none() {
            working.status.start_time = Some(now);
        }
        if working.status.conditions.is_empty() {
            let message = format!("job {} is created", working.key);
            working
                .status
                .transition(JobPhase::Created, ConditionReason::JobCreated, message, now);
        }

        let snapshot = aggregate(&working, units, now);

        // Deadline, budget and policy failures: record and stop. Cleanup
        // belongs to the next pass.
        if snapshot.phase.is_terminal() {
            let mut status = working.status.clone();
            status.replica_statuses = snapshot.replica_statuses.clone();
            if status.transition(snapshot.phase, snapshot.reason, snapshot.message.clone(), now) {
                info!(
                    phase = %snapshot.phase,
                    reason = %snapshot.reason,
                    restart_count = status.restart_count,
                    "Job reached terminal phase"
                );
            }
            self.write_status(&mut working, status).await?;
            self.release_binding(&working).await;

            let mut outcome =
                PassOutcome::new(Some(working.status.phase), ConvergenceStatus::Finished);
            outcome.status_written = true;
            outcome.requeue_after = Some(Duration::ZERO);
            return Ok(outcome);
        }

        let proposal = self.autoscaler_proposal(&working).await;
        let desired = plan_membership(&working, &snapshot, proposal);

        // Charge new restarts before deleting anything.
        let mut status = working.status.clone();
        let charged = charge(&mut status, &snapshot.restarts, now);
        if charged > 0 {
            status.replica_statuses = snapshot.replica_statuses.clone();
            status.membership = desired.membership_record(status.membership.as_ref(), now);
            status.transition(
                JobPhase::Restarting,
                ConditionReason::JobRestarting,
                snapshot.message.clone(),
                now,
            );
            info!(
                charged,
                restart_count = status.restart_count,
                "Charged restarts for failed units"
            );
            self.write_status(&mut working, status).await?;
            stored = working.status.clone();
        }

        if cancel.is_cancelled() {
            return Err(ControllerError::Cancelled(working.key.clone()));
        }

        let diff = diff_units(&working, &desired, units);
        let mut applied = Applied::default();
        self.apply_deletes(&working.key, &diff.deletes, cancel, &mut applied)
            .await?;
        self.apply_creates(&working, &desired, &diff.creates, cancel, &mut applied)
            .await?;

        let mut status = working.status.clone();
        prune_ledger(&mut status, units);
        status
            .charged_failures
            .retain(|entry| !applied.gone.contains(&entry.unit_id));
        status.replica_statuses = snapshot.replica_statuses.clone();
        status.membership = desired.membership_record(status.membership.as_ref(), now);
        match snapshot.phase {
            JobPhase::Running => {
                if status.transition(
                    JobPhase::Running,
                    ConditionReason::JobRunning,
                    snapshot.message.clone(),
                    now,
                ) {
                    info!("Job is running");
                }
            }
            JobPhase::Restarting => {
                status.transition(
                    JobPhase::Restarting,
                    ConditionReason::JobRestarting,
                    snapshot.message.clone(),
                    now,
                );
            }
            _ => {}
        }

        let mut status_written = charged > 0;
        if status != stored {
            self.write_status(&mut working, status).await?;
            status_written = true;
        }

        let mut outcome =
            PassOutcome::new(Some(working.status.phase), diff.convergence()).with_applied(&applied);
        outcome.restarts_charged = charged;
        outcome.status_written = status_written;
        outcome.requeue_after = deadline_remaining(&working, now);
        Ok(outcome)
    }

    /// Apply cleanup and TTL rules to a terminal job.
    async fn finish(
        &self,
        job: Job,
        units: &[WorkerUnit],
        now: DateTime<Utc>,
        cancel: &CancelToken,
    ) -> Result<PassOutcome, ControllerError> {
        let phase = job.status.phase;
        let mut applied = Applied::default();
        let mut requeue_after = None;

        let expiry = job
            .spec
            .run_policy
            .ttl_after_finished()
            .zip(job.status.completion_time)
            .and_then(|(ttl, completed)| completed.checked_add_signed(ttl));
        if let Some(expiry) = expiry {
            if now >= expiry {
                self.apply_deletes(&job.key, &expired_targets(&job, units), cancel, &mut applied)
                    .await?;
                self.release_binding(&job).await;

                let mut outcome = PassOutcome::new(Some(phase), ConvergenceStatus::Finished)
                    .with_applied(&applied);
                if applied.failed > 0 {
                    return Ok(outcome);
                }
                match self.store.delete(&job.key, job.resource_version).await {
                    Ok(()) => info!("Deleted finished job after its TTL"),
                    Err(StoreError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                outcome.job_deleted = true;
                return Ok(outcome);
            }
            requeue_after = (expiry - now).to_std().ok();
        }

        self.apply_deletes(&job.key, &cleanup_targets(&job, units), cancel, &mut applied)
            .await?;
        self.release_binding(&job).await;

        let mut outcome =
            PassOutcome::new(Some(phase), ConvergenceStatus::Finished).with_applied(&applied);
        outcome.requeue_after = requeue_after;
        Ok(outcome)
    }

    /// Delete every unit left behind by a job that no longer exists.
    async fn cleanup_orphans(&self, key: &JobKey) -> Result<PassOutcome, ControllerError> {
        let units = self.store.list_worker_units(key).await?;
        let mut applied = Applied::default();
        for unit in &units {
            self.delete_unit(unit.id, &unit.name, "orphaned", &mut applied)
                .await;
        }
        if let Err(e) = self.autoscaler.remove_binding(key).await {
            warn!(error = %e, "Failed to remove autoscaler binding of deleted job");
        }
        if applied.deleted > 0 {
            info!(deleted = applied.deleted, "Cleaned up units of deleted job");
        }
        Ok(PassOutcome::new(None, ConvergenceStatus::Finished).with_applied(&applied))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Fetch fresh status for units the listing reports as `Unknown`.
    async fn refresh_unknown(&self, units: &mut Vec<WorkerUnit>, now: DateTime<Utc>) {
        let mut vanished = HashSet::new();
        for unit in units.iter_mut().filter(|unit| unit.phase == UnitPhase::Unknown) {
            match self.substrate.get_worker_unit_status(&unit.id).await {
                Ok(status) => unit.apply_status(&status, now),
                Err(SubstrateError::NotFound(id)) => {
                    vanished.insert(id);
                }
                Err(e) => warn!(unit = %unit.name, error = %e, "Failed to refresh unit status"),
            }
        }
        units.retain(|unit| !vanished.contains(&unit.id));
    }

    async fn write_status(&self, job: &mut Job, status: JobStatus) -> Result<(), ControllerError> {
        let next = job.with_status(status);
        match self.store.update(&next, job.resource_version).await {
            Ok(version) => {
                *job = Job {
                    resource_version: version,
                    ..next
                };
                Ok(())
            }
            Err(e @ StoreError::Conflict { .. }) => {
                debug!(error = %e, "Status write lost a version race, aborting pass");
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_deletes(
        &self,
        key: &JobKey,
        deletes: &[UnitDeletion],
        cancel: &CancelToken,
        applied: &mut Applied,
    ) -> Result<(), ControllerError> {
        for deletion in deletes {
            if cancel.is_cancelled() {
                return Err(ControllerError::Cancelled(key.clone()));
            }
            let reason = deletion.reason.to_string();
            self.delete_unit(deletion.unit_id, &deletion.name, &reason, applied)
                .await;
        }
        Ok(())
    }

    async fn delete_unit(&self, id: UnitId, name: &str, reason: &str, applied: &mut Applied) {
        match self.substrate.delete_worker_unit(&id).await {
            Ok(()) => {
                applied.deleted += 1;
                applied.gone.insert(id);
                info!(unit = %name, reason, "Deleted worker unit");
            }
            Err(SubstrateError::NotFound(_)) => {
                applied.gone.insert(id);
            }
            Err(e) => {
                applied.failed += 1;
                warn!(unit = %name, reason, error = %e, "Failed to delete worker unit");
            }
        }
    }

    async fn apply_creates(
        &self,
        job: &Job,
        desired: &DesiredState,
        creates: &[UnitCreation],
        cancel: &CancelToken,
        applied: &mut Applied,
    ) -> Result<(), ControllerError> {
        for creation in creates {
            if let Some(replaced) = creation.replaces {
                if !applied.gone.contains(&replaced) {
                    continue;
                }
            }
            if cancel.is_cancelled() {
                return Err(ControllerError::Cancelled(job.key.clone()));
            }

            let spec = render_unit_spec(job, desired, creation.replica_type, creation.index)?;
            match self.substrate.create_worker_unit(&spec).await {
                Ok(id) => {
                    applied.created += 1;
                    info!(unit = %spec.name, unit_id = %id, "Created worker unit");
                }
                Err(SubstrateError::AlreadyExists(name)) => {
                    debug!(unit = %name, "Worker unit already exists");
                }
                Err(e) => {
                    applied.failed += 1;
                    warn!(unit = %spec.name, error = %e, "Failed to create worker unit");
                }
            }
        }
        Ok(())
    }

    /// Keep the autoscaler binding current and read its proposal.
    ///
    /// Only elastic jobs with metrics have a binding. An unavailable
    /// proposal is not an error; the planner falls back to history.
    async fn autoscaler_proposal(&self, job: &Job) -> Option<u32> {
        let policy = job.spec.elastic().filter(|policy| policy.has_metrics())?;
        let bounds = bounds(job)?;
        let binding = AutoscalerBinding {
            job: job.key.clone(),
            min_replicas: bounds.min,
            max_replicas: bounds.max,
            metrics: policy.metrics.clone(),
        };
        if let Err(e) = self.autoscaler.ensure_binding(&binding).await {
            warn!(error = %e, "Failed to ensure autoscaler binding");
        }
        match self.autoscaler.proposed_replica_count(&job.key).await {
            Ok(count) => Some(count),
            Err(e) => {
                debug!(error = %e, "No autoscaler proposal, keeping current membership");
                None
            }
        }
    }

    async fn release_binding(&self, job: &Job) {
        let has_binding = job
            .spec
            .elastic()
            .is_some_and(|policy| policy.has_metrics());
        if !has_binding {
            return;
        }
        if let Err(e) = self.autoscaler.remove_binding(&job.key).await {
            warn!(error = %e, "Failed to remove autoscaler binding");
        }
    }
}

/// Time left until the active deadline, if one is running.
fn deadline_remaining(job: &Job, now: DateTime<Utc>) -> Option<Duration> {
    let deadline = job.spec.run_policy.active_deadline()?;
    let start = job.status.start_time?;
    (start.checked_add_signed(deadline)? - now).to_std().ok()
}
