//! Status aggregation.
//!
//! Folds the observed units of one job into per-type counts and a job phase.
//! Pure: the same job and units always produce the same snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use trainjob_api::{
    ConditionReason, Job, JobPhase, ReplicaStatus, ReplicaType, UnitPhase, WorkerUnit,
};

use crate::planner::expected_workers;
use crate::restart::{budget_exceeded, plan_restarts, RestartPlan};

/// Job-level view of the observed units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub replica_statuses: BTreeMap<ReplicaType, ReplicaStatus>,
    pub phase: JobPhase,
    pub reason: ConditionReason,
    pub message: String,
    /// Charged recreations plus in-place restarts of live units.
    pub total_restarts: u32,
    pub restarts: RestartPlan,
}

impl StatusSnapshot {
    pub fn replica(&self, rtype: ReplicaType) -> ReplicaStatus {
        self.replica_statuses.get(&rtype).copied().unwrap_or_default()
    }

    fn with_phase(mut self, phase: JobPhase, reason: ConditionReason, message: String) -> Self {
        self.phase = phase;
        self.reason = reason;
        self.message = message;
        self
    }
}

/// Whether `unit` belongs to the current incarnation of `job` and to a
/// replica type the job declares.
pub fn is_owned(job: &Job, unit: &WorkerUnit) -> bool {
    unit.job == job.key && unit.job_uid == job.uid && job.spec.replica(unit.replica_type).is_some()
}

/// Whether the active deadline has elapsed at `now`.
///
/// The deadline runs from the status `start_time`; a job that was never
/// started cannot be past it.
pub fn deadline_exceeded(job: &Job, now: DateTime<Utc>) -> bool {
    match (job.spec.run_policy.active_deadline(), job.status.start_time) {
        (Some(deadline), Some(start)) => start
            .checked_add_signed(deadline)
            .is_some_and(|end| now >= end),
        _ => false,
    }
}

/// Aggregate `units` into a snapshot for `job`.
///
/// Phase precedence: Failed, Succeeded, Restarting, Running, Created. A job
/// already in a terminal phase keeps it.
pub fn aggregate(job: &Job, units: &[WorkerUnit], now: DateTime<Utc>) -> StatusSnapshot {
    let owned: Vec<&WorkerUnit> = units.iter().filter(|unit| is_owned(job, unit)).collect();

    let mut replica_statuses: BTreeMap<ReplicaType, ReplicaStatus> = job
        .spec
        .replica_specs
        .keys()
        .map(|rtype| (*rtype, ReplicaStatus::default()))
        .collect();
    for unit in &owned {
        let counts = replica_statuses.entry(unit.replica_type).or_default();
        match unit.phase {
            UnitPhase::Pending | UnitPhase::Running => counts.active += 1,
            UnitPhase::Succeeded => counts.succeeded += 1,
            UnitPhase::Failed => counts.failed += 1,
            UnitPhase::Unknown => {}
        }
    }

    let total_restarts = owned.iter().fold(job.status.restart_count, |total, unit| {
        total.saturating_add(unit.restart_count)
    });
    let restarts = plan_restarts(
        job,
        owned.iter().copied().filter(|unit| unit.phase == UnitPhase::Failed),
    );

    let snapshot = StatusSnapshot {
        replica_statuses,
        phase: JobPhase::Created,
        reason: ConditionReason::JobCreated,
        message: format!("job {} is created", job.key),
        total_restarts,
        restarts,
    };

    if job.status.phase.is_terminal() {
        let (reason, message) = job
            .status
            .latest_condition()
            .map(|c| (c.reason, c.message.clone()))
            .unwrap_or((terminal_reason(job.status.phase), String::new()));
        return snapshot.with_phase(job.status.phase, reason, message);
    }

    if deadline_exceeded(job, now) {
        let seconds = job.spec.run_policy.active_deadline_seconds.unwrap_or(0);
        return snapshot.with_phase(
            JobPhase::Failed,
            ConditionReason::DeadlineExceeded,
            format!("job {} ran past its active deadline of {seconds}s", job.key),
        );
    }

    if budget_exceeded(total_restarts, job.spec.run_policy.backoff_limit) {
        let message = format!(
            "job {} restarted {total_restarts} times, above its backoff limit",
            job.key
        );
        return snapshot.with_phase(
            JobPhase::Failed,
            ConditionReason::BackoffLimitExceeded,
            message,
        );
    }

    if let Some(refusal) = snapshot.restarts.first_refusal() {
        let reason = refusal.denial.reason();
        let message = format!(
            "{} {} of job {} failed and cannot be restarted ({reason})",
            refusal.replica_type, refusal.index, job.key
        );
        return snapshot.with_phase(JobPhase::Failed, reason, message);
    }

    if is_succeeded(job, &owned) {
        let message = format!("job {} completed successfully", job.key);
        return snapshot.with_phase(JobPhase::Succeeded, ConditionReason::JobSucceeded, message);
    }

    if !snapshot.restarts.tickets.is_empty() {
        let message = format!(
            "job {} is restarting {} failed unit(s)",
            job.key,
            snapshot.restarts.tickets.len()
        );
        return snapshot.with_phase(JobPhase::Restarting, ConditionReason::JobRestarting, message);
    }

    if owned.iter().any(|unit| unit.phase == UnitPhase::Running) {
        let message = format!("job {} is running", job.key);
        return snapshot.with_phase(JobPhase::Running, ConditionReason::JobRunning, message);
    }

    snapshot
}

fn is_succeeded(job: &Job, owned: &[&WorkerUnit]) -> bool {
    if job.spec.has_master() {
        return owned.iter().any(|unit| {
            unit.replica_type == ReplicaType::Master && unit.phase == UnitPhase::Succeeded
        });
    }

    let workers: Vec<&&WorkerUnit> = owned
        .iter()
        .filter(|unit| unit.replica_type == ReplicaType::Worker)
        .collect();
    let expected = expected_workers(job).max(1) as usize;
    workers.len() >= expected && workers.iter().all(|unit| unit.phase == UnitPhase::Succeeded)
}

fn terminal_reason(phase: JobPhase) -> ConditionReason {
    match phase {
        JobPhase::Succeeded => ConditionReason::JobSucceeded,
        _ => ConditionReason::UnitFailed,
    }
}
