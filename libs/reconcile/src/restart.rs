//! Restart budgeting.
//!
//! Counters live in the job status, never in controller memory, so a freshly
//! started controller makes the same decisions as the one that crashed.
//!
//! Charging is write-ahead: a failed unit is added to the status ledger and
//! the counters are bumped in the same status write, before the unit is
//! deleted. A unit already in the ledger is never charged again.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use trainjob_api::{ChargedFailure, ConditionReason, Job, JobStatus, ReplicaType, WorkerUnit};
use trainjob_id::UnitId;

/// Whether another recreation fits in the job-level budget.
///
/// No limit means unlimited restarts.
pub fn may_restart(restart_count: u32, backoff_limit: Option<u32>) -> bool {
    backoff_limit.map_or(true, |limit| restart_count < limit)
}

/// Whether `total_restarts` has gone past the job-level budget.
pub fn budget_exceeded(total_restarts: u32, backoff_limit: Option<u32>) -> bool {
    backoff_limit.is_some_and(|limit| total_restarts > limit)
}

/// Why a failed unit may not be recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDenial {
    /// The replica's restart policy forbids it.
    Policy,
    /// The job-level `backoffLimit` is spent.
    BackoffLimit,
    /// The elastic `maxRestarts` ceiling for the type is spent.
    MaxRestarts,
}

impl RestartDenial {
    pub fn reason(&self) -> ConditionReason {
        match self {
            RestartDenial::Policy => ConditionReason::UnitFailed,
            RestartDenial::BackoffLimit => ConditionReason::BackoffLimitExceeded,
            RestartDenial::MaxRestarts => ConditionReason::MaxRestartsExceeded,
        }
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// Restart counters for one job, seeded from its persisted status.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    backoff_limit: Option<u32>,
    /// Per-type ceilings, from elastic `maxRestarts`.
    ceilings: BTreeMap<ReplicaType, u32>,
    job_restarts: u32,
    replica_restarts: BTreeMap<ReplicaType, u32>,
}

impl RestartTracker {
    pub fn new(backoff_limit: Option<u32>) -> Self {
        Self {
            backoff_limit,
            ceilings: BTreeMap::new(),
            job_restarts: 0,
            replica_restarts: BTreeMap::new(),
        }
    }

    pub fn with_ceiling(mut self, rtype: ReplicaType, max_restarts: u32) -> Self {
        self.ceilings.insert(rtype, max_restarts);
        self
    }

    /// Tracker for `job`, starting from the counters in its status.
    pub fn for_job(job: &Job) -> Self {
        let mut tracker = Self::new(job.spec.run_policy.backoff_limit);
        if let Some(max_restarts) = job.spec.elastic().and_then(|policy| policy.max_restarts) {
            tracker = tracker.with_ceiling(ReplicaType::Worker, max_restarts);
        }
        tracker.job_restarts = job.status.restart_count;
        tracker.replica_restarts = job.status.replica_restarts.clone();
        tracker
    }

    pub fn job_restarts(&self) -> u32 {
        self.job_restarts
    }

    pub fn replica_restarts(&self, rtype: ReplicaType) -> u32 {
        self.replica_restarts.get(&rtype).copied().unwrap_or(0)
    }

    /// Whether one more recreation of `rtype` is within budget.
    pub fn check(&self, rtype: ReplicaType) -> Result<(), RestartDenial> {
        if let Some(ceiling) = self.ceilings.get(&rtype) {
            if self.replica_restarts(rtype) >= *ceiling {
                return Err(RestartDenial::MaxRestarts);
            }
        }
        if !may_restart(self.job_restarts, self.backoff_limit) {
            return Err(RestartDenial::BackoffLimit);
        }
        Ok(())
    }

    pub fn record_restart(&mut self, rtype: ReplicaType) {
        self.job_restarts = self.job_restarts.saturating_add(1);
        let count = self.replica_restarts.entry(rtype).or_insert(0);
        *count = count.saturating_add(1);
    }
}

// =============================================================================
// Plan
// =============================================================================

/// A failed unit that will be deleted and recreated at the same ordinal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartTicket {
    pub unit_id: UnitId,
    pub replica_type: ReplicaType,
    pub index: u32,
    pub failed_at: DateTime<Utc>,
    /// Already in the ledger from an earlier pass.
    pub charged: bool,
}

/// A failed unit that may not be recreated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartRefusal {
    pub unit_id: UnitId,
    pub replica_type: ReplicaType,
    pub index: u32,
    pub denial: RestartDenial,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartPlan {
    pub tickets: Vec<RestartTicket>,
    pub refusals: Vec<RestartRefusal>,
}

impl RestartPlan {
    /// Tickets that still have to be written to the ledger.
    pub fn uncharged(&self) -> impl Iterator<Item = &RestartTicket> {
        self.tickets.iter().filter(|ticket| !ticket.charged)
    }

    pub fn first_refusal(&self) -> Option<&RestartRefusal> {
        self.refusals.first()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty() && self.refusals.is_empty()
    }
}

/// Decide, for every failed unit, whether it is recreated.
///
/// Units are considered in `(type, ordinal)` order so the same inputs always
/// spend the budget on the same units.
pub fn plan_restarts<'a>(
    job: &Job,
    failed: impl IntoIterator<Item = &'a WorkerUnit>,
) -> RestartPlan {
    let mut failed: Vec<&WorkerUnit> = failed.into_iter().collect();
    failed.sort_by_key(|unit| (unit.replica_type, unit.index, unit.created_at));

    let mut tracker = RestartTracker::for_job(job);
    let mut plan = RestartPlan::default();

    for unit in failed {
        let failed_at = unit.finished_at.unwrap_or(unit.created_at);
        if job.status.is_charged(&unit.id) {
            plan.tickets.push(RestartTicket {
                unit_id: unit.id,
                replica_type: unit.replica_type,
                index: unit.index,
                failed_at,
                charged: true,
            });
            continue;
        }

        let policy = job
            .spec
            .replica(unit.replica_type)
            .map(|spec| spec.restart_policy())
            .unwrap_or_default();
        let verdict = if policy.permits_restart(unit.exit_code) {
            tracker.check(unit.replica_type)
        } else {
            Err(RestartDenial::Policy)
        };

        match verdict {
            Ok(()) => {
                tracker.record_restart(unit.replica_type);
                plan.tickets.push(RestartTicket {
                    unit_id: unit.id,
                    replica_type: unit.replica_type,
                    index: unit.index,
                    failed_at,
                    charged: false,
                });
            }
            Err(denial) => plan.refusals.push(RestartRefusal {
                unit_id: unit.id,
                replica_type: unit.replica_type,
                index: unit.index,
                denial,
            }),
        }
    }

    plan
}

/// Write the uncharged tickets of `plan` into `status`.
///
/// Returns the number of restarts charged.
pub fn charge(status: &mut JobStatus, plan: &RestartPlan, now: DateTime<Utc>) -> u32 {
    let mut charged = 0;
    for ticket in plan.uncharged() {
        if status.is_charged(&ticket.unit_id) {
            continue;
        }
        status.charged_failures.push(ChargedFailure {
            unit_id: ticket.unit_id,
            replica_type: ticket.replica_type,
            index: ticket.index,
            failed_at: ticket.failed_at,
        });
        status.restart_count = status.restart_count.saturating_add(1);
        let per_type = status.replica_restarts.entry(ticket.replica_type).or_insert(0);
        *per_type = per_type.saturating_add(1);
        status.last_restart_time = Some(now);
        charged += 1;
    }
    charged
}

/// Drop ledger entries whose unit is gone.
pub fn prune_ledger(status: &mut JobStatus, units: &[WorkerUnit]) {
    status
        .charged_failures
        .retain(|charge| units.iter().any(|unit| unit.id == charge.unit_id));
}
