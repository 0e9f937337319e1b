//! Desired-versus-actual unit diffing.

use std::collections::BTreeMap;
use std::fmt;

use trainjob_api::{CleanPodPolicy, Job, ReplicaType, UnitPhase, WorkerUnit};
use trainjob_id::UnitId;

use crate::planner::{select_scale_down_victims, DesiredState};
use crate::status::is_owned;
use crate::ConvergenceStatus;

/// Why a unit is being deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    /// Ordinal at or above the desired count.
    ScaleDown,
    /// A second unit for an ordinal that already has one.
    Duplicate,
    /// Left behind by a previous incarnation or an undeclared replica type.
    Stale,
    /// Charged failure, recreated at the same ordinal.
    Restart,
    /// Terminal-phase cleanup.
    Cleanup,
    /// The finished job's TTL elapsed.
    Expired,
}

impl fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeleteReason::ScaleDown => "scale_down",
            DeleteReason::Duplicate => "duplicate",
            DeleteReason::Stale => "stale",
            DeleteReason::Restart => "restart",
            DeleteReason::Cleanup => "cleanup",
            DeleteReason::Expired => "expired",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDeletion {
    pub unit_id: UnitId,
    pub name: String,
    pub replica_type: ReplicaType,
    pub index: u32,
    pub reason: DeleteReason,
}

impl UnitDeletion {
    fn new(unit: &WorkerUnit, reason: DeleteReason) -> Self {
        Self {
            unit_id: unit.id,
            name: unit.name.clone(),
            replica_type: unit.replica_type,
            index: unit.index,
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitCreation {
    pub replica_type: ReplicaType,
    pub index: u32,
    /// Failed unit this creation replaces; only created once that delete
    /// went through.
    pub replaces: Option<UnitId>,
}

/// Creates and deletes needed to reach the desired state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitDiff {
    pub creates: Vec<UnitCreation>,
    pub deletes: Vec<UnitDeletion>,
}

impl UnitDiff {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.deletes.is_empty()
    }

    pub fn convergence(&self) -> ConvergenceStatus {
        if self.is_empty() {
            ConvergenceStatus::Converged
        } else {
            ConvergenceStatus::Converging
        }
    }
}

/// Units listed under the job's key that do not belong to it.
fn stale_units<'a>(job: &'a Job, units: &'a [WorkerUnit]) -> impl Iterator<Item = &'a WorkerUnit> {
    units
        .iter()
        .filter(move |unit| unit.job == job.key && !is_owned(job, unit))
}

/// Diff the observed `units` of a non-terminal job against `desired`.
pub fn diff_units(job: &Job, desired: &DesiredState, units: &[WorkerUnit]) -> UnitDiff {
    let mut diff = UnitDiff::default();

    for unit in stale_units(job, units) {
        diff.deletes.push(UnitDeletion::new(unit, DeleteReason::Stale));
    }

    for rtype in ReplicaType::ALL {
        if job.spec.replica(rtype).is_none() {
            continue;
        }
        let want = desired.count(rtype);
        let owned: Vec<&WorkerUnit> = units
            .iter()
            .filter(|unit| unit.replica_type == rtype && is_owned(job, unit))
            .collect();

        let mut by_index: BTreeMap<u32, Vec<&WorkerUnit>> = BTreeMap::new();
        for unit in owned.iter().copied().filter(|unit| unit.index < want) {
            by_index.entry(unit.index).or_default().push(unit);
        }

        for index in 0..want {
            let Some(candidates) = by_index.get(&index) else {
                diff.creates.push(UnitCreation {
                    replica_type: rtype,
                    index,
                    replaces: None,
                });
                continue;
            };

            let Some(keeper) = candidates
                .iter()
                .copied()
                .min_by_key(|unit| (unit.phase == UnitPhase::Failed, unit.created_at, unit.id))
            else {
                continue;
            };
            for other in candidates.iter().filter(|unit| unit.id != keeper.id) {
                diff.deletes.push(UnitDeletion::new(other, DeleteReason::Duplicate));
            }

            if keeper.phase == UnitPhase::Failed && job.status.is_charged(&keeper.id) {
                diff.deletes.push(UnitDeletion::new(keeper, DeleteReason::Restart));
                diff.creates.push(UnitCreation {
                    replica_type: rtype,
                    index,
                    replaces: Some(keeper.id),
                });
            }
        }

        for victim in select_scale_down_victims(owned.iter().copied(), want) {
            diff.deletes.push(UnitDeletion::new(victim, DeleteReason::ScaleDown));
        }
    }

    diff
}

/// Units to delete for a job in a terminal phase.
///
/// Stale units are always removed; owned units follow the clean-pod policy.
pub fn cleanup_targets(job: &Job, units: &[WorkerUnit]) -> Vec<UnitDeletion> {
    let policy = job.spec.run_policy.clean_pod_policy();
    let mut targets: Vec<UnitDeletion> = stale_units(job, units)
        .map(|unit| UnitDeletion::new(unit, DeleteReason::Stale))
        .collect();
    targets.extend(
        units
            .iter()
            .filter(|unit| is_owned(job, unit))
            .filter(|unit| match policy {
                CleanPodPolicy::All => true,
                CleanPodPolicy::Running => unit.phase.is_active(),
                CleanPodPolicy::None => false,
            })
            .map(|unit| UnitDeletion::new(unit, DeleteReason::Cleanup)),
    );
    targets
}

/// Every unit listed under the job's key, for deletion once its TTL elapsed.
pub fn expired_targets(job: &Job, units: &[WorkerUnit]) -> Vec<UnitDeletion> {
    units
        .iter()
        .filter(|unit| unit.job == job.key)
        .map(|unit| UnitDeletion::new(unit, DeleteReason::Expired))
        .collect()
}
