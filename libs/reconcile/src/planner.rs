//! Elastic membership planning.
//!
//! Turns a snapshot, the elastic bounds and an optional autoscaler proposal
//! into the desired unit count per replica type plus the rendezvous block
//! handed to every unit.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use trainjob_api::{ElasticPolicy, Job, MembershipRecord, ReplicaType, WorkerUnit};

use crate::rendezvous::{self, Rendezvous};
use crate::status::StatusSnapshot;

/// Inclusive Worker count bounds of an elastic job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElasticBounds {
    pub min: u32,
    pub max: u32,
}

impl ElasticBounds {
    /// Normalize the policy's bounds.
    ///
    /// A missing `max` falls back to the static count (or `min`), a missing
    /// `min` to 1. Inverted bounds collapse onto `min`.
    pub fn from_policy(policy: &ElasticPolicy, static_count: Option<u32>) -> Self {
        let (min, max) = match (policy.min_replicas, policy.max_replicas) {
            (Some(min), Some(max)) => (min, max),
            (Some(min), None) => (min, static_count.unwrap_or(min)),
            (None, Some(max)) => (max.min(1), max),
            (None, None) => {
                let count = static_count.unwrap_or(1);
                (count, count)
            }
        };
        Self {
            min,
            max: max.max(min),
        }
    }

    pub fn clamp(&self, count: u32) -> u32 {
        count.clamp(self.min, self.max)
    }
}

/// What the reconciler should converge to in this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredState {
    pub replicas: BTreeMap<ReplicaType, u32>,
    pub bounds: Option<ElasticBounds>,
    pub rendezvous: Option<Rendezvous>,
}

impl DesiredState {
    pub fn count(&self, rtype: ReplicaType) -> u32 {
        self.replicas.get(&rtype).copied().unwrap_or(0)
    }

    pub fn world_size(&self) -> u32 {
        self.replicas.values().sum()
    }

    /// Membership record to persist, reusing `previous` when nothing changed.
    pub fn membership_record(
        &self,
        previous: Option<&MembershipRecord>,
        now: DateTime<Utc>,
    ) -> Option<MembershipRecord> {
        let rendezvous = self.rendezvous.as_ref()?;
        let worker_count = self.count(ReplicaType::Worker);
        if let Some(previous) = previous {
            if previous.worker_count == worker_count
                && previous.rendezvous_endpoint.as_deref() == Some(rendezvous.endpoint.as_str())
            {
                return Some(previous.clone());
            }
        }
        Some(MembershipRecord {
            worker_count,
            rendezvous_endpoint: Some(rendezvous.endpoint.clone()),
            assigned_at: now,
        })
    }
}

fn explicit_worker_count(job: &Job) -> Option<u32> {
    job.spec
        .replica(ReplicaType::Worker)
        .and_then(|spec| spec.replicas)
}

/// Elastic bounds of `job`, if elastic mode is on.
pub fn bounds(job: &Job) -> Option<ElasticBounds> {
    job.spec
        .elastic()
        .map(|policy| ElasticBounds::from_policy(policy, explicit_worker_count(job)))
}

/// The Worker count the job is currently expected to run.
pub fn expected_workers(job: &Job) -> u32 {
    match bounds(job) {
        Some(bounds) => bounds.clamp(
            job.status
                .membership
                .as_ref()
                .map(|record| record.worker_count)
                .or_else(|| explicit_worker_count(job))
                .unwrap_or(bounds.min),
        ),
        None => job.spec.static_replicas(ReplicaType::Worker),
    }
}

/// Compute the desired state for `job`.
///
/// With elastic mode off the Worker count is the static spec count and any
/// proposal is ignored. With it on, the count is the proposal, else the last
/// assigned membership, else the units already active, else the explicit
/// spec count, else `minReplicas`, clamped into the bounds.
pub fn plan_membership(
    job: &Job,
    snapshot: &StatusSnapshot,
    proposed: Option<u32>,
) -> DesiredState {
    let mut replicas = BTreeMap::new();
    if job.spec.has_master() {
        replicas.insert(
            ReplicaType::Master,
            job.spec.static_replicas(ReplicaType::Master),
        );
    }

    let bounds = bounds(job);
    let has_workers = job.spec.replica(ReplicaType::Worker).is_some();

    if has_workers {
        let workers = match bounds {
            Some(bounds) => {
                let active = snapshot.replica(ReplicaType::Worker).active;
                let current = proposed
                    .or_else(|| job.status.membership.as_ref().map(|m| m.worker_count))
                    .or((active > 0).then_some(active))
                    .or_else(|| explicit_worker_count(job))
                    .unwrap_or(bounds.min);
                bounds.clamp(current)
            }
            None => job.spec.static_replicas(ReplicaType::Worker),
        };
        replicas.insert(ReplicaType::Worker, workers);
    }

    let rendezvous = match (job.spec.elastic(), bounds) {
        (Some(policy), Some(bounds)) => Some(rendezvous::resolve(&job.key, policy, bounds)),
        _ => None,
    };

    DesiredState {
        replicas,
        bounds,
        rendezvous,
    }
}

/// Units to remove when shrinking to `desired`: every ordinal at or above
/// `desired`, highest ordinal first.
pub fn select_scale_down_victims<'a>(
    units: impl IntoIterator<Item = &'a WorkerUnit>,
    desired: u32,
) -> Vec<&'a WorkerUnit> {
    let mut victims: Vec<&WorkerUnit> = units
        .into_iter()
        .filter(|unit| unit.index >= desired)
        .collect();
    victims.sort_by(|a, b| {
        b.index
            .cmp(&a.index)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
    victims
}
