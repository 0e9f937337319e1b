//! Worker units: the process instances the substrate runs for a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trainjob_id::{JobKey, JobUid, UnitId};

use crate::spec::{ReplicaType, RestartPolicy, UnitTemplate};

/// Observed phase of a worker unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl UnitPhase {
    /// Pending or Running.
    pub fn is_active(&self) -> bool {
        matches!(self, UnitPhase::Pending | UnitPhase::Running)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, UnitPhase::Succeeded | UnitPhase::Failed)
    }
}

/// Deterministic unit name for `(job, type, ordinal)`.
///
/// The substrate rejects a second create under the same name, which is what
/// makes repeated creates for one ordinal harmless.
pub fn unit_name(job: &JobKey, rtype: ReplicaType, index: u32) -> String {
    format!("{}-{}-{}", job.name(), rtype.label(), index)
}

/// Everything the substrate needs to launch one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerUnitSpec {
    pub name: String,
    pub job: JobKey,
    pub job_uid: JobUid,
    pub replica_type: ReplicaType,
    pub index: u32,
    pub restart_policy: RestartPolicy,
    pub template: UnitTemplate,
}

/// A unit as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerUnit {
    pub id: UnitId,
    pub name: String,
    pub job: JobKey,
    pub job_uid: JobUid,
    pub replica_type: ReplicaType,
    pub index: u32,
    pub phase: UnitPhase,
    /// In-place restarts performed by the substrate.
    pub restart_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkerUnit {
    /// Build the record for a freshly created unit.
    pub fn from_spec(id: UnitId, spec: &WorkerUnitSpec, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: spec.name.clone(),
            job: spec.job.clone(),
            job_uid: spec.job_uid,
            replica_type: spec.replica_type,
            index: spec.index,
            phase: UnitPhase::Pending,
            restart_count: 0,
            exit_code: None,
            created_at: now,
            finished_at: None,
        }
    }

    /// Apply a status report from the substrate.
    pub fn apply_status(&mut self, status: &UnitStatus, now: DateTime<Utc>) {
        self.phase = status.phase;
        self.restart_count = status.restart_count;
        self.exit_code = status.exit_code;
        if status.phase.is_finished() && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
    }
}

/// Point-in-time status of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitStatus {
    pub phase: UnitPhase,
    pub restart_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_name_is_deterministic() {
        let key = JobKey::new("default", "bert").unwrap();
        assert_eq!(unit_name(&key, ReplicaType::Worker, 3), "bert-worker-3");
        assert_eq!(unit_name(&key, ReplicaType::Master, 0), "bert-master-0");
    }

    #[test]
    fn test_apply_status_sets_finished_once() {
        let key = JobKey::new("default", "bert").unwrap();
        let spec = WorkerUnitSpec {
            name: unit_name(&key, ReplicaType::Worker, 0),
            job: key,
            job_uid: JobUid::new(),
            replica_type: ReplicaType::Worker,
            index: 0,
            restart_policy: RestartPolicy::OnFailure,
            template: UnitTemplate::default(),
        };
        let t0 = Utc::now();
        let mut unit = WorkerUnit::from_spec(UnitId::new(), &spec, t0);
        assert_eq!(unit.phase, UnitPhase::Pending);

        let failed = UnitStatus {
            phase: UnitPhase::Failed,
            restart_count: 2,
            exit_code: Some(137),
        };
        let t1 = t0 + chrono::Duration::seconds(5);
        unit.apply_status(&failed, t1);
        unit.apply_status(&failed, t1 + chrono::Duration::seconds(5));
        assert_eq!(unit.finished_at, Some(t1));
        assert_eq!(unit.restart_count, 2);
        assert_eq!(unit.exit_code, Some(137));
    }

    #[test]
    fn test_phase_predicates() {
        assert!(UnitPhase::Pending.is_active());
        assert!(UnitPhase::Running.is_active());
        assert!(!UnitPhase::Unknown.is_active());
        assert!(UnitPhase::Failed.is_finished());
        assert!(!UnitPhase::Unknown.is_finished());
    }
}
