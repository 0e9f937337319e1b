//! Job status: the only part of a job the controller writes.
//!
//! Every field here is derived from observed worker units plus the job's own
//! history. Terminal phases are sticky: once a job is Succeeded or Failed no
//! transition leaves that phase.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trainjob_id::UnitId;

use crate::spec::ReplicaType;

/// Maximum number of condition transitions kept on a job.
pub const MAX_CONDITION_HISTORY: usize = 64;

// =============================================================================
// Phase and Conditions
// =============================================================================

/// Job phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JobPhase {
    #[default]
    Created,
    Running,
    Restarting,
    Succeeded,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Created => "Created",
            JobPhase::Running => "Running",
            JobPhase::Restarting => "Restarting",
            JobPhase::Succeeded => "Succeeded",
            JobPhase::Failed => "Failed",
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable reason recorded with each condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionReason {
    JobCreated,
    JobRunning,
    JobRestarting,
    JobSucceeded,
    /// A Master or, without a Master, a required unit failed permanently.
    UnitFailed,
    DeadlineExceeded,
    BackoffLimitExceeded,
    MaxRestartsExceeded,
}

impl ConditionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionReason::JobCreated => "JobCreated",
            ConditionReason::JobRunning => "JobRunning",
            ConditionReason::JobRestarting => "JobRestarting",
            ConditionReason::JobSucceeded => "JobSucceeded",
            ConditionReason::UnitFailed => "UnitFailed",
            ConditionReason::DeadlineExceeded => "DeadlineExceeded",
            ConditionReason::BackoffLimitExceeded => "BackoffLimitExceeded",
            ConditionReason::MaxRestartsExceeded => "MaxRestartsExceeded",
        }
    }
}

impl fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the job's condition history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCondition {
    #[serde(rename = "type")]
    pub phase: JobPhase,
    pub status: bool,
    pub reason: ConditionReason,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

// =============================================================================
// Counters and History
// =============================================================================

/// Unit counts for one replica type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub active: u32,
    pub succeeded: u32,
    pub failed: u32,
}

/// A unit failure that has already been charged to the restart counter.
///
/// Charges are persisted before the failed unit is deleted, so a crash or a
/// write conflict in between can neither lose nor double-count a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargedFailure {
    pub unit_id: UnitId,
    pub replica_type: ReplicaType,
    pub index: u32,
    pub failed_at: DateTime<Utc>,
}

/// Last membership handed to the Worker group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipRecord {
    pub worker_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendezvous_endpoint: Option<String>,
    pub assigned_at: DateTime<Utc>,
}

// =============================================================================
// Job Status
// =============================================================================

/// Most recently observed status of a job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub phase: JobPhase,
    #[serde(default)]
    pub conditions: Vec<JobCondition>,
    #[serde(default)]
    pub replica_statuses: BTreeMap<ReplicaType, ReplicaStatus>,
    /// Unit recreations charged to the job. Never decreases.
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub replica_restarts: BTreeMap<ReplicaType, u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub charged_failures: Vec<ChargedFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub membership: Option<MembershipRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restart_time: Option<DateTime<Utc>>,
}

impl JobStatus {
    /// Move to `phase`, appending a condition when the phase changes.
    ///
    /// Returns false when the transition is refused: leaving a terminal
    /// phase, returning to Created, or staying in the current phase.
    pub fn transition(
        &mut self,
        phase: JobPhase,
        reason: ConditionReason,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> bool {
        let first = self.conditions.is_empty();
        if self.phase == phase && !first {
            return false;
        }
        if self.phase.is_terminal() && self.phase != phase {
            return false;
        }
        if phase == JobPhase::Created && self.phase != JobPhase::Created {
            return false;
        }

        self.phase = phase;
        self.conditions.push(JobCondition {
            phase,
            status: true,
            reason,
            message: message.into(),
            last_transition_time: now,
        });
        if self.conditions.len() > MAX_CONDITION_HISTORY {
            let excess = self.conditions.len() - MAX_CONDITION_HISTORY;
            self.conditions.drain(..excess);
        }
        if phase.is_terminal() && self.completion_time.is_none() {
            self.completion_time = Some(now);
        }
        true
    }

    pub fn latest_condition(&self) -> Option<&JobCondition> {
        self.conditions.last()
    }

    pub fn is_charged(&self, unit_id: &UnitId) -> bool {
        self.charged_failures.iter().any(|c| &c.unit_id == unit_id)
    }

    pub fn replica_restarts(&self, rtype: ReplicaType) -> u32 {
        self.replica_restarts.get(&rtype).copied().unwrap_or(0)
    }
}
