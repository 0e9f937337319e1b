//! Job specification types.
//!
//! The spec is owned by the user and the admission layer; the controller only
//! reads it. Optional fields are `Option<T>` so that "unset" and an explicit
//! zero stay distinguishable for the defaulting and override rules.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Replica Types and Policies
// =============================================================================

/// Replica group of a training job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ReplicaType {
    /// Singular coordinator; its outcome decides the job outcome.
    Master,
    /// Elastically scalable worker group.
    Worker,
}

impl ReplicaType {
    /// All replica types in reconciliation order.
    pub const ALL: [ReplicaType; 2] = [ReplicaType::Master, ReplicaType::Worker];

    /// Lowercase label used in unit names and addresses.
    pub fn label(&self) -> &'static str {
        match self {
            ReplicaType::Master => "master",
            ReplicaType::Worker => "worker",
        }
    }
}

impl fmt::Display for ReplicaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaType::Master => write!(f, "Master"),
            ReplicaType::Worker => write!(f, "Worker"),
        }
    }
}

/// Restart policy for the units of one replica type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RestartPolicy {
    Always,
    #[default]
    OnFailure,
    Never,
    /// Restart only when the exit code marks a retryable failure.
    ExitCode,
}

impl RestartPolicy {
    /// Whether a unit that failed with `exit_code` may be recreated.
    pub fn permits_restart(&self, exit_code: Option<i32>) -> bool {
        match self {
            RestartPolicy::Always | RestartPolicy::OnFailure => true,
            RestartPolicy::Never => false,
            RestartPolicy::ExitCode => exit_code.map_or(true, is_retryable_exit_code),
        }
    }
}

/// Exit codes 1-127 are permanent failures; signal exits (128+) are retryable.
pub fn is_retryable_exit_code(code: i32) -> bool {
    code >= 128
}

/// Which units to delete once a job reaches a terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CleanPodPolicy {
    All,
    Running,
    #[default]
    None,
}

// =============================================================================
// Elastic Policy
// =============================================================================

/// Rendezvous backend for elastic launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RdzvBackend {
    #[default]
    #[serde(rename = "c10d")]
    C10d,
    #[serde(rename = "etcd")]
    Etcd,
    #[serde(rename = "etcd-v2")]
    EtcdV2,
}

impl RdzvBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            RdzvBackend::C10d => "c10d",
            RdzvBackend::Etcd => "etcd",
            RdzvBackend::EtcdV2 => "etcd-v2",
        }
    }
}

impl fmt::Display for RdzvBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `key=value` entry of extra rendezvous configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RdzvConf {
    pub key: String,
    pub value: String,
}

/// Source of an autoscaling metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricSource {
    Resource,
    Pods,
    External,
}

/// Target value an autoscaler steers a metric toward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MetricTarget {
    #[serde(rename_all = "camelCase")]
    Utilization { average_utilization: u32 },
    #[serde(rename_all = "camelCase")]
    AverageValue { average_value: f64 },
    Value { value: f64 },
}

/// A metric the external autoscaler uses to propose a replica count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSpec {
    pub source: MetricSource,
    pub name: String,
    pub target: MetricTarget,
}

/// Elastic scaling and rendezvous settings for the Worker group.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElasticPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rdzv_backend: Option<RdzvBackend>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rdzv_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rdzv_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rdzv_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rdzv_conf: Vec<RdzvConf>,
    /// Run a local C10d store; explicit backend, endpoint and id are ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standalone: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_proc_per_node: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricSpec>,
}

impl ElasticPolicy {
    /// Elastic mode is on when at least one bound is set.
    pub fn is_enabled(&self) -> bool {
        self.min_replicas.is_some() || self.max_replicas.is_some()
    }

    pub fn is_standalone(&self) -> bool {
        self.standalone.unwrap_or(false)
    }

    /// Whether the controller should own an autoscaler binding.
    pub fn has_metrics(&self) -> bool {
        !self.metrics.is_empty()
    }
}

// =============================================================================
// Replica and Run Policy
// =============================================================================

/// Template every unit of a replica group is launched from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitTemplate {
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Port the Master listens on for non-elastic launches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Desired shape of one replica group.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    pub template: UnitTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
}

impl ReplicaSpec {
    pub fn restart_policy(&self) -> RestartPolicy {
        self.restart_policy.unwrap_or_default()
    }
}

/// Job-level operational rules independent of replica topology.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_pod_policy: Option<CleanPodPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<u64>,
}

impl RunPolicy {
    pub fn clean_pod_policy(&self) -> CleanPodPolicy {
        self.clean_pod_policy.unwrap_or_default()
    }

    pub fn active_deadline(&self) -> Option<chrono::Duration> {
        self.active_deadline_seconds.map(seconds)
    }

    pub fn ttl_after_finished(&self) -> Option<chrono::Duration> {
        self.ttl_seconds_after_finished.map(seconds)
    }
}

/// Saturates at [`chrono::Duration::MAX`] instead of panicking on huge values.
fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

// =============================================================================
// Job Spec
// =============================================================================

/// Desired state of a training job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    #[serde(default)]
    pub run_policy: RunPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elastic_policy: Option<ElasticPolicy>,
    pub replica_specs: BTreeMap<ReplicaType, ReplicaSpec>,
}

impl JobSpec {
    /// The elastic policy, only when elastic mode is enabled.
    pub fn elastic(&self) -> Option<&ElasticPolicy> {
        self.elastic_policy.as_ref().filter(|p| p.is_enabled())
    }

    pub fn is_elastic(&self) -> bool {
        self.elastic().is_some()
    }

    pub fn has_master(&self) -> bool {
        self.replica_specs.contains_key(&ReplicaType::Master)
    }

    pub fn replica(&self, rtype: ReplicaType) -> Option<&ReplicaSpec> {
        self.replica_specs.get(&rtype)
    }

    /// Static replica count for a type; Master is singular.
    pub fn static_replicas(&self, rtype: ReplicaType) -> u32 {
        let count = self
            .replica(rtype)
            .map_or(0, |spec| spec.replicas.unwrap_or(1));
        match rtype {
            ReplicaType::Master => count.min(1),
            ReplicaType::Worker => count,
        }
    }
}
