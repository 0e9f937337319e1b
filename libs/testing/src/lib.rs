//! # trainjob-testing
//!
//! Builders for jobs and worker units used across the test suites.
//!
//! All timestamps are derived from a fixed epoch via [`at`] so tests never
//! depend on wall-clock time.

use chrono::{DateTime, TimeZone, Utc};
use trainjob_api::{
    unit_name, CleanPodPolicy, ElasticPolicy, Job, JobSpec, JobStatus, MetricSource, MetricSpec,
    MetricTarget, ReplicaSpec, ReplicaType, RestartPolicy, UnitPhase, UnitTemplate, WorkerUnit,
};
use trainjob_id::{JobKey, UnitId};

/// Fixed base instant for fixtures.
pub const EPOCH_SECS: i64 = 1_700_000_000;

pub const IMAGE: &str = "trainer:latest";

/// `EPOCH_SECS + secs` as a UTC timestamp.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(EPOCH_SECS + secs, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn job_key(name: &str) -> JobKey {
    JobKey::new("default", name).unwrap_or_else(|err| panic!("invalid fixture key {name}: {err}"))
}

pub fn template() -> UnitTemplate {
    UnitTemplate {
        image: IMAGE.to_string(),
        ..Default::default()
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// Fluent builder for [`Job`].
#[derive(Debug, Clone)]
pub struct JobBuilder {
    key: JobKey,
    spec: JobSpec,
    status: JobStatus,
    created_at: DateTime<Utc>,
}

impl JobBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            key: job_key(name),
            spec: JobSpec::default(),
            status: JobStatus::default(),
            created_at: at(0),
        }
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.key = JobKey::new(namespace, self.key.name())
            .unwrap_or_else(|err| panic!("invalid fixture namespace {namespace}: {err}"));
        self
    }

    pub fn master(mut self) -> Self {
        self.spec
            .replica_specs
            .insert(ReplicaType::Master, replica(Some(1)));
        self
    }

    pub fn workers(mut self, count: u32) -> Self {
        self.spec
            .replica_specs
            .insert(ReplicaType::Worker, replica(Some(count)));
        self
    }

    /// Worker group with no explicit replica count.
    pub fn unsized_workers(mut self) -> Self {
        self.spec
            .replica_specs
            .insert(ReplicaType::Worker, replica(None));
        self
    }

    pub fn elastic(mut self, min: Option<u32>, max: Option<u32>) -> Self {
        let policy = self.spec.elastic_policy.get_or_insert_with(ElasticPolicy::default);
        policy.min_replicas = min;
        policy.max_replicas = max;
        self
    }

    pub fn elastic_policy(mut self, edit: impl FnOnce(&mut ElasticPolicy)) -> Self {
        edit(self.spec.elastic_policy.get_or_insert_with(ElasticPolicy::default));
        self
    }

    /// Add a CPU utilization metric so the job owns an autoscaler binding.
    pub fn metric(self, name: &str) -> Self {
        let metric = MetricSpec {
            source: MetricSource::Resource,
            name: name.to_string(),
            target: MetricTarget::Utilization {
                average_utilization: 80,
            },
        };
        self.elastic_policy(|policy| policy.metrics.push(metric))
    }

    pub fn restart_policy(mut self, rtype: ReplicaType, policy: RestartPolicy) -> Self {
        if let Some(spec) = self.spec.replica_specs.get_mut(&rtype) {
            spec.restart_policy = Some(policy);
        }
        self
    }

    pub fn backoff_limit(mut self, limit: u32) -> Self {
        self.spec.run_policy.backoff_limit = Some(limit);
        self
    }

    pub fn active_deadline(mut self, seconds: u64) -> Self {
        self.spec.run_policy.active_deadline_seconds = Some(seconds);
        self
    }

    pub fn clean_pod_policy(mut self, policy: CleanPodPolicy) -> Self {
        self.spec.run_policy.clean_pod_policy = Some(policy);
        self
    }

    pub fn ttl_after_finished(mut self, seconds: u64) -> Self {
        self.spec.run_policy.ttl_seconds_after_finished = Some(seconds);
        self
    }

    pub fn status(mut self, edit: impl FnOnce(&mut JobStatus)) -> Self {
        edit(&mut self.status);
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn build(self) -> Job {
        let mut job = Job::new(self.key, self.spec, self.created_at);
        job.status = self.status;
        job
    }
}

fn replica(replicas: Option<u32>) -> ReplicaSpec {
    ReplicaSpec {
        replicas,
        template: template(),
        restart_policy: None,
    }
}

// =============================================================================
// Worker Units
// =============================================================================

/// Fluent builder for a [`WorkerUnit`] owned by a job.
#[derive(Debug, Clone)]
pub struct UnitBuilder {
    unit: WorkerUnit,
}

/// Start building unit `index` of `rtype` for `job`, initially Pending.
pub fn unit(job: &Job, rtype: ReplicaType, index: u32) -> UnitBuilder {
    UnitBuilder {
        unit: WorkerUnit {
            id: UnitId::new(),
            name: unit_name(&job.key, rtype, index),
            job: job.key.clone(),
            job_uid: job.uid,
            replica_type: rtype,
            index,
            phase: UnitPhase::Pending,
            restart_count: 0,
            exit_code: None,
            created_at: at(1),
            finished_at: None,
        },
    }
}

impl UnitBuilder {
    pub fn phase(mut self, phase: UnitPhase) -> Self {
        self.unit.phase = phase;
        self
    }

    pub fn running(self) -> Self {
        self.phase(UnitPhase::Running)
    }

    pub fn succeeded(mut self) -> Self {
        self.unit.exit_code = Some(0);
        self.unit.finished_at = Some(self.unit.created_at);
        self.phase(UnitPhase::Succeeded)
    }

    pub fn failed(mut self, exit_code: i32) -> Self {
        self.unit.exit_code = Some(exit_code);
        self.unit.finished_at = Some(self.unit.created_at);
        self.phase(UnitPhase::Failed)
    }

    pub fn restart_count(mut self, count: u32) -> Self {
        self.unit.restart_count = count;
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.unit.created_at = created_at;
        self
    }

    pub fn id(mut self, id: UnitId) -> Self {
        self.unit.id = id;
        self
    }

    pub fn build(self) -> WorkerUnit {
        self.unit
    }
}

/// `count` units of `rtype`, ordinals `0..count`, all in `phase`.
pub fn units(job: &Job, rtype: ReplicaType, count: u32, phase: UnitPhase) -> Vec<WorkerUnit> {
    (0..count)
        .map(|index| unit(job, rtype, index).phase(phase).build())
        .collect()
}
