//! Rendezvous resolution and launch environment.
//!
//! Elastic configuration is never rejected. Conflicting settings are settled
//! by override rules: `standalone` wins over any explicit backend, endpoint
//! or id.

use std::collections::BTreeMap;

use trainjob_api::{
    unit_name, ElasticPolicy, Job, RdzvBackend, RdzvConf, ReplicaType, WorkerUnitSpec,
};
use trainjob_id::JobKey;

use crate::planner::{DesiredState, ElasticBounds};
use crate::ReconcileError;

/// Port of the rendezvous store, standalone or defaulted.
pub const RDZV_PORT: u16 = 29400;

/// Host of a standalone rendezvous store.
pub const LOOPBACK: &str = "127.0.0.1";

/// Master port for non-elastic launches without an explicit template port.
pub const DEFAULT_MASTER_PORT: u16 = 23456;

pub const ENV_MASTER_ADDR: &str = "MASTER_ADDR";
pub const ENV_MASTER_PORT: &str = "MASTER_PORT";
pub const ENV_WORLD_SIZE: &str = "WORLD_SIZE";
pub const ENV_RANK: &str = "RANK";
pub const ENV_PYTHONUNBUFFERED: &str = "PYTHONUNBUFFERED";
pub const ENV_RDZV_BACKEND: &str = "PET_RDZV_BACKEND";
pub const ENV_RDZV_ENDPOINT: &str = "PET_RDZV_ENDPOINT";
pub const ENV_RDZV_ID: &str = "PET_RDZV_ID";
pub const ENV_RDZV_CONF: &str = "PET_RDZV_CONF";
pub const ENV_STANDALONE: &str = "PET_STANDALONE";
pub const ENV_NNODES: &str = "PET_NNODES";
pub const ENV_NPROC_PER_NODE: &str = "PET_NPROC_PER_NODE";
pub const ENV_MAX_RESTARTS: &str = "PET_MAX_RESTARTS";

/// Resolved rendezvous parameters for an elastic job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendezvous {
    pub backend: RdzvBackend,
    /// `host:port`.
    pub endpoint: String,
    pub id: Option<String>,
    pub conf: Vec<RdzvConf>,
    pub standalone: bool,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub n_proc_per_node: Option<u32>,
    pub max_restarts: Option<u32>,
}

/// Resolve the rendezvous block for an elastic job.
pub fn resolve(key: &JobKey, policy: &ElasticPolicy, bounds: ElasticBounds) -> Rendezvous {
    let (backend, endpoint, id, conf) = if policy.is_standalone() {
        (
            RdzvBackend::C10d,
            format!("{LOOPBACK}:{RDZV_PORT}"),
            None,
            Vec::new(),
        )
    } else {
        let host = policy
            .rdzv_host
            .clone()
            .unwrap_or_else(|| unit_name(key, ReplicaType::Worker, 0));
        let port = policy.rdzv_port.unwrap_or(RDZV_PORT);
        (
            policy.rdzv_backend.unwrap_or_default(),
            format!("{host}:{port}"),
            policy.rdzv_id.clone(),
            policy.rdzv_conf.clone(),
        )
    };

    Rendezvous {
        backend,
        endpoint,
        id,
        conf,
        standalone: policy.is_standalone(),
        min_nodes: bounds.min,
        max_nodes: bounds.max,
        n_proc_per_node: policy.n_proc_per_node,
        max_restarts: policy.max_restarts,
    }
}

impl Rendezvous {
    fn env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(ENV_RDZV_BACKEND.to_string(), self.backend.to_string());
        env.insert(ENV_RDZV_ENDPOINT.to_string(), self.endpoint.clone());
        if let Some(id) = &self.id {
            env.insert(ENV_RDZV_ID.to_string(), id.clone());
        }
        if !self.conf.is_empty() {
            let conf = self
                .conf
                .iter()
                .map(|entry| format!("{}={}", entry.key, entry.value))
                .collect::<Vec<_>>()
                .join(",");
            env.insert(ENV_RDZV_CONF.to_string(), conf);
        }
        if self.standalone {
            env.insert(ENV_STANDALONE.to_string(), "1".to_string());
        }
        env.insert(
            ENV_NNODES.to_string(),
            format!("{}:{}", self.min_nodes, self.max_nodes),
        );
        env.insert(
            ENV_NPROC_PER_NODE.to_string(),
            self.n_proc_per_node.unwrap_or(1).to_string(),
        );
        if let Some(max_restarts) = self.max_restarts {
            env.insert(ENV_MAX_RESTARTS.to_string(), max_restarts.to_string());
        }
        env
    }
}

/// Launch environment for unit `index` of `rtype`.
pub fn launch_env(
    job: &Job,
    desired: &DesiredState,
    rtype: ReplicaType,
    index: u32,
) -> BTreeMap<String, String> {
    let mut env = match &desired.rendezvous {
        Some(rendezvous) => rendezvous.env(),
        None => static_env(job, desired, rtype, index),
    };
    env.insert(ENV_PYTHONUNBUFFERED.to_string(), "1".to_string());
    env
}

fn static_env(
    job: &Job,
    desired: &DesiredState,
    rtype: ReplicaType,
    index: u32,
) -> BTreeMap<String, String> {
    let has_master = desired.count(ReplicaType::Master) > 0;
    let (coordinator, port) = if has_master {
        let port = job
            .spec
            .replica(ReplicaType::Master)
            .and_then(|spec| spec.template.port);
        (ReplicaType::Master, port)
    } else {
        let port = job
            .spec
            .replica(ReplicaType::Worker)
            .and_then(|spec| spec.template.port);
        (ReplicaType::Worker, port)
    };
    let rank = match rtype {
        ReplicaType::Master => 0,
        ReplicaType::Worker if has_master => index + 1,
        ReplicaType::Worker => index,
    };

    let mut env = BTreeMap::new();
    env.insert(
        ENV_MASTER_ADDR.to_string(),
        unit_name(&job.key, coordinator, 0),
    );
    env.insert(
        ENV_MASTER_PORT.to_string(),
        port.unwrap_or(DEFAULT_MASTER_PORT).to_string(),
    );
    env.insert(ENV_WORLD_SIZE.to_string(), desired.world_size().to_string());
    env.insert(ENV_RANK.to_string(), rank.to_string());
    env
}

/// Full unit spec for `(rtype, index)`.
///
/// Launch variables override same-named template variables.
pub fn render_unit_spec(
    job: &Job,
    desired: &DesiredState,
    rtype: ReplicaType,
    index: u32,
) -> Result<WorkerUnitSpec, ReconcileError> {
    let replica = job
        .spec
        .replica(rtype)
        .ok_or_else(|| ReconcileError::MissingReplicaSpec {
            job: job.key.to_string(),
            replica_type: rtype,
        })?;
    let mut template = replica.template.clone();
    template.env.extend(launch_env(job, desired, rtype, index));
    Ok(WorkerUnitSpec {
        name: unit_name(&job.key, rtype, index),
        job: job.key.clone(),
        job_uid: job.uid,
        replica_type: rtype,
        index,
        restart_policy: replica.restart_policy(),
        template,
    })
}
