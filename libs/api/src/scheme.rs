//! Kind registration, defaulting and manifest decoding.
//!
//! A [`Scheme`] starts empty. Binaries call [`register`] once at start-up;
//! nothing is registered implicitly.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trainjob_id::JobKey;

use crate::error::ApiError;
use crate::job::Job;
use crate::spec::{CleanPodPolicy, JobSpec, ReplicaType, RestartPolicy};

pub const GROUP: &str = "training.trainjob.io";
pub const VERSION: &str = "v1";
pub const KIND: &str = "TrainingJob";
pub const LIST_KIND: &str = "TrainingJobList";

const DEFAULT_NAMESPACE: &str = "default";

/// Fully qualified kind of a resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// Split an `apiVersion` of the form `group/version`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

/// Function applied to every decoded spec before it is handed out.
pub type Defaulter = fn(&mut JobSpec);

/// Registry of known kinds and their defaulting functions.
#[derive(Debug, Default)]
pub struct Scheme {
    kinds: BTreeSet<GroupVersionKind>,
    defaulters: Vec<Defaulter>,
}

impl Scheme {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_known_kind(&mut self, gvk: GroupVersionKind) -> Result<(), ApiError> {
        if self.kinds.contains(&gvk) {
            return Err(ApiError::AlreadyRegistered(gvk.to_string()));
        }
        self.kinds.insert(gvk);
        Ok(())
    }

    pub fn add_defaulter(&mut self, defaulter: Defaulter) {
        self.defaulters.push(defaulter);
    }

    pub fn is_registered(&self, gvk: &GroupVersionKind) -> bool {
        self.kinds.contains(gvk)
    }

    pub fn known_kinds(&self) -> impl Iterator<Item = &GroupVersionKind> {
        self.kinds.iter()
    }

    /// Run every registered defaulter over `spec`.
    pub fn default_spec(&self, spec: &mut JobSpec) {
        for defaulter in &self.defaulters {
            defaulter(spec);
        }
    }

    /// Decode a single `TrainingJob` manifest.
    pub fn decode_job(&self, bytes: &[u8], now: DateTime<Utc>) -> Result<Job, ApiError> {
        let manifest: JobManifest = serde_json::from_slice(bytes)?;
        self.check_kind(&manifest.api_version, &manifest.kind, KIND)?;
        self.job_from_manifest(manifest, now)
    }

    /// Decode either a `TrainingJob` or a `TrainingJobList` manifest.
    pub fn decode_jobs(&self, bytes: &[u8], now: DateTime<Utc>) -> Result<Vec<Job>, ApiError> {
        let header: TypeMeta = serde_json::from_slice(bytes)?;
        if header.kind == LIST_KIND {
            self.check_kind(&header.api_version, &header.kind, LIST_KIND)?;
            let list: JobListManifest = serde_json::from_slice(bytes)?;
            list.items
                .into_iter()
                .map(|item| self.job_from_manifest(item, now))
                .collect()
        } else {
            Ok(vec![self.decode_job(bytes, now)?])
        }
    }

    fn check_kind(&self, api_version: &str, kind: &str, expected: &str) -> Result<(), ApiError> {
        let gvk = GroupVersionKind::from_api_version(api_version, kind);
        if kind != expected || !self.is_registered(&gvk) {
            return Err(ApiError::UnregisteredKind {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
            });
        }
        Ok(())
    }

    fn job_from_manifest(
        &self,
        manifest: JobManifest,
        now: DateTime<Utc>,
    ) -> Result<Job, ApiError> {
        let key = JobKey::new(&manifest.metadata.namespace, &manifest.metadata.name)?;
        let mut spec = manifest.spec;
        if spec.replica_specs.is_empty() {
            return Err(ApiError::InvalidManifest(format!(
                "{key}: at least one replica spec is required"
            )));
        }
        self.default_spec(&mut spec);
        Ok(Job::new(key, spec, now))
    }
}

/// Register the training job kinds and defaults with `scheme`.
pub fn register(scheme: &mut Scheme) -> Result<(), ApiError> {
    scheme.add_known_kind(GroupVersionKind::new(GROUP, VERSION, KIND))?;
    scheme.add_known_kind(GroupVersionKind::new(GROUP, VERSION, LIST_KIND))?;
    scheme.add_defaulter(set_defaults);
    Ok(())
}

/// Defaults for a training job spec.
///
/// An elastic Worker group keeps an unset replica count so the planner can
/// start it at `minReplicas`.
pub fn set_defaults(spec: &mut JobSpec) {
    let elastic = spec.is_elastic();
    for (rtype, replica) in spec.replica_specs.iter_mut() {
        if replica.restart_policy.is_none() {
            replica.restart_policy = Some(RestartPolicy::OnFailure);
        }
        if replica.replicas.is_none() && !(elastic && *rtype == ReplicaType::Worker) {
            replica.replicas = Some(1);
        }
    }
    if spec.run_policy.clean_pod_policy.is_none() {
        spec.run_policy.clean_pod_policy = Some(CleanPodPolicy::None);
    }
}

// =============================================================================
// Manifests
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeMeta {
    api_version: String,
    kind: String,
}

/// Object metadata carried by a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// On-disk form of a training job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobManifest {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: JobSpec,
}

#[derive(Debug, Deserialize)]
struct JobListManifest {
    #[serde(default)]
    items: Vec<JobManifest>,
}
