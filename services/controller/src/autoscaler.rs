//! Autoscaler interface and an in-process implementation.
//!
//! The controller owns one binding per elastic job that declares metrics.
//! The autoscaler watches those metrics and proposes a Worker count; the
//! planner clamps whatever it proposes into the job's bounds.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use trainjob_api::MetricSpec;
use trainjob_id::JobKey;

use crate::error::AutoscalerError;

/// Desired autoscaler registration for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoscalerBinding {
    pub job: JobKey,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub metrics: Vec<MetricSpec>,
}

#[async_trait]
pub trait Autoscaler: Send + Sync {
    /// Create or update the binding. Idempotent.
    async fn ensure_binding(&self, binding: &AutoscalerBinding) -> Result<(), AutoscalerError>;

    /// Remove the binding if present. Idempotent.
    async fn remove_binding(&self, key: &JobKey) -> Result<(), AutoscalerError>;

    async fn proposed_replica_count(&self, key: &JobKey) -> Result<u32, AutoscalerError>;
}

/// Autoscaler whose proposals are set by hand.
///
/// Used by the binary in development and by the test suites.
#[derive(Debug, Default)]
pub struct StaticAutoscaler {
    bindings: RwLock<HashMap<JobKey, AutoscalerBinding>>,
    proposals: RwLock<HashMap<JobKey, u32>>,
}

impl StaticAutoscaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn propose(&self, key: &JobKey, count: u32) {
        self.proposals.write().await.insert(key.clone(), count);
    }

    pub async fn withdraw(&self, key: &JobKey) {
        self.proposals.write().await.remove(key);
    }

    pub async fn binding(&self, key: &JobKey) -> Option<AutoscalerBinding> {
        self.bindings.read().await.get(key).cloned()
    }
}

#[async_trait]
impl Autoscaler for StaticAutoscaler {
    async fn ensure_binding(&self, binding: &AutoscalerBinding) -> Result<(), AutoscalerError> {
        let mut bindings = self.bindings.write().await;
        if bindings.get(&binding.job) != Some(binding) {
            debug!(
                job = %binding.job,
                min = binding.min_replicas,
                max = binding.max_replicas,
                metrics = binding.metrics.len(),
                "Autoscaler binding updated"
            );
            bindings.insert(binding.job.clone(), binding.clone());
        }
        Ok(())
    }

    async fn remove_binding(&self, key: &JobKey) -> Result<(), AutoscalerError> {
        if self.bindings.write().await.remove(key).is_some() {
            debug!(job = %key, "Autoscaler binding removed");
        }
        Ok(())
    }

    async fn proposed_replica_count(&self, key: &JobKey) -> Result<u32, AutoscalerError> {
        if !self.bindings.read().await.contains_key(key) {
            return Err(AutoscalerError::Unavailable(key.clone()));
        }
        self.proposals
            .read()
            .await
            .get(key)
            .copied()
            .ok_or_else(|| AutoscalerError::Unavailable(key.clone()))
    }
}
