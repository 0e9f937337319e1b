//! In-memory cluster: job store and substrate in one process.
//!
//! Backs the binary in development mode and every controller test. Calls are
//! counted so tests can assert that a pass issued no side effects, and
//! failures can be injected per operation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;
use trainjob_api::{Job, ReplicaType, UnitPhase, UnitStatus, WorkerUnit, WorkerUnitSpec};
use trainjob_id::{JobKey, ResourceVersion, UnitId};

use crate::clock::Clock;
use crate::error::{StoreError, SubstrateError};
use crate::store::{ChangeKind, JobStore, WatchEvent, WatchStream};
use crate::substrate::Substrate;

const WATCH_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Faults {
    create_failures: u32,
    delete_failures: u32,
    update_conflicts: u32,
}

#[derive(Debug, Default)]
struct ClusterState {
    jobs: BTreeMap<JobKey, Job>,
    units: BTreeMap<UnitId, WorkerUnit>,
    specs: HashMap<UnitId, WorkerUnitSpec>,
    /// Units whose listing reports `Unknown` until their status is fetched.
    unknown: HashSet<UnitId>,
    faults: Faults,
}

/// Job store plus substrate, held in memory.
pub struct InMemoryCluster {
    clock: Arc<dyn Clock>,
    /// Newly created units start Running instead of Pending.
    auto_run: bool,
    state: RwLock<ClusterState>,
    events: broadcast::Sender<WatchEvent>,
    create_calls: AtomicU64,
    delete_calls: AtomicU64,
    status_writes: AtomicU64,
}

impl InMemoryCluster {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            clock,
            auto_run: false,
            state: RwLock::new(ClusterState::default()),
            events,
            create_calls: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
            status_writes: AtomicU64::new(0),
        }
    }

    pub fn with_auto_run(mut self, auto_run: bool) -> Self {
        self.auto_run = auto_run;
        self
    }

    fn emit(&self, key: &JobKey, kind: ChangeKind) {
        // No subscribers is fine.
        let _ = self.events.send(WatchEvent::Changed {
            key: key.clone(),
            kind,
        });
    }

    // =========================================================================
    // Inspection and fault injection
    // =========================================================================

    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn status_writes(&self) -> u64 {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// All units of `key` with their true phase, in `(type, ordinal)` order.
    pub async fn units(&self, key: &JobKey) -> Vec<WorkerUnit> {
        let state = self.state.read().await;
        let mut units: Vec<WorkerUnit> = state
            .units
            .values()
            .filter(|unit| &unit.job == key)
            .cloned()
            .collect();
        units.sort_by_key(|unit| (unit.replica_type, unit.index, unit.created_at));
        units
    }

    pub async fn unit_at(
        &self,
        key: &JobKey,
        rtype: ReplicaType,
        index: u32,
    ) -> Option<WorkerUnit> {
        self.units(key)
            .await
            .into_iter()
            .find(|unit| unit.replica_type == rtype && unit.index == index)
    }

    pub async fn unit_spec(&self, id: &UnitId) -> Option<WorkerUnitSpec> {
        self.state.read().await.specs.get(id).cloned()
    }

    /// Report a new phase for one unit, as the substrate would.
    pub async fn set_unit_phase(&self, id: &UnitId, phase: UnitPhase, exit_code: Option<i32>) {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let Some(unit) = state.units.get_mut(id) else {
            return;
        };
        let status = UnitStatus {
            phase,
            restart_count: unit.restart_count,
            exit_code,
        };
        unit.apply_status(&status, now);
        let key = unit.job.clone();
        drop(state);
        self.emit(&key, ChangeKind::UnitChanged);
    }

    /// Move every unit of `key` to `phase`.
    pub async fn set_all_phases(&self, key: &JobKey, phase: UnitPhase) {
        let exit_code = match phase {
            UnitPhase::Succeeded => Some(0),
            UnitPhase::Failed => Some(1),
            _ => None,
        };
        for unit in self.units(key).await {
            self.set_unit_phase(&unit.id, phase, exit_code).await;
        }
    }

    pub async fn set_unit_restart_count(&self, id: &UnitId, restart_count: u32) {
        let mut state = self.state.write().await;
        let Some(unit) = state.units.get_mut(id) else {
            return;
        };
        unit.restart_count = restart_count;
        let key = unit.job.clone();
        drop(state);
        self.emit(&key, ChangeKind::UnitChanged);
    }

    /// Insert a unit directly, bypassing the substrate.
    pub async fn insert_unit(&self, unit: WorkerUnit) {
        let key = unit.job.clone();
        self.state.write().await.units.insert(unit.id, unit);
        self.emit(&key, ChangeKind::UnitChanged);
    }

    /// Make listings report `Unknown` for `id` until its status is fetched.
    pub async fn mark_unknown(&self, id: &UnitId) {
        self.state.write().await.unknown.insert(*id);
    }

    /// Delete a job regardless of its version, as a user would.
    pub async fn remove_job(&self, key: &JobKey) {
        if self.state.write().await.jobs.remove(key).is_some() {
            self.emit(key, ChangeKind::Deleted);
        }
    }

    pub async fn fail_next_creates(&self, count: u32) {
        self.state.write().await.faults.create_failures = count;
    }

    pub async fn fail_next_deletes(&self, count: u32) {
        self.state.write().await.faults.delete_failures = count;
    }

    /// Make the next `count` status writes lose a race to another writer.
    pub async fn conflict_next_updates(&self, count: u32) {
        self.state.write().await.faults.update_conflicts = count;
    }
}

#[async_trait]
impl JobStore for InMemoryCluster {
    async fn get(&self, key: &JobKey) -> Result<Job, StoreError> {
        self.state
            .read()
            .await
            .jobs
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.state.read().await.jobs.values().cloned().collect())
    }

    async fn list_worker_units(&self, key: &JobKey) -> Result<Vec<WorkerUnit>, StoreError> {
        let unknown = self.state.read().await.unknown.clone();
        Ok(self
            .units(key)
            .await
            .into_iter()
            .map(|mut unit| {
                if unknown.contains(&unit.id) {
                    unit.phase = UnitPhase::Unknown;
                }
                unit
            })
            .collect())
    }

    async fn create(&self, mut job: Job) -> Result<ResourceVersion, StoreError> {
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&job.key) {
            return Err(StoreError::AlreadyExists(job.key));
        }
        job.resource_version = ResourceVersion::INITIAL;
        let key = job.key.clone();
        state.jobs.insert(key.clone(), job);
        drop(state);
        self.emit(&key, ChangeKind::Created);
        Ok(ResourceVersion::INITIAL)
    }

    async fn update(
        &self,
        job: &Job,
        expected: ResourceVersion,
    ) -> Result<ResourceVersion, StoreError> {
        let mut state = self.state.write().await;
        let conflict = if state.faults.update_conflicts > 0 {
            state.faults.update_conflicts -= 1;
            true
        } else {
            false
        };
        let stored = state
            .jobs
            .get_mut(&job.key)
            .ok_or_else(|| StoreError::NotFound(job.key.clone()))?;
        if conflict {
            stored.resource_version = stored.resource_version.next();
        }
        if stored.resource_version != expected {
            return Err(StoreError::Conflict {
                key: job.key.clone(),
                expected,
                actual: stored.resource_version,
            });
        }

        stored.status = job.status.clone();
        stored.resource_version = stored.resource_version.next();
        let version = stored.resource_version;
        drop(state);

        self.status_writes.fetch_add(1, Ordering::SeqCst);
        self.emit(&job.key, ChangeKind::Updated);
        Ok(version)
    }

    async fn delete(&self, key: &JobKey, expected: ResourceVersion) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let stored = state
            .jobs
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if stored.resource_version != expected {
            return Err(StoreError::Conflict {
                key: key.clone(),
                expected,
                actual: stored.resource_version,
            });
        }
        state.jobs.remove(key);
        drop(state);
        self.emit(key, ChangeKind::Deleted);
        Ok(())
    }

    fn watch(&self) -> WatchStream {
        BroadcastStream::new(self.events.subscribe())
            .map(|event| event.unwrap_or(WatchEvent::Resync))
            .boxed()
    }
}

#[async_trait]
impl Substrate for InMemoryCluster {
    async fn create_worker_unit(&self, spec: &WorkerUnitSpec) -> Result<UnitId, SubstrateError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.clock.now();
        let mut state = self.state.write().await;
        if state.faults.create_failures > 0 {
            state.faults.create_failures -= 1;
            return Err(SubstrateError::Unavailable(format!(
                "injected create failure for {}",
                spec.name
            )));
        }
        if state.units.values().any(|unit| unit.name == spec.name) {
            return Err(SubstrateError::AlreadyExists(spec.name.clone()));
        }

        let id = UnitId::new();
        let mut unit = WorkerUnit::from_spec(id, spec, now);
        if self.auto_run {
            unit.phase = UnitPhase::Running;
        }
        debug!(unit = %spec.name, unit_id = %id, "Worker unit created");
        state.units.insert(id, unit);
        state.specs.insert(id, spec.clone());
        drop(state);

        self.emit(&spec.job, ChangeKind::UnitChanged);
        Ok(id)
    }

    async fn delete_worker_unit(&self, id: &UnitId) -> Result<(), SubstrateError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write().await;
        if state.faults.delete_failures > 0 {
            state.faults.delete_failures -= 1;
            return Err(SubstrateError::Unavailable(format!(
                "injected delete failure for {id}"
            )));
        }
        let unit = state.units.remove(id).ok_or(SubstrateError::NotFound(*id))?;
        state.specs.remove(id);
        state.unknown.remove(id);
        drop(state);

        debug!(unit = %unit.name, unit_id = %id, "Worker unit deleted");
        self.emit(&unit.job, ChangeKind::UnitChanged);
        Ok(())
    }

    async fn get_worker_unit_status(&self, id: &UnitId) -> Result<UnitStatus, SubstrateError> {
        let mut state = self.state.write().await;
        state.unknown.remove(id);
        let unit = state.units.get(id).ok_or(SubstrateError::NotFound(*id))?;
        Ok(UnitStatus {
            phase: unit.phase,
            restart_count: unit.restart_count,
            exit_code: unit.exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use trainjob_api::{RestartPolicy, UnitTemplate};

    fn cluster() -> InMemoryCluster {
        InMemoryCluster::new(Arc::new(SystemClock))
    }

    fn spec(key: &JobKey, index: u32) -> WorkerUnitSpec {
        WorkerUnitSpec {
            name: trainjob_api::unit_name(key, ReplicaType::Worker, index),
            job: key.clone(),
            job_uid: trainjob_id::JobUid::new(),
            replica_type: ReplicaType::Worker,
            index,
            restart_policy: RestartPolicy::OnFailure,
            template: UnitTemplate::default(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected() {
        let cluster = cluster();
        let key = JobKey::new("default", "bert").unwrap();
        cluster.create_worker_unit(&spec(&key, 0)).await.unwrap();
        let err = cluster.create_worker_unit(&spec(&key, 0)).await.unwrap_err();
        assert_eq!(err, SubstrateError::AlreadyExists("bert-worker-0".into()));
        assert_eq!(cluster.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_delete_missing_unit_is_not_found() {
        let cluster = cluster();
        let id = UnitId::new();
        assert_eq!(
            cluster.delete_worker_unit(&id).await,
            Err(SubstrateError::NotFound(id))
        );
    }

    #[tokio::test]
    async fn test_unknown_listing_until_refreshed() {
        let cluster = cluster();
        let key = JobKey::new("default", "bert").unwrap();
        let id = cluster.create_worker_unit(&spec(&key, 0)).await.unwrap();
        cluster.set_unit_phase(&id, UnitPhase::Running, None).await;
        cluster.mark_unknown(&id).await;

        let listed = cluster.list_worker_units(&key).await.unwrap();
        assert_eq!(listed[0].phase, UnitPhase::Unknown);

        let status = cluster.get_worker_unit_status(&id).await.unwrap();
        assert_eq!(status.phase, UnitPhase::Running);
        let listed = cluster.list_worker_units(&key).await.unwrap();
        assert_eq!(listed[0].phase, UnitPhase::Running);
    }

    #[tokio::test]
    async fn test_update_requires_expected_version() {
        let cluster = cluster();
        let key = JobKey::new("default", "bert").unwrap();
        let job = Job::new(key.clone(), Default::default(), chrono::Utc::now());
        cluster.create(job.clone()).await.unwrap();

        let v2 = cluster.update(&job, ResourceVersion::INITIAL).await.unwrap();
        assert_eq!(v2, ResourceVersion::new(2));
        let err = cluster.update(&job, ResourceVersion::INITIAL).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_watch_reports_changes() {
        let cluster = cluster();
        let mut events = cluster.watch();
        let key = JobKey::new("default", "bert").unwrap();
        cluster
            .create(Job::new(key.clone(), Default::default(), chrono::Utc::now()))
            .await
            .unwrap();
        assert_eq!(
            events.next().await,
            Some(WatchEvent::Changed {
                key,
                kind: ChangeKind::Created
            })
        );
    }
}
