//! Reconciler scenarios, driven one pass at a time against the in-memory
//! cluster with a manual clock.

use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;
use trainjob_api::{
    CleanPodPolicy, ConditionReason, Job, JobPhase, ReplicaType, RestartPolicy, UnitPhase,
    WorkerUnit,
};
use trainjob_controller::{
    Autoscaler, CancelRegistry, CancelToken, ControllerError, InMemoryCluster, JobStore,
    ManualClock, PassOutcome, Reconciler, StaticAutoscaler, StoreError,
};
use trainjob_id::JobKey;
use trainjob_reconcile::{
    ConvergenceStatus, ENV_MASTER_ADDR, ENV_NNODES, ENV_RANK, ENV_RDZV_BACKEND, ENV_RDZV_ENDPOINT,
    ENV_STANDALONE, ENV_WORLD_SIZE,
};
use trainjob_testing::{at, unit, JobBuilder};

struct Harness {
    clock: Arc<ManualClock>,
    cluster: Arc<InMemoryCluster>,
    autoscaler: Arc<StaticAutoscaler>,
    reconciler: Reconciler,
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(at(0)));
        let cluster = Arc::new(InMemoryCluster::new(clock.clone()));
        let autoscaler = Arc::new(StaticAutoscaler::new());
        let reconciler = Reconciler::new(
            cluster.clone(),
            cluster.clone(),
            autoscaler.clone(),
            clock.clone(),
        );
        Self {
            clock,
            cluster,
            autoscaler,
            reconciler,
        }
    }

    async fn submit(&self, job: Job) -> JobKey {
        let key = job.key.clone();
        self.cluster.create(job).await.unwrap();
        key
    }

    async fn try_pass(&self, key: &JobKey) -> Result<PassOutcome, ControllerError> {
        self.reconciler.reconcile(key, &CancelToken::never()).await
    }

    async fn pass(&self, key: &JobKey) -> PassOutcome {
        self.try_pass(key).await.unwrap()
    }

    async fn job(&self, key: &JobKey) -> Job {
        self.cluster.get(key).await.unwrap()
    }

    async fn units(&self, key: &JobKey) -> Vec<WorkerUnit> {
        self.cluster.units(key).await
    }

    async fn worker(&self, key: &JobKey, index: u32) -> WorkerUnit {
        self.cluster
            .unit_at(key, ReplicaType::Worker, index)
            .await
            .unwrap()
    }

    fn advance(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }
}

fn indices(units: &[WorkerUnit], rtype: ReplicaType) -> Vec<u32> {
    units
        .iter()
        .filter(|unit| unit.replica_type == rtype)
        .map(|unit| unit.index)
        .collect()
}

#[tokio::test]
async fn test_static_job_runs_to_success() {
    let h = Harness::new();
    let key = h.submit(JobBuilder::new("mnist").workers(4).build()).await;

    let first = h.pass(&key).await;
    assert_eq!(first.created, 4);
    assert_eq!(first.phase, Some(JobPhase::Created));
    assert_eq!(first.convergence, ConvergenceStatus::Converging);
    assert_eq!(indices(&h.units(&key).await, ReplicaType::Worker), vec![0, 1, 2, 3]);

    let job = h.job(&key).await;
    assert_eq!(job.status.start_time, Some(at(0)));
    assert_eq!(job.status.conditions.len(), 1);
    assert_eq!(job.status.conditions[0].reason, ConditionReason::JobCreated);

    // Records the pending units, then settles.
    h.pass(&key).await;
    let writes = h.cluster.status_writes();
    let idle = h.pass(&key).await;
    assert!(!idle.had_side_effects());
    assert!(!idle.status_written);
    assert_eq!(idle.convergence, ConvergenceStatus::Converged);
    assert_eq!(h.cluster.create_calls(), 4);
    assert_eq!(h.cluster.status_writes(), writes);

    h.cluster.set_all_phases(&key, UnitPhase::Running).await;
    assert_eq!(h.pass(&key).await.phase, Some(JobPhase::Running));
    let job = h.job(&key).await;
    assert_eq!(job.status.replica_statuses[&ReplicaType::Worker].active, 4);

    h.advance(30);
    h.cluster.set_all_phases(&key, UnitPhase::Succeeded).await;
    let done = h.pass(&key).await;
    assert_eq!(done.phase, Some(JobPhase::Succeeded));
    assert_eq!(done.requeue_after, Some(Duration::ZERO));

    let job = h.job(&key).await;
    assert_eq!(job.status.completion_time, Some(at(30)));
    assert_eq!(job.status.replica_statuses[&ReplicaType::Worker].succeeded, 4);

    // Default clean-pod policy keeps finished units.
    let after = h.pass(&key).await;
    assert_eq!(after.deleted, 0);
    assert_eq!(after.convergence, ConvergenceStatus::Finished);
    assert_eq!(h.units(&key).await.len(), 4);
}

#[tokio::test]
async fn test_static_launch_env_with_master() {
    let h = Harness::new();
    let key = h.submit(JobBuilder::new("bert").master().workers(2).build()).await;
    h.pass(&key).await;

    let worker = h.worker(&key, 1).await;
    let spec = h.cluster.unit_spec(&worker.id).await.unwrap();
    assert_eq!(spec.template.env[ENV_MASTER_ADDR], "bert-master-0");
    assert_eq!(spec.template.env[ENV_WORLD_SIZE], "3");
    assert_eq!(spec.template.env[ENV_RANK], "2");
}

#[tokio::test]
async fn test_elastic_job_follows_clamped_proposals() {
    let h = Harness::new();
    let job = JobBuilder::new("resnet")
        .unsized_workers()
        .elastic(Some(2), Some(8))
        .metric("cpu")
        .build();
    let key = h.submit(job).await;

    h.autoscaler.propose(&key, 10).await;
    let grown = h.pass(&key).await;
    assert_eq!(grown.created, 8);
    let binding = h.autoscaler.binding(&key).await.unwrap();
    assert_eq!((binding.min_replicas, binding.max_replicas), (2, 8));
    assert_eq!(h.job(&key).await.status.membership.unwrap().worker_count, 8);

    h.autoscaler.propose(&key, 1).await;
    let shrunk = h.pass(&key).await;
    assert_eq!(shrunk.deleted, 6);
    assert_eq!(shrunk.created, 0);
    assert_eq!(indices(&h.units(&key).await, ReplicaType::Worker), vec![0, 1]);
    assert_eq!(h.job(&key).await.status.membership.unwrap().worker_count, 2);
}

#[tokio::test]
async fn test_missing_proposal_keeps_last_membership() {
    let h = Harness::new();
    let job = JobBuilder::new("gpt")
        .unsized_workers()
        .elastic(Some(2), Some(8))
        .metric("cpu")
        .build();
    let key = h.submit(job).await;

    h.autoscaler.propose(&key, 6).await;
    assert_eq!(h.pass(&key).await.created, 6);

    h.autoscaler.withdraw(&key).await;
    let outcome = h.pass(&key).await;
    assert_eq!(outcome.deleted, 0);
    assert_eq!(h.units(&key).await.len(), 6);
    assert_eq!(h.job(&key).await.status.membership.unwrap().worker_count, 6);
}

#[tokio::test]
async fn test_standalone_rendezvous_env() {
    let h = Harness::new();
    let job = JobBuilder::new("solo")
        .unsized_workers()
        .elastic(Some(1), Some(2))
        .elastic_policy(|policy| {
            policy.standalone = Some(true);
            policy.rdzv_host = Some("etcd.example".to_string());
        })
        .build();
    let key = h.submit(job).await;
    assert_eq!(h.pass(&key).await.created, 1);

    let worker = h.worker(&key, 0).await;
    let env = h.cluster.unit_spec(&worker.id).await.unwrap().template.env;
    assert_eq!(env[ENV_RDZV_BACKEND], "c10d");
    assert_eq!(env[ENV_RDZV_ENDPOINT], "127.0.0.1:29400");
    assert_eq!(env[ENV_STANDALONE], "1");
    assert_eq!(env[ENV_NNODES], "1:2");

    let membership = h.job(&key).await.status.membership.unwrap();
    assert_eq!(membership.rendezvous_endpoint.as_deref(), Some("127.0.0.1:29400"));
}

#[tokio::test]
async fn test_failed_worker_is_charged_and_recreated() {
    let h = Harness::new();
    let job = JobBuilder::new("wo")
        .workers(4)
        .backoff_limit(3)
        .status(|status| status.restart_count = 1)
        .build();
    let key = h.submit(job).await;
    h.pass(&key).await;
    h.cluster.set_all_phases(&key, UnitPhase::Running).await;
    h.pass(&key).await;

    let failed = h.worker(&key, 2).await;
    h.advance(5);
    h.cluster
        .set_unit_phase(&failed.id, UnitPhase::Failed, Some(137))
        .await;

    let outcome = h.pass(&key).await;
    assert_eq!(outcome.restarts_charged, 1);
    assert_eq!(outcome.deleted, 1);
    assert_eq!(outcome.created, 1);
    assert_eq!(outcome.phase, Some(JobPhase::Restarting));

    let job = h.job(&key).await;
    assert_eq!(job.status.restart_count, 2);
    assert_eq!(job.status.replica_restarts(ReplicaType::Worker), 1);
    assert_eq!(job.status.last_restart_time, Some(at(5)));
    assert!(job.status.charged_failures.is_empty());

    let replacement = h.worker(&key, 2).await;
    assert_ne!(replacement.id, failed.id);
    assert_eq!(replacement.phase, UnitPhase::Pending);

    assert_eq!(h.pass(&key).await.phase, Some(JobPhase::Running));
    assert_eq!(h.job(&key).await.status.restart_count, 2);
}

#[tokio::test]
async fn test_lost_charge_write_deletes_nothing() {
    let h = Harness::new();
    let key = h.submit(JobBuilder::new("wo").workers(2).backoff_limit(3).build()).await;
    h.pass(&key).await;
    h.cluster.set_all_phases(&key, UnitPhase::Running).await;
    h.pass(&key).await;

    let failed = h.worker(&key, 0).await;
    h.cluster
        .set_unit_phase(&failed.id, UnitPhase::Failed, Some(1))
        .await;
    let deletes = h.cluster.delete_calls();

    h.cluster.conflict_next_updates(1).await;
    let err = h.try_pass(&key).await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(h.cluster.delete_calls(), deletes);
    assert_eq!(h.job(&key).await.status.restart_count, 0);

    let retry = h.pass(&key).await;
    assert_eq!(retry.restarts_charged, 1);
    assert_eq!(retry.deleted, 1);
    assert_eq!(h.job(&key).await.status.restart_count, 1);
}

#[tokio::test]
async fn test_failed_delete_keeps_charge_for_next_pass() {
    let h = Harness::new();
    let key = h.submit(JobBuilder::new("wo").workers(2).backoff_limit(3).build()).await;
    h.pass(&key).await;
    h.cluster.set_all_phases(&key, UnitPhase::Running).await;
    h.pass(&key).await;

    let failed = h.worker(&key, 1).await;
    h.cluster
        .set_unit_phase(&failed.id, UnitPhase::Failed, Some(1))
        .await;

    h.cluster.fail_next_deletes(1).await;
    let first = h.pass(&key).await;
    assert_eq!(first.restarts_charged, 1);
    assert_eq!(first.failed_operations, 1);
    assert_eq!(first.created, 0, "replacement waits for the delete");
    assert!(h.job(&key).await.status.is_charged(&failed.id));

    let second = h.pass(&key).await;
    assert_eq!(second.restarts_charged, 0);
    assert_eq!(second.deleted, 1);
    assert_eq!(second.created, 1);

    let job = h.job(&key).await;
    assert_eq!(job.status.restart_count, 1);
    assert!(job.status.charged_failures.is_empty());
}

#[tokio::test]
async fn test_deadline_fails_job_and_cleans_up() {
    let h = Harness::new();
    let job = JobBuilder::new("slow")
        .workers(2)
        .active_deadline(600)
        .clean_pod_policy(CleanPodPolicy::All)
        .build();
    let key = h.submit(job).await;
    h.pass(&key).await;
    h.cluster.set_all_phases(&key, UnitPhase::Running).await;
    let running = h.pass(&key).await;
    assert_eq!(running.requeue_after, Some(Duration::from_secs(600)));

    h.advance(601);
    let failed = h.pass(&key).await;
    assert_eq!(failed.phase, Some(JobPhase::Failed));
    assert_eq!(failed.deleted, 0);

    let job = h.job(&key).await;
    let condition = job.status.latest_condition().unwrap();
    assert_eq!(condition.reason, ConditionReason::DeadlineExceeded);
    assert_eq!(job.status.completion_time, Some(at(601)));

    let cleanup = h.pass(&key).await;
    assert_eq!(cleanup.deleted, 2);
    assert!(h.units(&key).await.is_empty());
    assert_eq!(h.job(&key).await.status.phase, JobPhase::Failed);
}

#[rstest]
#[case(10_000_000_000_000_000)]
#[case(u64::MAX)]
#[tokio::test]
async fn test_unreachable_deadline_and_ttl_never_fire(#[case] seconds: u64) {
    let h = Harness::new();
    let job = JobBuilder::new("huge")
        .workers(1)
        .active_deadline(seconds)
        .ttl_after_finished(seconds)
        .build();
    let key = h.submit(job).await;

    assert_eq!(h.pass(&key).await.created, 1);
    h.cluster.set_all_phases(&key, UnitPhase::Running).await;
    h.advance(365 * 24 * 3600);
    let running = h.pass(&key).await;
    assert_eq!(running.phase, Some(JobPhase::Running));
    assert_eq!(running.requeue_after, None);

    h.cluster.set_all_phases(&key, UnitPhase::Succeeded).await;
    assert_eq!(h.pass(&key).await.phase, Some(JobPhase::Succeeded));
    h.advance(365 * 24 * 3600);
    let kept = h.pass(&key).await;
    assert!(!kept.job_deleted);
    assert_eq!(kept.requeue_after, None);
    assert_eq!(h.job(&key).await.status.phase, JobPhase::Succeeded);
}

#[tokio::test]
async fn test_backoff_limit_failure_is_sticky() {
    let h = Harness::new();
    let key = h.submit(JobBuilder::new("wo").workers(2).backoff_limit(0).build()).await;
    h.pass(&key).await;
    h.cluster.set_all_phases(&key, UnitPhase::Running).await;
    h.pass(&key).await;

    let failed = h.worker(&key, 0).await;
    h.cluster
        .set_unit_phase(&failed.id, UnitPhase::Failed, Some(1))
        .await;
    assert_eq!(h.pass(&key).await.phase, Some(JobPhase::Failed));
    assert_eq!(
        h.job(&key).await.status.latest_condition().unwrap().reason,
        ConditionReason::BackoffLimitExceeded
    );

    // The unit comes back; the job does not.
    h.cluster
        .set_unit_phase(&failed.id, UnitPhase::Running, None)
        .await;
    let creates = h.cluster.create_calls();
    let later = h.pass(&key).await;
    assert_eq!(later.phase, Some(JobPhase::Failed));
    assert_eq!(h.cluster.create_calls(), creates);
}

#[tokio::test]
async fn test_in_place_restarts_count_against_budget() {
    let h = Harness::new();
    let key = h.submit(JobBuilder::new("wo").workers(2).backoff_limit(3).build()).await;
    h.pass(&key).await;
    h.cluster.set_all_phases(&key, UnitPhase::Running).await;
    h.pass(&key).await;

    let worker = h.worker(&key, 1).await;
    h.cluster.set_unit_restart_count(&worker.id, 4).await;
    let outcome = h.pass(&key).await;
    assert_eq!(outcome.phase, Some(JobPhase::Failed));
    assert_eq!(
        h.job(&key).await.status.latest_condition().unwrap().reason,
        ConditionReason::BackoffLimitExceeded
    );
}

#[tokio::test]
async fn test_never_policy_fails_on_first_failure() {
    let h = Harness::new();
    let job = JobBuilder::new("wo")
        .workers(2)
        .restart_policy(ReplicaType::Worker, RestartPolicy::Never)
        .build();
    let key = h.submit(job).await;
    h.pass(&key).await;

    let worker = h.worker(&key, 1).await;
    h.cluster
        .set_unit_phase(&worker.id, UnitPhase::Failed, Some(2))
        .await;
    let outcome = h.pass(&key).await;
    assert_eq!(outcome.phase, Some(JobPhase::Failed));
    assert_eq!(outcome.deleted, 0);
    assert_eq!(
        h.job(&key).await.status.latest_condition().unwrap().reason,
        ConditionReason::UnitFailed
    );
}

#[tokio::test]
async fn test_deleted_job_units_are_removed() {
    let h = Harness::new();
    let job = JobBuilder::new("gone")
        .unsized_workers()
        .elastic(Some(1), Some(4))
        .metric("cpu")
        .build();
    let key = h.submit(job).await;
    h.autoscaler.propose(&key, 3).await;
    h.pass(&key).await;
    assert!(h.autoscaler.binding(&key).await.is_some());

    h.cluster.remove_job(&key).await;
    let outcome = h.pass(&key).await;
    assert_eq!(outcome.phase, None);
    assert_eq!(outcome.deleted, 3);
    assert!(h.units(&key).await.is_empty());
    assert!(h.autoscaler.binding(&key).await.is_none());
}

#[tokio::test]
async fn test_units_of_previous_incarnation_are_replaced() {
    let h = Harness::new();
    let previous = JobBuilder::new("wo").workers(1).build();
    let current = JobBuilder::new("wo").workers(1).build();
    let current_uid = current.uid;
    let key = h.submit(current).await;
    h.cluster
        .insert_unit(unit(&previous, ReplicaType::Worker, 0).running().build())
        .await;

    let outcome = h.pass(&key).await;
    assert_eq!(outcome.deleted, 1);
    assert_eq!(outcome.created, 1);
    let units = h.units(&key).await;
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].job_uid, current_uid);
}

#[tokio::test]
async fn test_create_failures_are_retried() {
    let h = Harness::new();
    let key = h.submit(JobBuilder::new("wo").workers(3).build()).await;

    h.cluster.fail_next_creates(2).await;
    let first = h.pass(&key).await;
    assert_eq!(first.created, 1);
    assert_eq!(first.failed_operations, 2);
    assert_eq!(first.convergence, ConvergenceStatus::Converging);
    assert_eq!(first.phase, Some(JobPhase::Created));

    let second = h.pass(&key).await;
    assert_eq!(second.created, 2);
    assert_eq!(second.failed_operations, 0);
    assert_eq!(h.units(&key).await.len(), 3);
}

#[tokio::test]
async fn test_finished_job_is_deleted_after_ttl() {
    let h = Harness::new();
    let key = h
        .submit(JobBuilder::new("short").workers(1).ttl_after_finished(60).build())
        .await;
    h.pass(&key).await;
    h.advance(10);
    h.cluster.set_all_phases(&key, UnitPhase::Succeeded).await;
    assert_eq!(h.pass(&key).await.phase, Some(JobPhase::Succeeded));

    let waiting = h.pass(&key).await;
    assert_eq!(waiting.requeue_after, Some(Duration::from_secs(60)));
    assert!(!waiting.job_deleted);

    h.advance(60);
    let expired = h.pass(&key).await;
    assert!(expired.job_deleted);
    assert_eq!(expired.deleted, 1);
    assert!(matches!(
        h.cluster.get(&key).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(h.units(&key).await.is_empty());
}

#[tokio::test]
async fn test_unknown_units_are_refreshed() {
    let h = Harness::new();
    let key = h.submit(JobBuilder::new("wo").workers(1).build()).await;
    h.pass(&key).await;

    let worker = h.worker(&key, 0).await;
    h.cluster
        .set_unit_phase(&worker.id, UnitPhase::Running, None)
        .await;
    h.cluster.mark_unknown(&worker.id).await;

    assert_eq!(h.pass(&key).await.phase, Some(JobPhase::Running));
    assert_eq!(h.cluster.create_calls(), 1);
}

#[tokio::test]
async fn test_cancelled_pass_issues_no_side_effects() {
    let h = Harness::new();
    let key = h.submit(JobBuilder::new("wo").workers(2).build()).await;

    let registry = CancelRegistry::new();
    let token = registry.begin(&key);
    assert!(registry.cancel(&key));

    let err = h.reconciler.reconcile(&key, &token).await.unwrap_err();
    assert!(matches!(err, ControllerError::Cancelled(ref cancelled) if cancelled == &key));
    assert_eq!(h.cluster.create_calls(), 0);
}

#[tokio::test]
async fn test_terminal_elastic_job_releases_binding() {
    let h = Harness::new();
    let job = JobBuilder::new("done")
        .unsized_workers()
        .elastic(Some(1), Some(2))
        .metric("cpu")
        .build();
    let key = h.submit(job).await;
    h.autoscaler.propose(&key, 1).await;
    h.pass(&key).await;
    assert!(h.autoscaler.binding(&key).await.is_some());

    h.cluster.set_all_phases(&key, UnitPhase::Succeeded).await;
    assert_eq!(h.pass(&key).await.phase, Some(JobPhase::Succeeded));
    assert!(h.autoscaler.binding(&key).await.is_none());
    assert!(h.autoscaler.proposed_replica_count(&key).await.is_err());
}
