//! End-to-end runs of the full controller loop: watcher, queue and workers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use trainjob_api::{CleanPodPolicy, JobPhase, UnitPhase};
use trainjob_controller::{
    Config, Controller, InMemoryCluster, JobStore, ManualClock, StaticAutoscaler,
};
use trainjob_id::JobKey;
use trainjob_testing::{at, JobBuilder};

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(10);

struct Running {
    cluster: Arc<InMemoryCluster>,
    autoscaler: Arc<StaticAutoscaler>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

fn start() -> Running {
    let clock = Arc::new(ManualClock::new(at(0)));
    let cluster = Arc::new(InMemoryCluster::new(clock.clone()).with_auto_run(true));
    let autoscaler = Arc::new(StaticAutoscaler::new());
    let config = Config {
        workers: 2,
        resync_interval: Duration::from_secs(1),
        requeue_base: Duration::from_millis(5),
        requeue_max: Duration::from_millis(50),
        ..Config::default()
    };
    let controller = Controller::new(
        &config,
        cluster.clone(),
        cluster.clone(),
        autoscaler.clone(),
        clock,
    );

    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(controller.run(shutdown_rx));
    Running {
        cluster,
        autoscaler,
        shutdown,
        handle,
    }
}

impl Running {
    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("controller did not stop")
            .unwrap();
    }

    async fn phase(&self, key: &JobKey) -> Option<JobPhase> {
        self.cluster.get(key).await.ok().map(|job| job.status.phase)
    }

    async fn wait_for_phase(&self, key: &JobKey, phase: JobPhase) {
        let reached = tokio::time::timeout(WAIT, async {
            while self.phase(key).await != Some(phase) {
                tokio::time::sleep(POLL).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "timed out waiting for {key} to reach {phase}");
    }

    async fn wait_for_units(&self, key: &JobKey, count: usize) {
        let reached = tokio::time::timeout(WAIT, async {
            while self.cluster.units(key).await.len() != count {
                tokio::time::sleep(POLL).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "timed out waiting for {key} to have {count} units");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_job_runs_to_completion() {
    let running = start();
    let job = JobBuilder::new("mnist")
        .workers(3)
        .clean_pod_policy(CleanPodPolicy::All)
        .build();
    let key = job.key.clone();
    running.cluster.create(job).await.unwrap();

    running.wait_for_phase(&key, JobPhase::Running).await;
    assert_eq!(running.cluster.units(&key).await.len(), 3);

    running.cluster.set_all_phases(&key, UnitPhase::Succeeded).await;
    running.wait_for_phase(&key, JobPhase::Succeeded).await;
    running.wait_for_units(&key, 0).await;
    assert_eq!(running.cluster.create_calls(), 3);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deleted_job_is_cleaned_up() {
    let running = start();
    let job = JobBuilder::new("gone")
        .unsized_workers()
        .elastic(Some(1), Some(4))
        .metric("cpu")
        .build();
    let key = job.key.clone();
    running.autoscaler.propose(&key, 4).await;
    running.cluster.create(job).await.unwrap();

    running.wait_for_units(&key, 4).await;

    running.cluster.remove_job(&key).await;
    running.wait_for_units(&key, 0).await;
    let released = tokio::time::timeout(WAIT, async {
        while running.autoscaler.binding(&key).await.is_some() {
            tokio::time::sleep(POLL).await;
        }
    })
    .await;
    assert!(released.is_ok(), "autoscaler binding was not removed");

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transient_failures_are_retried() {
    let running = start();
    running.cluster.fail_next_creates(3).await;
    let job = JobBuilder::new("flaky").workers(2).build();
    let key = job.key.clone();
    running.cluster.create(job).await.unwrap();

    running.wait_for_units(&key, 2).await;
    running.wait_for_phase(&key, JobPhase::Running).await;
    assert_eq!(running.cluster.create_calls(), 5);

    running.stop().await;
}
