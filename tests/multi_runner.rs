//! Several runners sharing one database file.
//!
//! Each `LibSqlBackend` opens its own connection to the same file, standing in
//! for separate runner processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use automation_runner::config::RunnerConfig;
use automation_runner::error::ExecutorError;
use automation_runner::executor::{TaskExecutor, TaskOutcome, TaskRequest};
use automation_runner::identity::DefaultIdentityResolver;
use automation_runner::job::{Job, JobStatus, JobTrigger};
use automation_runner::runner::{JobRunner, LeaseManager, RunnerDeps, StoreContextCloner};
use automation_runner::store::{JobStore, LibSqlBackend};

/// Counts invocations per job.
#[derive(Default)]
struct CountingExecutor {
    calls: Mutex<HashMap<Uuid, usize>>,
}

#[async_trait]
impl TaskExecutor for CountingExecutor {
    async fn execute(&self, request: &TaskRequest) -> Result<TaskOutcome, ExecutorError> {
        *self.calls.lock().await.entry(request.job_id).or_default() += 1;
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(TaskOutcome::completed("ok", 10))
    }
}

async fn open_pair() -> (tempfile::TempDir, Arc<LibSqlBackend>, Arc<LibSqlBackend>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("automation.db");
    let a = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    let b = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    (dir, a, b)
}

fn runner(store: Arc<LibSqlBackend>, executor: Arc<CountingExecutor>, id: &str) -> Arc<JobRunner> {
    let config = RunnerConfig {
        runner_id: id.to_string(),
        batch_size: 50,
        ..RunnerConfig::default()
    };
    Arc::new(JobRunner::new(
        config,
        RunnerDeps {
            store: store.clone(),
            executor,
            identity: Arc::new(DefaultIdentityResolver::new(Vec::new())),
            cloner: Arc::new(StoreContextCloner::new(store)),
        },
    ))
}

#[tokio::test]
async fn simultaneous_claims_from_two_processes() {
    let (_dir, a, b) = open_pair().await;
    let job = Job::new("acme", "nightly", "p", JobTrigger::Schedule);
    a.insert_job(&job).await.unwrap();

    let lease_a = LeaseManager::new(a.clone(), Duration::from_secs(120));
    let lease_b = LeaseManager::new(b.clone(), Duration::from_secs(120));
    let (ra, rb) = tokio::join!(lease_a.claim(&job), lease_b.claim(&job));

    let winners = [ra.unwrap(), rb.unwrap()]
        .into_iter()
        .filter(Option::is_some)
        .count();
    assert_eq!(winners, 1);

    // Both processes agree on the owner.
    let seen_a = a.get_job("acme", job.id).await.unwrap().unwrap();
    let seen_b = b.get_job("acme", job.id).await.unwrap().unwrap();
    assert!(seen_a.lease_id.is_some());
    assert_eq!(seen_a.lease_id, seen_b.lease_id);
}

#[tokio::test]
async fn two_runners_process_each_job_once() {
    let (_dir, a, b) = open_pair().await;
    let jobs: Vec<Job> = (0..12)
        .map(|i| Job::new("acme", format!("job {i}"), "p", JobTrigger::Schedule))
        .collect();
    for job in &jobs {
        a.insert_job(job).await.unwrap();
    }

    let executor = Arc::new(CountingExecutor::default());
    let runner_a = runner(a.clone(), executor.clone(), "runner-a");
    let runner_b = runner(b.clone(), executor.clone(), "runner-b");

    tokio::join!(runner_a.tick(), runner_b.tick());
    runner_a.stop().await;
    runner_b.stop().await;

    let calls = executor.calls.lock().await;
    for job in &jobs {
        assert_eq!(calls.get(&job.id), Some(&1), "job {} ran more than once", job.name);
        let done = b.get_job("acme", job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.lease_id.is_none());
    }
}
