//! Integration tests for the HTTP task executor.
//!
//! Each test spins up an Axum stub of the completion service on a random port
//! and drives the real executor against it.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use secrecy::SecretString;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use uuid::Uuid;

use automation_runner::config::{ExecutorConfig, RunnerConfig};
use automation_runner::error::ExecutorError;
use automation_runner::executor::{
    HttpTaskExecutor, OutcomeStatus, TaskExecutor, TaskOutcome, TaskRequest,
};
use automation_runner::identity::{DefaultIdentityResolver, ExecutionIdentity};
use automation_runner::job::{Job, JobStatus, JobTrigger, Task, TaskStatus};
use automation_runner::runner::{BackoffPolicy, JobRunner, PassOutcome, RunnerDeps, StoreContextCloner};
use automation_runner::store::{JobStore, LibSqlBackend};

/// Requests and auth headers seen by the stub.
#[derive(Default)]
struct Seen {
    requests: Vec<TaskRequest>,
    auth: Vec<Option<String>>,
}

type Shared = Arc<Mutex<Seen>>;

async fn complete(
    State(seen): State<Shared>,
    headers: HeaderMap,
    Json(request): Json<TaskRequest>,
) -> Result<Json<TaskOutcome>, (StatusCode, String)> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    {
        let mut seen = seen.lock().await;
        seen.requests.push(request.clone());
        seen.auth.push(auth);
    }

    match request.prompt.as_str() {
        "boom" => Err((StatusCode::INTERNAL_SERVER_ERROR, "model crashed".to_string())),
        "refuse" => Ok(Json(TaskOutcome::error("content policy"))),
        "slow" => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(Json(TaskOutcome::completed("late", 1)))
        }
        prompt => Ok(Json(TaskOutcome::completed(format!("echo: {prompt}"), 120))),
    }
}

async fn garbage() -> &'static str {
    "not json"
}

/// Start the stub on a random port, return (base url, seen requests).
async fn start_server() -> (String, Shared) {
    let seen: Shared = Arc::default();
    let app = Router::new()
        .route("/v1/tasks", post(complete))
        .route("/v1/garbage", post(garbage))
        .with_state(seen.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), seen)
}

fn executor(endpoint: String, timeout: Duration) -> HttpTaskExecutor {
    HttpTaskExecutor::new(ExecutorConfig {
        endpoint,
        api_key: Some(SecretString::from("test-key".to_string())),
        timeout,
    })
    .unwrap()
}

fn request(prompt: &str) -> TaskRequest {
    let job = Job::new("acme", "digest", prompt, JobTrigger::Manual);
    let task = Task::default_for(&job, Uuid::new_v4());
    let identity = ExecutionIdentity {
        tenant_id: "acme".to_string(),
        principal: "alice".to_string(),
        roles: vec!["automation".to_string()],
    };
    TaskRequest::new(&job, &task, identity, 0)
}

#[tokio::test]
async fn posts_request_with_bearer_token() {
    let (base, seen) = start_server().await;
    let executor = executor(format!("{base}/v1/tasks"), Duration::from_secs(5));

    let outcome = executor.execute(&request("summarize inbox")).await.unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Completed);
    assert_eq!(outcome.output_preview.as_deref(), Some("echo: summarize inbox"));
    assert_eq!(outcome.tokens_used, 120);

    let seen = seen.lock().await;
    assert_eq!(seen.requests.len(), 1);
    assert_eq!(seen.requests[0].identity.principal, "alice");
    assert_eq!(seen.auth[0].as_deref(), Some("Bearer test-key"));
}

#[tokio::test]
async fn non_success_status_is_an_error() {
    let (base, _) = start_server().await;
    let executor = executor(format!("{base}/v1/tasks"), Duration::from_secs(5));

    let err = executor.execute(&request("boom")).await.unwrap_err();
    match err {
        ExecutorError::Failed { reason, .. } => {
            assert!(reason.contains("500"));
            assert!(reason.contains("model crashed"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn error_outcome_is_passed_through() {
    let (base, _) = start_server().await;
    let executor = executor(format!("{base}/v1/tasks"), Duration::from_secs(5));

    let outcome = executor.execute(&request("refuse")).await.unwrap();
    assert!(!outcome.is_success());
    assert_eq!(outcome.error_message.as_deref(), Some("content policy"));
}

#[tokio::test]
async fn malformed_body_is_invalid_response() {
    let (base, _) = start_server().await;
    let executor = executor(format!("{base}/v1/garbage"), Duration::from_secs(5));

    let err = executor.execute(&request("anything")).await.unwrap_err();
    assert!(matches!(err, ExecutorError::InvalidResponse(_)));
}

#[tokio::test]
async fn slow_service_times_out() {
    let (base, _) = start_server().await;
    let executor = executor(format!("{base}/v1/tasks"), Duration::from_millis(200));

    let err = executor.execute(&request("slow")).await.unwrap_err();
    assert!(matches!(err, ExecutorError::Timeout { .. }));
}

#[tokio::test]
async fn runner_drives_job_through_http_executor() {
    let (base, seen) = start_server().await;
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());

    let job = Job::new("acme", "digest", "", JobTrigger::Schedule).with_retry_limit(1);
    store.insert_job(&job).await.unwrap();
    store
        .insert_task(&Task::template(job.id, 0, "fetch", "fetch the news"))
        .await
        .unwrap();
    store
        .insert_task(&Task::template(job.id, 1, "write", "boom"))
        .await
        .unwrap();

    let config = RunnerConfig {
        backoff: BackoffPolicy {
            base: Duration::from_millis(1),
            factor: 2,
            cap: Duration::from_millis(5),
        },
        ..RunnerConfig::default()
    };
    let runner = Arc::new(JobRunner::new(
        config,
        RunnerDeps {
            store: store.clone(),
            executor: Arc::new(executor(format!("{base}/v1/tasks"), Duration::from_secs(5))),
            identity: Arc::new(DefaultIdentityResolver::new(vec!["automation".to_string()])),
            cloner: Arc::new(StoreContextCloner::new(store.clone())),
        },
    ));

    assert_eq!(
        runner.process_job(job.clone()).await,
        PassOutcome::Finalized(JobStatus::Error)
    );

    // One call for "fetch", two for the failing "write".
    assert_eq!(seen.lock().await.requests.len(), 3);

    let done = store.get_job("acme", job.id).await.unwrap().unwrap();
    let tasks = store
        .list_execution_tasks(job.id, done.last_run_id.unwrap())
        .await
        .unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    assert_eq!(tasks[0].tokens_used, 120);
    assert_eq!(tasks[1].status, TaskStatus::Error);
    assert!(tasks[1].error_message.as_deref().unwrap().contains("model crashed"));
    assert!(done.lease_id.is_none());
}
