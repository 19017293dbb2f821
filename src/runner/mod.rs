//! Lease-based job runner.
//!
//! A processing pass over one job goes through:
//! 1. **Lease** ([`lease`]): claim the job row with a compare-and-swap update
//! 2. **Run start**: assign the run id the first time the job is processed
//! 3. **Materialize** ([`materializer`]): make sure Execution tasks exist
//! 4. **Retry** ([`retry`]): drive each unsettled task through the executor
//! 5. **Finalize** ([`finalizer`]): roll task outcomes up into the job
//!
//! [`JobRunner`] ([`poller`]) drives passes from a periodic tick.

pub mod finalizer;
pub mod lease;
pub mod materializer;
pub mod poller;
pub mod retry;

pub use finalizer::Finalizer;
pub use lease::LeaseManager;
pub use materializer::{ContextCloner, Materializer, StoreContextCloner};
pub use poller::{JobRunner, RunnerDeps};
pub use retry::{BackoffPolicy, RetryController, TaskRunOutcome};

use crate::job::JobStatus;

/// How a single processing pass over a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another runner holds the lease, or the job stopped being claimable.
    NotClaimed,
    /// A conditioned update touched zero rows mid-pass.
    LeaseLost,
    /// The job was stopped externally; the lease was released.
    Stopped,
    /// Some tasks are still unsettled; a later pass resumes the run.
    Deferred,
    /// The job reached a terminal status.
    Finalized(JobStatus),
    /// An infrastructure error ended the pass early.
    Aborted(String),
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use crate::error::ExecutorError;
    use crate::executor::{TaskExecutor, TaskOutcome, TaskRequest};
    use crate::store::LibSqlBackend;

    /// Executor that replays a script of results, then keeps succeeding.
    pub struct ScriptedExecutor {
        script: Mutex<VecDeque<Result<TaskOutcome, String>>>,
        calls: AtomicUsize,
        requests: Mutex<Vec<TaskRequest>>,
    }

    impl ScriptedExecutor {
        pub fn new(script: Vec<Result<TaskOutcome, String>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn always_ok() -> Self {
            Self::new(Vec::new())
        }

        pub fn always_failing(times: usize) -> Self {
            Self::new((0..times).map(|_| Err("executor exploded".to_string())).collect())
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub async fn requests(&self) -> Vec<TaskRequest> {
            self.requests.lock().await.clone()
        }
    }

    #[async_trait]
    impl TaskExecutor for ScriptedExecutor {
        async fn execute(&self, request: &TaskRequest) -> Result<TaskOutcome, ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().await.push(request.clone());
            match self.script.lock().await.pop_front() {
                Some(Ok(outcome)) => Ok(outcome),
                Some(Err(reason)) => Err(ExecutorError::Failed {
                    task_id: request.task_id,
                    reason,
                }),
                None => Ok(TaskOutcome::completed(format!("done: {}", request.name), 100)),
            }
        }
    }

    pub async fn memory_store() -> Arc<LibSqlBackend> {
        Arc::new(LibSqlBackend::new_memory().await.unwrap())
    }
}
