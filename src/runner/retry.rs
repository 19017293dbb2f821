//! Bounded retry of a single Execution task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::JobError;
use crate::executor::{TaskExecutor, TaskOutcome, TaskRequest};
use crate::identity::IdentityResolver;
use crate::job::{Job, Task, TaskCompletion, TaskStatus, model::preview};
use crate::runner::lease::LeaseManager;
use crate::store::JobStore;

/// Exponential backoff: `min(cap, base * factor^attempt)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            factor: 2,
            cap: Duration::from_millis(30_000),
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after failed attempt `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.factor
            .checked_pow(attempt)
            .and_then(|multiplier| self.base.checked_mul(multiplier))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

/// How driving one task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRunOutcome {
    Completed,
    /// Every attempt failed; the task is recorded as Error.
    Failed,
    /// Lease renewal failed; the task was left as it was.
    LeaseLost,
    /// The task was settled by someone else (e.g. an external stop).
    Skipped,
}

pub struct RetryController {
    store: Arc<dyn JobStore>,
    leases: Arc<LeaseManager>,
    executor: Arc<dyn TaskExecutor>,
    identity: Arc<dyn IdentityResolver>,
    backoff: BackoffPolicy,
}

impl RetryController {
    pub fn new(
        store: Arc<dyn JobStore>,
        leases: Arc<LeaseManager>,
        executor: Arc<dyn TaskExecutor>,
        identity: Arc<dyn IdentityResolver>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            leases,
            executor,
            identity,
            backoff,
        }
    }

    /// Run `task` with up to `job.retry_limit + 1` executor invocations in
    /// total. Attempts already recorded on the row by earlier passes count
    /// against the same budget.
    pub async fn run_task(
        &self,
        job: &Job,
        lease_id: uuid::Uuid,
        task: &Task,
    ) -> Result<TaskRunOutcome, JobError> {
        let started = Instant::now();
        let Some(stored) = self.store.get_task(task.id).await? else {
            warn!(job_id = %job.id, task_id = %task.id, "Task row vanished, skipping");
            return Ok(TaskRunOutcome::Skipped);
        };
        if stored.status.is_settled() {
            return Ok(TaskRunOutcome::Skipped);
        }

        let first_attempt = stored.attempts;
        let mut last_error = stored.error_message.clone().unwrap_or_else(|| {
            format!("retry limit exhausted after {first_attempt} attempts")
        });
        if first_attempt > job.retry_limit {
            info!(
                job_id = %job.id,
                task_id = %task.id,
                attempts = first_attempt,
                retry_limit = job.retry_limit,
                "Retry budget already spent"
            );
        } else if first_attempt > 0 {
            debug!(task_id = %task.id, attempts = first_attempt, "Resuming interrupted task");
        }

        for attempt in first_attempt..=job.retry_limit {
            match self.leases.ensure_lease(job, lease_id).await {
                Ok(()) => {}
                Err(JobError::LeaseLost { .. }) => {
                    warn!(job_id = %job.id, task_id = %task.id, attempt, "Lease lost, abandoning task");
                    return Ok(TaskRunOutcome::LeaseLost);
                }
                Err(e) => return Err(e),
            }

            if self.store.mark_task_running(task.id, Utc::now()).await? == 0 {
                info!(job_id = %job.id, task_id = %task.id, "Task settled elsewhere, skipping");
                return Ok(TaskRunOutcome::Skipped);
            }

            match self.attempt(job, task, attempt).await {
                Ok(outcome) => {
                    let completion = TaskCompletion {
                        status: TaskStatus::Completed,
                        output_preview: outcome.output_preview.as_deref().map(preview),
                        tokens_used: outcome.tokens_used.max(0),
                        duration_seconds: outcome
                            .duration_seconds
                            .unwrap_or_else(|| started.elapsed().as_secs_f64()),
                        error_message: None,
                    };
                    self.persist(task, &completion).await?;
                    info!(
                        job_id = %job.id,
                        task_id = %task.id,
                        attempt,
                        tokens = completion.tokens_used,
                        "Task completed"
                    );
                    return Ok(TaskRunOutcome::Completed);
                }
                Err(reason) => {
                    warn!(
                        job_id = %job.id,
                        task_id = %task.id,
                        attempt,
                        retry_limit = job.retry_limit,
                        error = %reason,
                        "Task attempt failed"
                    );
                    last_error = reason;
                }
            }

            if attempt < job.retry_limit {
                let delay = self.backoff.delay(attempt);
                debug!(task_id = %task.id, ?delay, "Backing off before retry");
                tokio::time::sleep(delay).await;
            }
        }

        let completion = TaskCompletion {
            status: TaskStatus::Error,
            output_preview: None,
            tokens_used: 0,
            duration_seconds: started.elapsed().as_secs_f64(),
            error_message: Some(last_error),
        };
        self.persist(task, &completion).await?;
        Ok(TaskRunOutcome::Failed)
    }

    /// One executor invocation. Any failure is flattened to a message.
    async fn attempt(&self, job: &Job, task: &Task, attempt: u32) -> Result<TaskOutcome, String> {
        let identity = self.identity.resolve(job).await.map_err(|e| e.to_string())?;
        let request = TaskRequest::new(job, task, identity, attempt);
        let outcome = self
            .executor
            .execute(&request)
            .await
            .map_err(|e| e.to_string())?;

        if outcome.is_success() {
            Ok(outcome)
        } else {
            Err(outcome
                .error_message
                .unwrap_or_else(|| "executor reported failure".to_string()))
        }
    }

    async fn persist(&self, task: &Task, completion: &TaskCompletion) -> Result<(), JobError> {
        if self.store.complete_task(task.id, completion).await? == 0 {
            // Stopped externally while the executor was running.
            debug!(task_id = %task.id, status = %completion.status, "Task result discarded");
        }
        Ok(())
    }
}
