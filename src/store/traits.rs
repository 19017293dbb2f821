//! `JobStore` trait — single async interface for all runner persistence.
//!
//! Every mutation the runner relies on for mutual exclusion is a single
//! conditioned `UPDATE` and returns the number of affected rows. Callers treat
//! `0` as "someone else owns this row now" and back off.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::job::{Job, JobFinalization, JobProgress, JobStatus, Task, TaskCompletion};

/// A conversation message from the database.
#[derive(Debug, Clone)]
pub struct ConversationMessage {
    pub id: String,
    pub role: String,
    pub content: String,
}

/// Parameters of a lease claim attempt.
#[derive(Debug, Clone)]
pub struct LeaseClaim<'a> {
    pub tenant_id: &'a str,
    pub job_id: Uuid,
    /// Status the claimer observed; the update only applies if it still holds.
    pub expected_status: JobStatus,
    pub lease_id: Uuid,
    pub now: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Backend-agnostic store for jobs, tasks, and their conversation context.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a new job.
    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Get a job by tenant and ID.
    async fn get_job(&self, tenant_id: &str, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Jobs that are due for processing and not currently leased, oldest
    /// update first.
    async fn list_claimable_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError>;

    /// Take the lease on a job. Promotes Pending jobs to Running.
    async fn claim_job(&self, claim: &LeaseClaim<'_>) -> Result<u64, DatabaseError>;

    /// Extend a held, unexpired lease.
    async fn renew_lease(
        &self,
        tenant_id: &str,
        job_id: Uuid,
        lease_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    /// Clear a held lease.
    async fn release_lease(
        &self,
        tenant_id: &str,
        job_id: Uuid,
        lease_id: Uuid,
    ) -> Result<u64, DatabaseError>;

    /// Record the start of a run: sets `started_at` if unset and assigns the
    /// run id, only if no run id exists yet.
    async fn begin_run(
        &self,
        tenant_id: &str,
        job_id: Uuid,
        lease_id: Uuid,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    /// Write the terminal job state and clear the lease in one update.
    async fn finalize_job(
        &self,
        tenant_id: &str,
        job_id: Uuid,
        lease_id: Uuid,
        finalization: &JobFinalization,
    ) -> Result<u64, DatabaseError>;

    /// Out-of-band stop: marks the job and its unsettled tasks Stopped.
    async fn stop_job(
        &self,
        tenant_id: &str,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a single task (template authoring).
    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Insert execution tasks atomically. Rows that would duplicate an
    /// existing execution slot are ignored. Returns rows inserted.
    async fn insert_execution_tasks(&self, tasks: &[Task]) -> Result<u64, DatabaseError>;

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Template tasks of a job in sequence order.
    async fn list_template_tasks(&self, job_id: Uuid) -> Result<Vec<Task>, DatabaseError>;

    /// Execution tasks of one run in sequence order.
    async fn list_execution_tasks(
        &self,
        job_id: Uuid,
        run_id: Uuid,
    ) -> Result<Vec<Task>, DatabaseError>;

    /// Move an unsettled task to Running and bump its attempt count.
    async fn mark_task_running(&self, id: Uuid, now: DateTime<Utc>) -> Result<u64, DatabaseError>;

    /// Persist a task's terminal result. Only applies to Running tasks.
    async fn complete_task(
        &self,
        id: Uuid,
        completion: &TaskCompletion,
    ) -> Result<u64, DatabaseError>;

    /// Status counts over one run's execution tasks.
    async fn job_progress(&self, job_id: Uuid, run_id: Uuid) -> Result<JobProgress, DatabaseError> {
        let tasks = self.list_execution_tasks(job_id, run_id).await?;
        Ok(JobProgress::from_tasks(&tasks))
    }

    // ── Conversations ───────────────────────────────────────────────

    /// Ensure a conversation exists, creating it if needed.
    async fn ensure_conversation(
        &self,
        id: Uuid,
        tenant_id: &str,
        title: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Add a message to a conversation.
    async fn add_conversation_message(
        &self,
        conversation_id: Uuid,
        role: &str,
        content: &str,
    ) -> Result<(), DatabaseError>;

    /// List messages in a conversation, oldest first.
    async fn list_conversation_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<ConversationMessage>, DatabaseError>;

    /// Copy a conversation and its messages to `target`, tagged with the run.
    /// Returns `false` if `source` does not exist. Cloning again into a
    /// `target` that already holds messages copies nothing.
    async fn clone_conversation(
        &self,
        source: Uuid,
        target: Uuid,
        run_id: Uuid,
    ) -> Result<bool, DatabaseError>;
}
