//! Core types for automation jobs and their tasks.
//!
//! A job is a tenant-owned unit of automation made of one or more Template
//! tasks. Each processing run clones the templates into Execution tasks, which
//! carry the actual results.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status shared by the job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Error,
    Stopped,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Stopped) |
            (Running, Completed) | (Running, Error) | (Running, Stopped)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stopped)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

impl FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Status of a single task. Same vocabulary as jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Error,
    Stopped,
}

impl TaskStatus {
    /// A settled task needs no further processing in this run.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stopped)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// How a job gets started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTrigger {
    /// Started by an explicit "run now" action.
    Manual,
    /// Started by the external schedule evaluator flipping it due.
    Schedule,
}

impl std::fmt::Display for JobTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Schedule => write!(f, "schedule"),
        }
    }
}

impl FromStr for JobTrigger {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "schedule" => Ok(Self::Schedule),
            other => Err(format!("unknown job trigger: {other}")),
        }
    }
}

/// Whether a task is an authored definition or a per-run instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Template,
    Execution,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Template => write!(f, "template"),
            Self::Execution => write!(f, "execution"),
        }
    }
}

impl FromStr for TaskType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "template" => Ok(Self::Template),
            "execution" => Ok(Self::Execution),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

/// An automation job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub prompt: String,
    pub status: JobStatus,
    pub trigger: JobTrigger,
    pub schedule: Option<String>,

    // Run bookkeeping (runner-managed)
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub lease_id: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_run_id: Option<Uuid>,

    pub retry_limit: u32,
    /// Persisted for the authoring surface. The runner always executes tasks
    /// sequentially and never reads this.
    pub parallelism: u32,
    pub execution_identity: Option<String>,
    pub estimated_cost: Decimal,
    pub snapshot: serde_json::Value,

    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job for a tenant.
    pub fn new(
        tenant_id: impl Into<String>,
        name: impl Into<String>,
        prompt: impl Into<String>,
        trigger: JobTrigger,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            prompt: prompt.into(),
            status: JobStatus::Pending,
            trigger,
            schedule: None,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            lease_id: None,
            lease_expires_at: None,
            last_run_id: None,
            retry_limit: 2,
            parallelism: 1,
            execution_identity: None,
            estimated_cost: Decimal::ZERO,
            snapshot: serde_json::json!({}),
            created_by: "system".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    /// Whether another runner could claim this job at `now`.
    pub fn lease_available(&self, now: DateTime<Utc>) -> bool {
        match (self.lease_id, self.lease_expires_at) {
            (None, _) => true,
            (Some(_), Some(expires)) => expires <= now,
            (Some(_), None) => true,
        }
    }
}

/// A task row, either a Template or an Execution instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub sequence: i64,
    pub name: String,
    pub prompt: String,
    /// Template this execution task was cloned from.
    pub source_task_id: Option<Uuid>,
    pub run_id: Option<Uuid>,
    /// Linked conversation context.
    pub conversation_id: Option<Uuid>,
    pub input_preview: Option<String>,
    pub output_preview: Option<String>,
    pub tokens_used: i64,
    pub duration_seconds: Option<f64>,
    pub attempts: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a template task for a job.
    pub fn template(job_id: Uuid, sequence: i64, name: impl Into<String>, prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        let prompt = prompt.into();
        Self {
            id: Uuid::new_v4(),
            job_id,
            task_type: TaskType::Template,
            status: TaskStatus::Pending,
            sequence,
            name: name.into(),
            input_preview: Some(preview(&prompt)),
            prompt,
            source_task_id: None,
            run_id: None,
            conversation_id: None,
            output_preview: None,
            tokens_used: 0,
            duration_seconds: None,
            attempts: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_conversation(mut self, conversation_id: Uuid) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    /// Build the execution instance of a template for one run.
    pub fn execution_from(template: &Task, run_id: Uuid, conversation_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_id: template.job_id,
            task_type: TaskType::Execution,
            status: TaskStatus::Pending,
            sequence: template.sequence,
            name: template.name.clone(),
            prompt: template.prompt.clone(),
            source_task_id: Some(template.id),
            run_id: Some(run_id),
            conversation_id,
            input_preview: template.input_preview.clone(),
            output_preview: None,
            tokens_used: 0,
            duration_seconds: None,
            attempts: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Synthesize the single execution task of a job that has no templates.
    pub fn default_for(job: &Job, run_id: Uuid) -> Self {
        let now = Utc::now();
        let prompt = if job.prompt.is_empty() {
            job.name.clone()
        } else {
            job.prompt.clone()
        };
        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            task_type: TaskType::Execution,
            status: TaskStatus::Pending,
            sequence: 0,
            name: job.name.clone(),
            input_preview: Some(preview(&prompt)),
            prompt,
            source_task_id: None,
            run_id: Some(run_id),
            conversation_id: None,
            output_preview: None,
            tokens_used: 0,
            duration_seconds: None,
            attempts: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Terminal fields written to a task once its attempts are over.
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub status: TaskStatus,
    pub output_preview: Option<String>,
    pub tokens_used: i64,
    pub duration_seconds: f64,
    pub error_message: Option<String>,
}

/// Terminal fields written to a job by the finalizer.
#[derive(Debug, Clone)]
pub struct JobFinalization {
    pub status: JobStatus,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub estimated_cost: Decimal,
}

/// Per-status task counts for the reporting layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobProgress {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub error: usize,
    pub stopped: usize,
}

impl JobProgress {
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let mut progress = Self {
            total: tasks.len(),
            ..Default::default()
        };
        for task in tasks {
            match task.status {
                TaskStatus::Pending => progress.pending += 1,
                TaskStatus::Running => progress.running += 1,
                TaskStatus::Completed => progress.completed += 1,
                TaskStatus::Error => progress.error += 1,
                TaskStatus::Stopped => progress.stopped += 1,
            }
        }
        progress
    }
}

const PREVIEW_CHARS: usize = 500;

/// Truncate text for the preview columns.
pub fn preview(s: &str) -> String {
    if s.chars().count() <= PREVIEW_CHARS {
        s.to_string()
    } else {
        let cut: String = s.chars().take(PREVIEW_CHARS).collect();
        format!("{cut}...")
    }
}
