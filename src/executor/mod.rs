//! Task execution seam.
//!
//! The runner hands every Execution task to a [`TaskExecutor`]. Implementations
//! must tolerate being retried for the same task and run id.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ExecutorError;
use crate::identity::ExecutionIdentity;
use crate::job::{Job, Task};

pub use http::HttpTaskExecutor;

/// Everything an executor needs to run one task attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub tenant_id: String,
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub run_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub name: String,
    pub prompt: String,
    /// Zero-based attempt number.
    pub attempt: u32,
    pub identity: ExecutionIdentity,
}

impl TaskRequest {
    pub fn new(job: &Job, task: &Task, identity: ExecutionIdentity, attempt: u32) -> Self {
        Self {
            tenant_id: job.tenant_id.clone(),
            job_id: job.id,
            task_id: task.id,
            run_id: task.run_id,
            conversation_id: task.conversation_id,
            name: task.name.clone(),
            prompt: task.prompt.clone(),
            attempt,
            identity,
        }
    }
}

/// Result status reported by an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Error,
}

/// Result of one task attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub status: OutcomeStatus,
    #[serde(default)]
    pub output_preview: Option<String>,
    #[serde(default)]
    pub tokens_used: i64,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl TaskOutcome {
    pub fn completed(output: impl Into<String>, tokens_used: i64) -> Self {
        Self {
            status: OutcomeStatus::Completed,
            output_preview: Some(output.into()),
            tokens_used,
            duration_seconds: None,
            error_message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Error,
            output_preview: None,
            tokens_used: 0,
            duration_seconds: None,
            error_message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }
}

/// Runs a single task attempt.
///
/// Returning `Err` and returning an outcome with [`OutcomeStatus::Error`] are
/// both counted as a failed attempt by the retry controller.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: &TaskRequest) -> Result<TaskOutcome, ExecutorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_parses_with_missing_optional_fields() {
        let outcome: TaskOutcome = serde_json::from_str(r#"{"status":"completed"}"#).unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.tokens_used, 0);
        assert!(outcome.output_preview.is_none());
    }

    #[test]
    fn error_outcome_is_not_success() {
        let outcome = TaskOutcome::error("model refused");
        assert!(!outcome.is_success());
        assert_eq!(
            serde_json::to_value(&outcome).unwrap()["status"],
            serde_json::json!("error")
        );
    }
}
