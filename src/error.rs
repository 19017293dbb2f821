//! Error types for the automation runner.

use std::time::Duration;

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Task executor errors. All of these count as a failed attempt.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Task {task_id} execution failed: {reason}")]
    Failed { task_id: Uuid, reason: String },

    #[error("Task {task_id} timed out after {timeout:?}")]
    Timeout { task_id: Uuid, timeout: Duration },

    #[error("Invalid response from executor: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Job processing errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    /// A conditioned update touched zero rows: the lease expired, was stolen,
    /// or was released.
    #[error("Lease on job {id} lost")]
    LeaseLost { id: Uuid },

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Task {task_id} references missing {entity} {reference}")]
    MissingReference {
        task_id: Uuid,
        entity: String,
        reference: String,
    },

    #[error("Cannot resolve execution identity for job {id}: {reason}")]
    Identity { id: Uuid, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
