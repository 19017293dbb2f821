//! Execution identity resolution.
//!
//! Every task attempt runs on behalf of a principal with a set of roles. The
//! resolver is consulted once per attempt, so a revoked identity fails the
//! remaining attempts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::job::Job;

/// Principal and roles a task runs under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionIdentity {
    pub tenant_id: String,
    pub principal: String,
    pub roles: Vec<String>,
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, job: &Job) -> Result<ExecutionIdentity, JobError>;
}

/// Uses the job's `execution_identity`, falling back to its creator.
pub struct DefaultIdentityResolver {
    default_roles: Vec<String>,
}

impl DefaultIdentityResolver {
    pub fn new(default_roles: Vec<String>) -> Self {
        Self { default_roles }
    }
}

#[async_trait]
impl IdentityResolver for DefaultIdentityResolver {
    async fn resolve(&self, job: &Job) -> Result<ExecutionIdentity, JobError> {
        let principal = job
            .execution_identity
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| job.created_by.trim());

        if principal.is_empty() {
            return Err(JobError::Identity {
                id: job.id,
                reason: "job has neither an execution identity nor a creator".to_string(),
            });
        }

        Ok(ExecutionIdentity {
            tenant_id: job.tenant_id.clone(),
            principal: principal.to_string(),
            roles: self.default_roles.clone(),
        })
    }
}
