//! Rolls a run's task outcomes up into the job's terminal state.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::JobError;
use crate::job::{CostModel, Job, JobFinalization, JobStatus, Task, TaskStatus};
use crate::runner::PassOutcome;
use crate::runner::lease::LeaseManager;
use crate::store::JobStore;

/// Terminal job status for a fully settled set of tasks.
///
/// Any Stopped task wins over any Error, which wins over Completed.
pub fn aggregate_status(tasks: &[Task]) -> JobStatus {
    if tasks.iter().any(|t| t.status == TaskStatus::Stopped) {
        JobStatus::Stopped
    } else if tasks.iter().any(|t| t.status == TaskStatus::Error) {
        JobStatus::Error
    } else {
        JobStatus::Completed
    }
}

pub struct Finalizer {
    store: Arc<dyn JobStore>,
    leases: Arc<LeaseManager>,
    cost: CostModel,
}

impl Finalizer {
    pub fn new(store: Arc<dyn JobStore>, leases: Arc<LeaseManager>, cost: CostModel) -> Self {
        Self {
            store,
            leases,
            cost,
        }
    }

    pub async fn finalize(
        &self,
        job: &Job,
        lease_id: Uuid,
        run_id: Uuid,
    ) -> Result<PassOutcome, JobError> {
        let tasks = self.store.list_execution_tasks(job.id, run_id).await?;
        let unsettled = tasks.iter().filter(|t| !t.status.is_settled()).count();
        if unsettled > 0 {
            debug!(job_id = %job.id, %run_id, unsettled, "Run not settled yet");
            return Ok(PassOutcome::Deferred);
        }

        let current = self
            .store
            .get_job(&job.tenant_id, job.id)
            .await?
            .ok_or(JobError::NotFound { id: job.id })?;
        if current.status != JobStatus::Running {
            info!(job_id = %job.id, status = %current.status, "Job no longer running, not finalizing");
            self.leases.release(&current, lease_id).await;
            return Ok(PassOutcome::Stopped);
        }

        let status = aggregate_status(&tasks);
        let now = Utc::now();
        let duration_seconds = current
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);
        let tokens: i64 = tasks.iter().map(|t| t.tokens_used).sum();
        let finalization = JobFinalization {
            status,
            completed_at: now,
            duration_seconds,
            estimated_cost: self.cost.estimate(tokens),
        };

        let updated = self
            .store
            .finalize_job(&job.tenant_id, job.id, lease_id, &finalization)
            .await?;
        if updated == 0 {
            debug!(job_id = %job.id, %lease_id, "Finalization lost the lease, abandoning");
            return Ok(PassOutcome::LeaseLost);
        }

        info!(
            job_id = %job.id,
            %run_id,
            %status,
            tasks = tasks.len(),
            tokens,
            cost = %finalization.estimated_cost,
            duration_seconds,
            "Job finalized"
        );
        Ok(PassOutcome::Finalized(status))
    }
}
