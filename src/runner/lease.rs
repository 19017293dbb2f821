//! Optimistic lease over a job row.
//!
//! Ownership lives only in the `lease_id` / `lease_expires_at` columns, so it
//! is visible to every runner process sharing the store. A runner that dies
//! stops renewing and the job becomes claimable once the lease expires.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::JobError;
use crate::job::{Job, JobStatus};
use crate::store::{JobStore, LeaseClaim};

pub struct LeaseManager {
    store: Arc<dyn JobStore>,
    duration: Duration,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn JobStore>, duration: Duration) -> Self {
        Self { store, duration }
    }

    fn lease_span(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.duration).unwrap_or(chrono::Duration::seconds(120))
    }

    /// Try to take the lease on `job` as observed by the caller.
    ///
    /// Returns the refetched job and the new lease token, or `None` if the
    /// row changed underneath us or someone else holds a live lease.
    pub async fn claim(&self, job: &Job) -> Result<Option<(Job, Uuid)>, JobError> {
        let now = Utc::now();
        let claimable = matches!(job.status, JobStatus::Pending | JobStatus::Running);
        if !claimable || !job.lease_available(now) {
            return Ok(None);
        }

        let lease_id = Uuid::new_v4();
        let claim = LeaseClaim {
            tenant_id: &job.tenant_id,
            job_id: job.id,
            expected_status: job.status,
            lease_id,
            now,
            expires_at: now + self.lease_span(),
        };

        if self.store.claim_job(&claim).await? != 1 {
            debug!(job_id = %job.id, "Lease claim lost");
            return Ok(None);
        }

        let claimed = self
            .store
            .get_job(&job.tenant_id, job.id)
            .await?
            .ok_or(JobError::NotFound { id: job.id })?;

        debug!(job_id = %job.id, %lease_id, "Lease claimed");
        Ok(Some((claimed, lease_id)))
    }

    /// Make sure the lease survives the next unit of work.
    ///
    /// Renews only once less than half the lease remains. Fails with
    /// [`JobError::LeaseLost`] if the lease was released, stolen, or already
    /// expired.
    pub async fn ensure_lease(&self, job: &Job, lease_id: Uuid) -> Result<(), JobError> {
        let current = self
            .store
            .get_job(&job.tenant_id, job.id)
            .await?
            .ok_or(JobError::NotFound { id: job.id })?;

        if current.lease_id != Some(lease_id) {
            return Err(JobError::LeaseLost { id: job.id });
        }

        let now = Utc::now();
        let remaining = current.lease_expires_at.map(|expires_at| expires_at - now);
        if remaining.is_some_and(|left| left > self.lease_span() / 2) {
            return Ok(());
        }

        let renewed = self
            .store
            .renew_lease(&job.tenant_id, job.id, lease_id, now, now + self.lease_span())
            .await?;
        if renewed == 0 {
            return Err(JobError::LeaseLost { id: job.id });
        }

        debug!(job_id = %job.id, %lease_id, "Lease renewed");
        Ok(())
    }

    /// Give the lease back. Failures are only logged: an unreleased lease
    /// simply expires.
    pub async fn release(&self, job: &Job, lease_id: Uuid) {
        match self.store.release_lease(&job.tenant_id, job.id, lease_id).await {
            Ok(0) => debug!(job_id = %job.id, %lease_id, "Lease already gone"),
            Ok(_) => debug!(job_id = %job.id, %lease_id, "Lease released"),
            Err(e) => warn!(job_id = %job.id, %lease_id, error = %e, "Failed to release lease"),
        }
    }
}
