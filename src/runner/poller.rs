//! The job runner — periodic poll loop that drives processing passes.
//!
//! Each tick lists claimable jobs and spawns one pass per job. Passes run
//! concurrently with each other; tasks inside a pass run one at a time in
//! sequence order. Cross-process exclusion comes only from the lease, the
//! in-memory active set merely keeps this process from dispatching a job it is
//! already handling.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::error::JobError;
use crate::executor::TaskExecutor;
use crate::identity::IdentityResolver;
use crate::job::{CostModel, Job, JobStatus};
use crate::runner::PassOutcome;
use crate::runner::finalizer::Finalizer;
use crate::runner::lease::LeaseManager;
use crate::runner::materializer::{ContextCloner, Materializer};
use crate::runner::retry::{RetryController, TaskRunOutcome};
use crate::store::JobStore;

/// Collaborators the runner is built from.
pub struct RunnerDeps {
    pub store: Arc<dyn JobStore>,
    pub executor: Arc<dyn TaskExecutor>,
    pub identity: Arc<dyn IdentityResolver>,
    pub cloner: Arc<dyn ContextCloner>,
}

pub struct JobRunner {
    config: RunnerConfig,
    store: Arc<dyn JobStore>,
    leases: Arc<LeaseManager>,
    materializer: Materializer,
    retry: RetryController,
    finalizer: Finalizer,
    /// Set while a tick is scanning.
    polling: AtomicBool,
    /// Jobs with a pass in flight in this process.
    active: RwLock<HashSet<Uuid>>,
    passes: Mutex<JoinSet<()>>,
    shutdown: watch::Sender<bool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// Clears the polling flag when a tick ends, however it ends.
struct PollGuard<'a>(&'a AtomicBool);

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl JobRunner {
    pub fn new(config: RunnerConfig, deps: RunnerDeps) -> Self {
        let leases = Arc::new(LeaseManager::new(deps.store.clone(), config.lease_duration));
        let materializer = Materializer::new(deps.store.clone(), deps.cloner);
        let retry = RetryController::new(
            deps.store.clone(),
            leases.clone(),
            deps.executor,
            deps.identity,
            config.backoff,
        );
        let finalizer = Finalizer::new(
            deps.store.clone(),
            leases.clone(),
            CostModel::new(config.cost_per_token),
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            store: deps.store,
            leases,
            materializer,
            retry,
            finalizer,
            polling: AtomicBool::new(false),
            active: RwLock::new(HashSet::new()),
            passes: Mutex::new(JoinSet::new()),
            shutdown,
            ticker: Mutex::new(None),
        }
    }

    /// Start the poll loop. The first tick fires immediately. Calling this on
    /// a running runner does nothing.
    pub async fn start(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock().await;
        if ticker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        self.shutdown.send_replace(false);
        let mut shutdown_rx = self.shutdown.subscribe();
        let runner = Arc::clone(self);
        let interval = self.config.poll_interval;

        *ticker = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        runner.tick().await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Poll loop exited");
        }));

        info!(
            runner_id = %self.config.runner_id,
            interval_secs = interval.as_secs(),
            batch_size = self.config.batch_size,
            "Job runner started"
        );
    }

    /// Stop polling and wait for in-flight passes to finish.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handle = self.ticker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Poll loop task failed");
            }
        }

        let mut passes = self.passes.lock().await;
        while let Some(result) = passes.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Job pass panicked");
            }
        }
        info!(runner_id = %self.config.runner_id, "Job runner stopped");
    }

    /// Scan for claimable jobs and dispatch a pass for each. Returns the
    /// number of passes dispatched.
    pub async fn tick(self: &Arc<Self>) -> usize {
        if self.polling.swap(true, Ordering::AcqRel) {
            debug!("Tick already in progress, skipping");
            return 0;
        }
        let _guard = PollGuard(&self.polling);

        self.reap_passes().await;

        let jobs = match self
            .store
            .list_claimable_jobs(Utc::now(), self.config.batch_size)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Failed to list claimable jobs");
                return 0;
            }
        };

        let mut dispatched = 0;
        for job in jobs {
            if self.dispatch(job).await {
                dispatched += 1;
            }
        }
        if dispatched > 0 {
            debug!(dispatched, "Tick dispatched jobs");
        }
        dispatched
    }

    /// Dispatch a pass for one job right away, e.g. for a manual "run now".
    ///
    /// Returns `false` if the job already has a pass in flight here. Terminal
    /// jobs are rejected with [`JobError::InvalidTransition`].
    pub async fn trigger(self: &Arc<Self>, tenant_id: &str, job_id: Uuid) -> Result<bool, JobError> {
        let job = self
            .store
            .get_job(tenant_id, job_id)
            .await?
            .ok_or(JobError::NotFound { id: job_id })?;

        if job.status.is_terminal() || job.completed_at.is_some() {
            return Err(JobError::InvalidTransition {
                id: job_id,
                state: job.status.to_string(),
                target: JobStatus::Running.to_string(),
            });
        }
        Ok(self.dispatch(job).await)
    }

    async fn dispatch(self: &Arc<Self>, job: Job) -> bool {
        if !self.active.write().await.insert(job.id) {
            debug!(job_id = %job.id, "Job already active in this runner");
            return false;
        }

        let runner = Arc::clone(self);
        self.passes.lock().await.spawn(async move {
            let job_id = job.id;
            let outcome = runner.process_job(job).await;
            debug!(%job_id, ?outcome, "Pass finished");
            runner.active.write().await.remove(&job_id);
        });
        true
    }

    async fn reap_passes(&self) {
        let mut passes = self.passes.lock().await;
        while let Some(result) = passes.try_join_next() {
            if let Err(e) = result {
                error!(error = %e, "Job pass panicked");
            }
        }
    }

    /// Run one full processing pass over `job`. Never fails: errors are
    /// logged and reported as [`PassOutcome::Aborted`].
    pub async fn process_job(&self, job: Job) -> PassOutcome {
        let (job, lease_id) = match self.leases.claim(&job).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return PassOutcome::NotClaimed,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to claim job");
                return PassOutcome::Aborted(e.to_string());
            }
        };
        info!(job_id = %job.id, tenant = %job.tenant_id, %lease_id, "Processing job");

        let outcome = match self.drive(&job, lease_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Job pass failed");
                PassOutcome::Aborted(e.to_string())
            }
        };

        // Hand the job back so the next tick can resume it without waiting
        // for the lease to expire.
        if matches!(
            outcome,
            PassOutcome::Deferred | PassOutcome::LeaseLost | PassOutcome::Aborted(_)
        ) {
            self.leases.release(&job, lease_id).await;
        }
        outcome
    }

    async fn drive(&self, job: &Job, lease_id: Uuid) -> Result<PassOutcome, JobError> {
        let run_id = match job.last_run_id {
            Some(run_id) => run_id,
            None => {
                let run_id = Uuid::new_v4();
                let started = self
                    .store
                    .begin_run(&job.tenant_id, job.id, lease_id, run_id, Utc::now())
                    .await?;
                if started == 0 {
                    warn!(job_id = %job.id, "Run already started by another owner");
                    return Ok(PassOutcome::LeaseLost);
                }
                info!(job_id = %job.id, %run_id, "Run started");
                run_id
            }
        };

        let tasks = self.materializer.ensure_tasks(job, run_id).await?;

        for task in tasks.iter().filter(|t| !t.status.is_settled()) {
            let current = self
                .store
                .get_job(&job.tenant_id, job.id)
                .await?
                .ok_or(JobError::NotFound { id: job.id })?;
            if current.status != JobStatus::Running {
                info!(job_id = %job.id, status = %current.status, "Job stopped externally");
                self.leases.release(&current, lease_id).await;
                return Ok(PassOutcome::Stopped);
            }
            if current.lease_id != Some(lease_id) {
                return Ok(PassOutcome::LeaseLost);
            }

            if self.retry.run_task(&current, lease_id, task).await? == TaskRunOutcome::LeaseLost {
                return Ok(PassOutcome::LeaseLost);
            }
        }

        self.finalizer.finalize(job, lease_id, run_id).await
    }
}
