//! Expands Template tasks into the Execution tasks of a run.
//!
//! Materialization is idempotent per `(job, run_id)`: a later pass of the same
//! run reuses what an earlier (possibly crashed) pass inserted.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::JobError;
use crate::job::{Job, Task};
use crate::store::JobStore;

/// Duplicates the conversation context a template is bound to.
#[async_trait]
pub trait ContextCloner: Send + Sync {
    /// Clone `template`'s context for `run_id`. `Ok(None)` means the template
    /// has no context to clone.
    async fn clone_context(
        &self,
        job: &Job,
        template: &Task,
        run_id: Uuid,
    ) -> Result<Option<Uuid>, JobError>;
}

/// Clones conversations through the job store.
pub struct StoreContextCloner {
    store: Arc<dyn JobStore>,
}

impl StoreContextCloner {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ContextCloner for StoreContextCloner {
    async fn clone_context(
        &self,
        _job: &Job,
        template: &Task,
        run_id: Uuid,
    ) -> Result<Option<Uuid>, JobError> {
        let Some(source) = template.conversation_id else {
            return Ok(None);
        };

        // Stable per (run, template): a retried materialization lands on the
        // clone an earlier attempt already made.
        let target = Uuid::new_v5(&run_id, template.id.as_bytes());
        if !self.store.clone_conversation(source, target, run_id).await? {
            return Err(JobError::MissingReference {
                task_id: template.id,
                entity: "conversation".to_string(),
                reference: source.to_string(),
            });
        }
        Ok(Some(target))
    }
}

pub struct Materializer {
    store: Arc<dyn JobStore>,
    cloner: Arc<dyn ContextCloner>,
}

impl Materializer {
    pub fn new(store: Arc<dyn JobStore>, cloner: Arc<dyn ContextCloner>) -> Self {
        Self { store, cloner }
    }

    /// Return the Execution tasks of `run_id`, creating them on first use.
    pub async fn ensure_tasks(&self, job: &Job, run_id: Uuid) -> Result<Vec<Task>, JobError> {
        let existing = self.store.list_execution_tasks(job.id, run_id).await?;
        if !existing.is_empty() {
            debug!(job_id = %job.id, %run_id, count = existing.len(), "Reusing execution tasks");
            return Ok(existing);
        }

        let templates = self.store.list_template_tasks(job.id).await?;
        let tasks = if templates.is_empty() {
            vec![Task::default_for(job, run_id)]
        } else {
            let mut tasks = Vec::with_capacity(templates.len());
            for template in &templates {
                match self.cloner.clone_context(job, template, run_id).await {
                    Ok(conversation_id) => {
                        tasks.push(Task::execution_from(template, run_id, conversation_id));
                    }
                    Err(e @ JobError::MissingReference { .. }) => {
                        warn!(
                            job_id = %job.id,
                            task_id = %template.id,
                            error = %e,
                            "Skipping template with missing context"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            tasks
        };

        let inserted = self.store.insert_execution_tasks(&tasks).await?;
        info!(
            job_id = %job.id,
            %run_id,
            templates = templates.len(),
            inserted,
            "Materialized execution tasks"
        );

        // A racing pass may have won the insert; the store is authoritative.
        Ok(self.store.list_execution_tasks(job.id, run_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobTrigger, TaskType};
    use crate::runner::testing::memory_store;
    use crate::store::LibSqlBackend;

    async fn setup() -> (Arc<LibSqlBackend>, Materializer) {
        let store = memory_store().await;
        let cloner = Arc::new(StoreContextCloner::new(store.clone()));
        let materializer = Materializer::new(store.clone(), cloner);
        (store, materializer)
    }

    #[tokio::test]
    async fn default_task_when_no_templates() {
        let (store, materializer) = setup().await;
        let job = Job::new("t", "Weekly report", "Write the weekly report", JobTrigger::Manual);
        store.insert_job(&job).await.unwrap();

        let run_id = Uuid::new_v4();
        let tasks = materializer.ensure_tasks(&job, run_id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].prompt, "Write the weekly report");
        assert_eq!(tasks[0].task_type, TaskType::Execution);
        assert!(tasks[0].source_task_id.is_none());
    }

    #[tokio::test]
    async fn repeated_passes_reuse_tasks() {
        let (store, materializer) = setup().await;
        let job = Job::new("t", "digest", "", JobTrigger::Manual);
        store.insert_job(&job).await.unwrap();
        for seq in 0..3 {
            store
                .insert_task(&Task::template(job.id, seq, format!("step {seq}"), "do it"))
                .await
                .unwrap();
        }

        let run_id = Uuid::new_v4();
        let first = materializer.ensure_tasks(&job, run_id).await.unwrap();
        let second = materializer.ensure_tasks(&job, run_id).await.unwrap();

        assert_eq!(first.len(), 3);
        let first_ids: Vec<Uuid> = first.iter().map(|t| t.id).collect();
        let second_ids: Vec<Uuid> = second.iter().map(|t| t.id).collect();
        assert_eq!(first_ids, second_ids);
        assert_eq!(
            first.iter().map(|t| t.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[tokio::test]
    async fn racing_materializers_do_not_duplicate() {
        let (store, materializer) = setup().await;
        let job = Job::new("t", "digest", "", JobTrigger::Manual);
        store.insert_job(&job).await.unwrap();
        store
            .insert_task(&Task::template(job.id, 0, "only", "do it"))
            .await
            .unwrap();

        let run_id = Uuid::new_v4();
        let (a, b) = tokio::join!(
            materializer.ensure_tasks(&job, run_id),
            materializer.ensure_tasks(&job, run_id)
        );
        assert_eq!(a.unwrap().len(), 1);
        assert_eq!(b.unwrap().len(), 1);
        assert_eq!(store.list_execution_tasks(job.id, run_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clones_conversation_per_run() {
        let (store, materializer) = setup().await;
        let job = Job::new("t", "digest", "", JobTrigger::Manual);
        store.insert_job(&job).await.unwrap();

        let conversation = Uuid::new_v4();
        store.ensure_conversation(conversation, "t", Some("context")).await.unwrap();
        store
            .add_conversation_message(conversation, "user", "background info")
            .await
            .unwrap();
        let template = Task::template(job.id, 0, "answer", "Use the context").with_conversation(conversation);
        store.insert_task(&template).await.unwrap();

        let tasks = materializer.ensure_tasks(&job, Uuid::new_v4()).await.unwrap();
        let cloned = tasks[0].conversation_id.unwrap();
        assert_ne!(cloned, conversation);

        let messages = store.list_conversation_messages(cloned).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "background info");
    }

    /// Fails once on the first call for a given template, then defers to the store.
    struct FlakyCloner {
        inner: StoreContextCloner,
        fail_on: Uuid,
        failed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ContextCloner for FlakyCloner {
        async fn clone_context(
            &self,
            job: &Job,
            template: &Task,
            run_id: Uuid,
        ) -> Result<Option<Uuid>, JobError> {
            if template.id == self.fail_on
                && !self.failed.swap(true, std::sync::atomic::Ordering::SeqCst)
            {
                return Err(crate::error::DatabaseError::Query("disk I/O error".to_string()).into());
            }
            self.inner.clone_context(job, template, run_id).await
        }
    }

    #[tokio::test]
    async fn interrupted_materialization_reuses_clones() {
        let store = memory_store().await;
        let job = Job::new("t", "digest", "", JobTrigger::Manual);
        store.insert_job(&job).await.unwrap();

        let conversation = Uuid::new_v4();
        store.ensure_conversation(conversation, "t", None).await.unwrap();
        store.add_conversation_message(conversation, "user", "first").await.unwrap();
        store.add_conversation_message(conversation, "assistant", "second").await.unwrap();

        let first = Task::template(job.id, 0, "a", "p").with_conversation(conversation);
        let second = Task::template(job.id, 1, "b", "p").with_conversation(conversation);
        store.insert_task(&first).await.unwrap();
        store.insert_task(&second).await.unwrap();

        let cloner = Arc::new(FlakyCloner {
            inner: StoreContextCloner::new(store.clone()),
            fail_on: second.id,
            failed: Default::default(),
        });
        let materializer = Materializer::new(store.clone(), cloner);
        let run_id = Uuid::new_v4();

        // The first template is cloned before the second one fails.
        let err = materializer.ensure_tasks(&job, run_id).await.unwrap_err();
        assert!(matches!(err, JobError::Database(_)));
        assert!(store.list_execution_tasks(job.id, run_id).await.unwrap().is_empty());

        let tasks = materializer.ensure_tasks(&job, run_id).await.unwrap();
        assert_eq!(tasks.len(), 2);
        let reused = tasks[0].conversation_id.unwrap();
        assert_eq!(reused, Uuid::new_v5(&run_id, first.id.as_bytes()));
        assert_eq!(store.list_conversation_messages(reused).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn clone_is_idempotent_per_run() {
        let store = memory_store().await;
        let cloner = StoreContextCloner::new(store.clone());
        let job = Job::new("t", "digest", "", JobTrigger::Manual);

        let conversation = Uuid::new_v4();
        store.ensure_conversation(conversation, "t", None).await.unwrap();
        store.add_conversation_message(conversation, "user", "hello").await.unwrap();
        let template = Task::template(job.id, 0, "a", "p").with_conversation(conversation);

        let run_id = Uuid::new_v4();
        let a = cloner.clone_context(&job, &template, run_id).await.unwrap();
        let b = cloner.clone_context(&job, &template, run_id).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.list_conversation_messages(a.unwrap()).await.unwrap().len(), 1);

        let other = cloner.clone_context(&job, &template, Uuid::new_v4()).await.unwrap();
        assert_ne!(a, other);
    }

    #[tokio::test]
    async fn missing_context_skips_only_that_template() {
        let (store, materializer) = setup().await;
        let job = Job::new("t", "digest", "", JobTrigger::Manual);
        store.insert_job(&job).await.unwrap();

        let broken = Task::template(job.id, 0, "broken", "p").with_conversation(Uuid::new_v4());
        let fine = Task::template(job.id, 1, "fine", "p");
        store.insert_task(&broken).await.unwrap();
        store.insert_task(&fine).await.unwrap();

        let tasks = materializer.ensure_tasks(&job, Uuid::new_v4()).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].source_task_id, Some(fine.id));
    }

    #[tokio::test]
    async fn runs_are_isolated() {
        let (store, materializer) = setup().await;
        let job = Job::new("t", "digest", "p", JobTrigger::Schedule);
        store.insert_job(&job).await.unwrap();

        let a = materializer.ensure_tasks(&job, Uuid::new_v4()).await.unwrap();
        let b = materializer.ensure_tasks(&job, Uuid::new_v4()).await.unwrap();
        assert_ne!(a[0].id, b[0].id);
    }
}
