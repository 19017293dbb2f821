//! libSQL backend — async `JobStore` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! fixed-width RFC 3339 text (millisecond precision, `Z` suffix) so that SQL
//! string comparison matches chronological order.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::job::{Job, JobFinalization, JobStatus, Task, TaskCompletion, TaskStatus};
use crate::store::migrations;
use crate::store::traits::{ConversationMessage, JobStore, LeaseClaim};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        // Several runner processes may share one file.
        for pragma in ["PRAGMA journal_mode = WAL", "PRAGMA busy_timeout = 5000"] {
            conn.query(pragma, ())
                .await
                .map_err(|e| DatabaseError::Pool(format!("{pragma}: {e}")))?;
        }

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Overwrite a job's lease expiry, simulating a lease that ran out.
    #[cfg(test)]
    pub(crate) async fn set_lease_expiry(
        &self,
        job_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE jobs SET lease_expires_at = ?1 WHERE id = ?2",
                params![fmt_ts(expires_at), job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_lease_expiry: {e}")))?;
        Ok(())
    }

    /// Run arbitrary SQL, for breaking the schema under a test.
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute_batch(sql)
            .await
            .map_err(|e| DatabaseError::Query(format!("execute_raw: {e}")))?;
        Ok(())
    }

    async fn query_jobs(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("Skipping job row: {e}"),
            }
        }
        Ok(jobs)
    }

    async fn query_tasks(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            match row_to_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => tracing::warn!("Skipping task row: {e}"),
            }
        }
        Ok(tasks)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp write format.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

fn opt_uuid(id: Option<Uuid>) -> libsql::Value {
    match id {
        Some(id) => libsql::Value::Text(id.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_real(v: Option<f64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(v),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid '{s}': {e}")))
}

fn parse_opt_uuid(s: Option<String>) -> Option<Uuid> {
    s.and_then(|s| Uuid::parse_str(&s).ok())
}

const JOB_COLUMNS: &str = "id, tenant_id, name, prompt, status, trigger_type, schedule, started_at, completed_at, duration_seconds, lease_id, lease_expires_at, last_run_id, retry_limit, parallelism, execution_identity, estimated_cost, snapshot, created_by, created_at, updated_at";

const TASK_COLUMNS: &str = "id, job_id, task_type, status, sequence, name, prompt, source_task_id, run_id, conversation_id, input_preview, output_preview, tokens_used, duration_seconds, attempts, error_message, created_at, updated_at";

const TASK_COLUMN_COUNT: usize = 18;

/// Map a libsql Row to a Job. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Serialization(format!("job id: {e}")))?;
    let status: JobStatus = row
        .get::<String>(4)
        .unwrap_or_else(|_| "pending".to_string())
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let trigger = row
        .get::<String>(5)
        .unwrap_or_else(|_| "manual".to_string())
        .parse()
        .map_err(DatabaseError::Serialization)?;

    let cost_str: String = row.get(16).unwrap_or_else(|_| "0".to_string());
    let snapshot_str: String = row.get(17).unwrap_or_else(|_| "{}".to_string());
    let created_str: String = row.get(19).unwrap_or_default();
    let updated_str: String = row.get(20).unwrap_or_default();

    Ok(Job {
        id: parse_uuid(&id_str)?,
        tenant_id: row.get(1).unwrap_or_default(),
        name: row.get(2).unwrap_or_default(),
        prompt: row.get(3).unwrap_or_default(),
        status,
        trigger,
        schedule: row.get::<String>(6).ok(),
        started_at: row.get::<String>(7).ok().map(|s| parse_datetime(&s)),
        completed_at: row.get::<String>(8).ok().map(|s| parse_datetime(&s)),
        duration_seconds: row.get::<f64>(9).ok(),
        lease_id: parse_opt_uuid(row.get::<String>(10).ok()),
        lease_expires_at: row.get::<String>(11).ok().map(|s| parse_datetime(&s)),
        last_run_id: parse_opt_uuid(row.get::<String>(12).ok()),
        retry_limit: row.get::<i64>(13).unwrap_or(0).max(0) as u32,
        parallelism: row.get::<i64>(14).unwrap_or(1).max(1) as u32,
        execution_identity: row.get::<String>(15).ok(),
        estimated_cost: Decimal::from_str(&cost_str).unwrap_or(Decimal::ZERO),
        snapshot: serde_json::from_str(&snapshot_str).unwrap_or(serde_json::json!({})),
        created_by: row.get(18).unwrap_or_default(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a Task. Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Serialization(format!("task id: {e}")))?;
    let job_id_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Serialization(format!("task job_id: {e}")))?;
    let task_type = row
        .get::<String>(2)
        .unwrap_or_default()
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let status: TaskStatus = row
        .get::<String>(3)
        .unwrap_or_else(|_| "pending".to_string())
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let created_str: String = row.get(16).unwrap_or_default();
    let updated_str: String = row.get(17).unwrap_or_default();

    Ok(Task {
        id: parse_uuid(&id_str)?,
        job_id: parse_uuid(&job_id_str)?,
        task_type,
        status,
        sequence: row.get::<i64>(4).unwrap_or(0),
        name: row.get(5).unwrap_or_default(),
        prompt: row.get(6).unwrap_or_default(),
        source_task_id: parse_opt_uuid(row.get::<String>(7).ok()),
        run_id: parse_opt_uuid(row.get::<String>(8).ok()),
        conversation_id: parse_opt_uuid(row.get::<String>(9).ok()),
        input_preview: row.get::<String>(10).ok(),
        output_preview: row.get::<String>(11).ok(),
        tokens_used: row.get::<i64>(12).unwrap_or(0),
        duration_seconds: row.get::<f64>(13).ok(),
        attempts: row.get::<i64>(14).unwrap_or(0).max(0) as u32,
        error_message: row.get::<String>(15).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Column values of a task in TASK_COLUMNS order.
fn task_values(task: &Task) -> Vec<libsql::Value> {
    vec![
        libsql::Value::Text(task.id.to_string()),
        libsql::Value::Text(task.job_id.to_string()),
        libsql::Value::Text(task.task_type.to_string()),
        libsql::Value::Text(task.status.to_string()),
        libsql::Value::Integer(task.sequence),
        libsql::Value::Text(task.name.clone()),
        libsql::Value::Text(task.prompt.clone()),
        opt_uuid(task.source_task_id),
        opt_uuid(task.run_id),
        opt_uuid(task.conversation_id),
        opt_text(task.input_preview.as_deref()),
        opt_text(task.output_preview.as_deref()),
        libsql::Value::Integer(task.tokens_used),
        opt_real(task.duration_seconds),
        libsql::Value::Integer(task.attempts as i64),
        opt_text(task.error_message.as_deref()),
        libsql::Value::Text(fmt_ts(task.created_at)),
        libsql::Value::Text(fmt_ts(task.updated_at)),
    ]
}

/// `(?1, ?2, ...), (?19, ...)` placeholder groups for a multi-row insert.
fn row_placeholders(rows: usize, columns: usize) -> String {
    (0..rows)
        .map(|r| {
            let cols: Vec<String> = (1..=columns).map(|c| format!("?{}", r * columns + c)).collect();
            format!("({})", cols.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let snapshot = serde_json::to_string(&job.snapshot)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)"
                ),
                params![
                    job.id.to_string(),
                    job.tenant_id.clone(),
                    job.name.clone(),
                    job.prompt.clone(),
                    job.status.to_string(),
                    job.trigger.to_string(),
                    opt_text(job.schedule.as_deref()),
                    opt_ts(job.started_at),
                    opt_ts(job.completed_at),
                    opt_real(job.duration_seconds),
                    opt_uuid(job.lease_id),
                    opt_ts(job.lease_expires_at),
                    opt_uuid(job.last_run_id),
                    job.retry_limit as i64,
                    job.parallelism as i64,
                    opt_text(job.execution_identity.as_deref()),
                    job.estimated_cost.to_string(),
                    snapshot,
                    job.created_by.clone(),
                    fmt_ts(job.created_at),
                    fmt_ts(job.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;

        debug!(job_id = %job.id, tenant = %job.tenant_id, "Job inserted");
        Ok(())
    }

    async fn get_job(&self, tenant_id: &str, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut jobs = self
            .query_jobs(
                "get_job",
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE tenant_id = ?1 AND id = ?2"),
                params![tenant_id, id.to_string()],
            )
            .await?;
        Ok(jobs.pop())
    }

    async fn list_claimable_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError> {
        self.query_jobs(
            "list_claimable_jobs",
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs \
                 WHERE (status = 'running' OR (status = 'pending' AND trigger_type = 'schedule')) \
                   AND completed_at IS NULL \
                   AND (lease_id IS NULL OR lease_expires_at IS NULL OR lease_expires_at <= ?1) \
                 ORDER BY updated_at ASC LIMIT ?2"
            ),
            params![fmt_ts(now), limit as i64],
        )
        .await
    }

    async fn claim_job(&self, claim: &LeaseClaim<'_>) -> Result<u64, DatabaseError> {
        let now = fmt_ts(claim.now);
        self.conn()
            .execute(
                "UPDATE jobs SET lease_id = ?1, lease_expires_at = ?2, status = 'running', \
                     started_at = COALESCE(started_at, ?3), updated_at = ?3 \
                 WHERE tenant_id = ?4 AND id = ?5 AND completed_at IS NULL \
                   AND (lease_id IS NULL OR lease_expires_at IS NULL OR lease_expires_at <= ?3) \
                   AND status = ?6 AND status IN ('pending', 'running')",
                params![
                    claim.lease_id.to_string(),
                    fmt_ts(claim.expires_at),
                    now,
                    claim.tenant_id,
                    claim.job_id.to_string(),
                    claim.expected_status.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_job: {e}")))
    }

    async fn renew_lease(
        &self,
        tenant_id: &str,
        job_id: Uuid,
        lease_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let now = fmt_ts(now);
        self.conn()
            .execute(
                "UPDATE jobs SET lease_expires_at = ?1, updated_at = ?2 \
                 WHERE tenant_id = ?3 AND id = ?4 AND lease_id = ?5 \
                   AND lease_expires_at > ?2 AND completed_at IS NULL",
                params![
                    fmt_ts(expires_at),
                    now,
                    tenant_id,
                    job_id.to_string(),
                    lease_id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("renew_lease: {e}")))
    }

    async fn release_lease(
        &self,
        tenant_id: &str,
        job_id: Uuid,
        lease_id: Uuid,
    ) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(
                "UPDATE jobs SET lease_id = NULL, lease_expires_at = NULL, updated_at = ?1 \
                 WHERE tenant_id = ?2 AND id = ?3 AND lease_id = ?4",
                params![
                    fmt_ts(Utc::now()),
                    tenant_id,
                    job_id.to_string(),
                    lease_id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_lease: {e}")))
    }

    async fn begin_run(
        &self,
        tenant_id: &str,
        job_id: Uuid,
        lease_id: Uuid,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(
                "UPDATE jobs SET last_run_id = ?1, started_at = COALESCE(started_at, ?2), updated_at = ?2 \
                 WHERE tenant_id = ?3 AND id = ?4 AND lease_id = ?5 AND last_run_id IS NULL",
                params![
                    run_id.to_string(),
                    fmt_ts(now),
                    tenant_id,
                    job_id.to_string(),
                    lease_id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("begin_run: {e}")))
    }

    async fn finalize_job(
        &self,
        tenant_id: &str,
        job_id: Uuid,
        lease_id: Uuid,
        finalization: &JobFinalization,
    ) -> Result<u64, DatabaseError> {
        let completed_at = fmt_ts(finalization.completed_at);
        self.conn()
            .execute(
                "UPDATE jobs SET status = ?1, completed_at = ?2, duration_seconds = ?3, \
                     estimated_cost = ?4, lease_id = NULL, lease_expires_at = NULL, updated_at = ?2 \
                 WHERE tenant_id = ?5 AND id = ?6 AND lease_id = ?7 AND status = 'running'",
                params![
                    finalization.status.to_string(),
                    completed_at,
                    finalization.duration_seconds,
                    finalization.estimated_cost.to_string(),
                    tenant_id,
                    job_id.to_string(),
                    lease_id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finalize_job: {e}")))
    }

    async fn stop_job(
        &self,
        tenant_id: &str,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let now = fmt_ts(now);
        let count = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'stopped', completed_at = COALESCE(completed_at, ?1), updated_at = ?1 \
                 WHERE tenant_id = ?2 AND id = ?3 AND status IN ('pending', 'running')",
                params![now.clone(), tenant_id, job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stop_job: {e}")))?;

        if count > 0 {
            self.conn()
                .execute(
                    "UPDATE tasks SET status = 'stopped', updated_at = ?1 \
                     WHERE job_id = ?2 AND task_type = 'execution' AND status IN ('pending', 'running')",
                    params![now, job_id.to_string()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("stop_job tasks: {e}")))?;
            info!(job_id = %job_id, "Job stopped");
        }
        Ok(count)
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS}) VALUES {}",
                    row_placeholders(1, TASK_COLUMN_COUNT)
                ),
                libsql::params::Params::Positional(task_values(task)),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;
        Ok(())
    }

    async fn insert_execution_tasks(&self, tasks: &[Task]) -> Result<u64, DatabaseError> {
        if tasks.is_empty() {
            return Ok(0);
        }
        // One statement, so SQLite applies all rows or none.
        let values: Vec<libsql::Value> = tasks.iter().flat_map(task_values).collect();
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO tasks ({TASK_COLUMNS}) VALUES {}",
                    row_placeholders(tasks.len(), TASK_COLUMN_COUNT)
                ),
                libsql::params::Params::Positional(values),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_execution_tasks: {e}")))?;

        debug!(
            requested = tasks.len(),
            inserted, "Execution tasks inserted"
        );
        Ok(inserted)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut tasks = self
            .query_tasks(
                "get_task",
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(tasks.pop())
    }

    async fn list_template_tasks(&self, job_id: Uuid) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            "list_template_tasks",
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE job_id = ?1 AND task_type = 'template' \
                 ORDER BY sequence ASC, created_at ASC"
            ),
            params![job_id.to_string()],
        )
        .await
    }

    async fn list_execution_tasks(
        &self,
        job_id: Uuid,
        run_id: Uuid,
    ) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            "list_execution_tasks",
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks \
                 WHERE job_id = ?1 AND run_id = ?2 AND task_type = 'execution' \
                 ORDER BY sequence ASC, created_at ASC"
            ),
            params![job_id.to_string(), run_id.to_string()],
        )
        .await
    }

    async fn mark_task_running(&self, id: Uuid, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(
                "UPDATE tasks SET status = 'running', attempts = attempts + 1, updated_at = ?1 \
                 WHERE id = ?2 AND status IN ('pending', 'running')",
                params![fmt_ts(now), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_task_running: {e}")))
    }

    async fn complete_task(
        &self,
        id: Uuid,
        completion: &TaskCompletion,
    ) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(
                "UPDATE tasks SET status = ?1, output_preview = ?2, tokens_used = ?3, \
                     duration_seconds = ?4, error_message = ?5, updated_at = ?6 \
                 WHERE id = ?7 AND status = 'running'",
                params![
                    completion.status.to_string(),
                    opt_text(completion.output_preview.as_deref()),
                    completion.tokens_used,
                    completion.duration_seconds,
                    opt_text(completion.error_message.as_deref()),
                    fmt_ts(Utc::now()),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_task: {e}")))
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn ensure_conversation(
        &self,
        id: Uuid,
        tenant_id: &str,
        title: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO conversations (id, tenant_id, title) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(id) DO NOTHING",
                params![id.to_string(), tenant_id, opt_text(title)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ensure_conversation: {e}")))?;
        Ok(())
    }

    async fn add_conversation_message(
        &self,
        conversation_id: Uuid,
        role: &str,
        content: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO conversation_messages (id, conversation_id, role, content) VALUES (?1, ?2, ?3, ?4)",
            params![
                Uuid::new_v4().to_string(),
                conversation_id.to_string(),
                role,
                content
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("add_conversation_message: {e}")))?;

        conn.execute(
            "UPDATE conversations SET last_activity = datetime('now') WHERE id = ?1",
            params![conversation_id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("touch conversation: {e}")))?;
        Ok(())
    }

    async fn list_conversation_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<ConversationMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, role, content FROM conversation_messages \
                 WHERE conversation_id = ?1 ORDER BY created_at ASC, rowid ASC",
                params![conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_conversation_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            messages.push(ConversationMessage {
                id: row.get(0).unwrap_or_default(),
                role: row.get(1).unwrap_or_default(),
                content: row.get(2).unwrap_or_default(),
            });
        }
        Ok(messages)
    }

    async fn clone_conversation(
        &self,
        source: Uuid,
        target: Uuid,
        run_id: Uuid,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT tenant_id, title FROM conversations WHERE id = ?1",
                params![source.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("clone_conversation lookup: {e}")))?;

        let (tenant_id, title) = match rows.next().await {
            Ok(Some(row)) => (
                row.get::<String>(0).unwrap_or_default(),
                row.get::<String>(1).ok(),
            ),
            Ok(None) => return Ok(false),
            Err(e) => return Err(DatabaseError::Query(format!("clone_conversation lookup: {e}"))),
        };

        let metadata = serde_json::json!({
            "cloned_from": source.to_string(),
            "run_id": run_id.to_string(),
        })
        .to_string();

        // Cloning into an existing target is a no-op.
        conn.execute(
            "INSERT INTO conversations (id, tenant_id, title, metadata) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(id) DO NOTHING",
            params![target.to_string(), tenant_id, opt_text(title.as_deref()), metadata],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("clone_conversation insert: {e}")))?;

        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM conversation_messages WHERE conversation_id = ?1",
                params![target.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("clone_conversation count: {e}")))?;
        let existing = match rows.next().await {
            Ok(Some(row)) => row.get::<i64>(0).unwrap_or(0),
            Ok(None) => 0,
            Err(e) => return Err(DatabaseError::Query(format!("clone_conversation count: {e}"))),
        };
        if existing > 0 {
            debug!(%source, %target, messages = existing, "Conversation already cloned");
            return Ok(true);
        }

        let copied = conn
            .execute(
                "INSERT INTO conversation_messages (id, conversation_id, role, content, created_at) \
                 SELECT lower(hex(randomblob(16))), ?1, role, content, created_at \
                 FROM conversation_messages WHERE conversation_id = ?2 ORDER BY created_at, rowid",
                params![target.to_string(), source.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("clone_conversation messages: {e}")))?;

        debug!(%source, %target, messages = copied, "Conversation cloned");
        Ok(true)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
