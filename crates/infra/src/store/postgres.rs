//! Postgres-backed task and cron job store.
//!
//! Competing claimants (consumers, scheduler replicas, reapers) coordinate
//! only through row locks: every selection that feeds a write uses
//! `FOR UPDATE SKIP LOCKED`, so a row held by one transaction is invisible to
//! the others until it is released.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (check violation) | `23514` | `Constraint` |
//! | Database (not-null violation) | `23502` | `Constraint` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Io / other | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument, Span};

use duraq_core::{
    CronExpression, CronJob, CronJobId, CronJobSpec, CronJobStatus, DomainResult, NackOutcome,
    SubjectPattern, Task, TaskId, TaskStatus,
};

use super::{CronStore, FiredCronJob, StoreError, StoreResult, TaskStats, TaskStore};

const TASK_COLUMNS: &str = "id, subject, status, run_after, payload, max_attempts, attempts, \
     last_error, last_attempt, created_at, updated_at";

const CRON_JOB_COLUMNS: &str = "id, name, expression, status, subject, payload, task_run_after, \
     next_run_at, last_run_at, created_at, updated_at";

/// Postgres store.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("migration failed: {e}")))
    }

    /// Lock one task row, apply a domain transition, and write it back.
    async fn transition<T: Send>(
        &self,
        operation: &'static str,
        id: TaskId,
        apply: impl FnOnce(&mut Task) -> DomainResult<T> + Send,
    ) -> StoreResult<T> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        let Some(row) = row else {
            return Err(StoreError::TaskNotFound(id));
        };
        let mut task = task_from_row(&row)?;
        let out = apply(&mut task)?;

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2,
                run_after = $3,
                attempts = $4,
                last_error = $5,
                last_attempt = $6,
                updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(task.status.as_str())
        .bind(task.run_after)
        .bind(to_i32(task.attempts))
        .bind(&task.last_error)
        .bind(task.last_attempt)
        .bind(task.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(out)
    }
}

#[async_trait]
impl TaskStore for PgStore {
    #[instrument(skip(self, tasks), fields(task_count = tasks.len()), err)]
    async fn insert_tasks(&self, tasks: &[Task]) -> StoreResult<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        insert_tasks_tx(&mut tx, tasks).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn get_task(&self, id: TaskId) -> StoreResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_task", e))?;
        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self), fields(pattern = %pattern, task_id = tracing::field::Empty), err)]
    async fn claim_next(
        &self,
        pattern: &SubjectPattern,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Task>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE tasks
            SET status = 'running', last_attempt = $1, updated_at = $1
            WHERE id = (
                SELECT id FROM tasks
                WHERE status = 'pending'
                  AND run_after <= $1
                  AND subject ~ $2
                ORDER BY run_after ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(pattern.to_regex())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        let task = row.as_ref().map(task_from_row).transpose()?;
        if let Some(task) = &task {
            Span::current().record("task_id", tracing::field::display(task.id));
        }
        Ok(task)
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn complete(&self, id: TaskId, now: DateTime<Utc>) -> StoreResult<()> {
        self.transition("complete", id, |task| task.complete(now)).await
    }

    #[instrument(skip(self, error), fields(task_id = %id), err)]
    async fn fail_attempt(
        &self,
        id: TaskId,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<NackOutcome> {
        let error = error.to_string();
        self.transition("fail_attempt", id, move |task| task.fail_attempt(error, now))
            .await
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn requeue(&self, id: TaskId, now: DateTime<Utc>) -> StoreResult<()> {
        self.transition("requeue", id, |task| task.requeue(now)).await
    }

    #[instrument(skip(self), fields(reset = tracing::field::Empty), err)]
    async fn reset_stuck(&self, older_than: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            WITH stuck AS (
                SELECT id FROM tasks
                WHERE status = 'running' AND last_attempt < $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE tasks AS t
            SET status = 'pending',
                run_after = GREATEST(t.run_after, $2),
                updated_at = $2
            FROM stuck
            WHERE t.id = stuck.id
            "#,
        )
        .bind(older_than)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reset_stuck", e))?;

        let reset = result.rows_affected();
        Span::current().record("reset", reset);
        Ok(reset)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> StoreResult<TaskStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM tasks GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = TaskStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row.try_get("count").map_err(|e| map_sqlx_error("stats", e))?;
            let count = u64::try_from(count).unwrap_or_default();
            match status.parse::<TaskStatus>()? {
                TaskStatus::Pending => stats.pending = count,
                TaskStatus::Running => stats.running = count,
                TaskStatus::Completed => stats.completed = count,
                TaskStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl CronStore for PgStore {
    #[instrument(skip(self, specs), fields(job_count = specs.len()), err)]
    async fn upsert_cron_jobs(
        &self,
        specs: &[CronJobSpec],
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<CronJob>> {
        for spec in specs {
            spec.validate()?;
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut jobs = Vec::with_capacity(specs.len());
        for spec in specs {
            let fresh = CronJob::new(spec.clone(), now);
            let row = sqlx::query(&format!(
                r#"
                INSERT INTO cron_jobs ({CRON_JOB_COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (name) DO UPDATE SET
                    expression = EXCLUDED.expression,
                    status = EXCLUDED.status,
                    subject = EXCLUDED.subject,
                    payload = EXCLUDED.payload,
                    task_run_after = EXCLUDED.task_run_after,
                    updated_at = EXCLUDED.updated_at
                RETURNING {CRON_JOB_COLUMNS}
                "#
            ))
            .bind(fresh.id.as_uuid())
            .bind(&fresh.name)
            .bind(fresh.expression.as_str())
            .bind(fresh.status.as_str())
            .bind(&fresh.subject)
            .bind(&fresh.payload)
            .bind(to_secs(fresh.task_run_after))
            .bind(fresh.next_run_at)
            .bind(fresh.last_run_at)
            .bind(fresh.created_at)
            .bind(fresh.updated_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("upsert_cron_job", e))?;
            jobs.push(cron_job_from_row(&row)?);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(jobs)
    }

    #[instrument(skip(self), err)]
    async fn get_cron_job(&self, name: &str) -> StoreResult<Option<CronJob>> {
        let row = sqlx::query(&format!(
            "SELECT {CRON_JOB_COLUMNS} FROM cron_jobs WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_cron_job", e))?;
        row.as_ref().map(cron_job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_cron_jobs(&self) -> StoreResult<Vec<CronJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {CRON_JOB_COLUMNS} FROM cron_jobs ORDER BY name ASC"
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_cron_jobs", e))?;
        rows.iter().map(cron_job_from_row).collect()
    }

    #[instrument(skip(self), fields(fired = tracing::field::Empty), err)]
    async fn fire_due_cron_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        max_attempts: u32,
    ) -> StoreResult<Vec<FiredCronJob>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {CRON_JOB_COLUMNS} FROM cron_jobs
            WHERE status = 'active' AND next_run_at <= $1
            ORDER BY next_run_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("select_due_cron_jobs", e))?;

        let mut fired = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job = cron_job_from_row(row)?;
            let tick = job.fire(now, max_attempts)?;

            sqlx::query(
                r#"
                UPDATE cron_jobs
                SET status = $2, next_run_at = $3, last_run_at = $4, updated_at = $5
                WHERE id = $1
                "#,
            )
            .bind(job.id.as_uuid())
            .bind(job.status.as_str())
            .bind(job.next_run_at)
            .bind(job.last_run_at)
            .bind(job.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("advance_cron_job", e))?;

            fired.push(FiredCronJob {
                job,
                task: tick.task,
                exhausted: tick.exhausted,
            });
        }

        let tasks: Vec<Task> = fired.iter().map(|f| f.task.clone()).collect();
        insert_tasks_tx(&mut tx, &tasks).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("fired", fired.len());
        Ok(fired)
    }
}

/// Insert a batch inside an open transaction.
async fn insert_tasks_tx(tx: &mut Transaction<'_, Postgres>, tasks: &[Task]) -> StoreResult<()> {
    for task in tasks {
        sqlx::query(&format!(
            "INSERT INTO tasks ({TASK_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(task.id.as_uuid())
        .bind(&task.subject)
        .bind(task.status.as_str())
        .bind(task.run_after)
        .bind(&task.payload)
        .bind(to_i32(task.max_attempts))
        .bind(to_i32(task.attempts))
        .bind(&task.last_error)
        .bind(task.last_attempt)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_task", e))?;
    }
    debug!(task_count = tasks.len(), "tasks inserted");
    Ok(())
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23514") | Some("23502") => StoreError::Constraint(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn corrupt_row(what: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(format!("failed to decode {what} row: {err}"))
}

// SQLx row types

#[derive(Debug)]
struct TaskRow {
    id: uuid::Uuid,
    subject: String,
    status: String,
    run_after: DateTime<Utc>,
    payload: Vec<u8>,
    max_attempts: i32,
    attempts: i32,
    last_error: Option<String>,
    last_attempt: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskRow {
            id: row.try_get("id")?,
            subject: row.try_get("subject")?,
            status: row.try_get("status")?,
            run_after: row.try_get("run_after")?,
            payload: row.try_get("payload")?,
            max_attempts: row.try_get("max_attempts")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            last_attempt: row.try_get("last_attempt")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: TaskId::from_uuid(row.id),
            subject: row.subject,
            status: row.status.parse().map_err(|e| corrupt_row("task", e))?,
            run_after: row.run_after,
            payload: row.payload,
            max_attempts: u32::try_from(row.max_attempts).map_err(|e| corrupt_row("task", e))?,
            attempts: u32::try_from(row.attempts).map_err(|e| corrupt_row("task", e))?,
            last_error: row.last_error,
            last_attempt: row.last_attempt,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn task_from_row(row: &PgRow) -> StoreResult<Task> {
    TaskRow::from_row(row)
        .map_err(|e| corrupt_row("task", e))?
        .try_into()
}

#[derive(Debug)]
struct CronJobRow {
    id: uuid::Uuid,
    name: String,
    expression: String,
    status: String,
    subject: String,
    payload: Vec<u8>,
    task_run_after: i64,
    next_run_at: DateTime<Utc>,
    last_run_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for CronJobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(CronJobRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            expression: row.try_get("expression")?,
            status: row.try_get("status")?,
            subject: row.try_get("subject")?,
            payload: row.try_get("payload")?,
            task_run_after: row.try_get("task_run_after")?,
            next_run_at: row.try_get("next_run_at")?,
            last_run_at: row.try_get("last_run_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<CronJobRow> for CronJob {
    type Error = StoreError;

    fn try_from(row: CronJobRow) -> Result<Self, Self::Error> {
        Ok(CronJob {
            id: CronJobId::from_uuid(row.id),
            name: row.name,
            expression: CronExpression::parse(row.expression)
                .map_err(|e| corrupt_row("cron job", e))?,
            status: row
                .status
                .parse::<CronJobStatus>()
                .map_err(|e| corrupt_row("cron job", e))?,
            subject: row.subject,
            payload: row.payload,
            task_run_after: Duration::from_secs(u64::try_from(row.task_run_after).unwrap_or(0)),
            next_run_at: row.next_run_at,
            last_run_at: row.last_run_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn cron_job_from_row(row: &PgRow) -> StoreResult<CronJob> {
    CronJobRow::from_row(row)
        .map_err(|e| corrupt_row("cron job", e))?
        .try_into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_conversions_saturate() {
        assert_eq!(to_i32(3), 3);
        assert_eq!(to_i32(u32::MAX), i32::MAX);
        assert_eq!(to_secs(Duration::from_secs(90)), 90);
        assert_eq!(to_secs(Duration::MAX), i64::MAX);
    }

    #[test]
    fn non_database_errors_map_to_storage() {
        assert!(matches!(
            map_sqlx_error("claim_next", sqlx::Error::PoolClosed),
            StoreError::Storage(msg) if msg.contains("claim_next")
        ));
        assert!(matches!(
            map_sqlx_error("get_task", sqlx::Error::RowNotFound),
            StoreError::Storage(_)
        ));
    }
}
