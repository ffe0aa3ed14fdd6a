//! Storage ports for tasks and cron jobs.
//!
//! Every mutation is a single locked read-modify-write (or a single
//! transaction for batches), so adapters are safe to share between any
//! number of consumers, schedulers and reapers, in one process or many.

mod in_memory;
mod postgres;

pub use in_memory::InMemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use duraq_core::{
    CronJob, CronJobSpec, DomainError, NackOutcome, SubjectPattern, Task, TaskId,
};

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    /// Unique key collision (duplicate task id, concurrent insert).
    #[error("conflict: {0}")]
    Conflict(String),
    /// A row violated a storage constraint.
    #[error("constraint violation: {0}")]
    Constraint(String),
    /// The requested transition is not legal for the stored row.
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Task counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

impl TaskStats {
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.completed + self.failed
    }
}

/// One cron job fired by a scheduler tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredCronJob {
    /// Job state after advancing.
    pub job: CronJob,
    /// Task emitted for this fire.
    pub task: Task,
    /// No further fire time; the job is now disabled.
    pub exhausted: bool,
}

/// Task persistence.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a batch. Either every task persists or none does.
    async fn insert_tasks(&self, tasks: &[Task]) -> StoreResult<()>;

    async fn get_task(&self, id: TaskId) -> StoreResult<Option<Task>>;

    /// Claim the oldest due pending task whose subject matches `pattern`.
    ///
    /// The claim flips it to running and stamps `last_attempt`. Rows locked
    /// by another claimant are skipped, never waited on.
    async fn claim_next(
        &self,
        pattern: &SubjectPattern,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Task>>;

    /// Running → completed.
    async fn complete(&self, id: TaskId, now: DateTime<Utc>) -> StoreResult<()>;

    /// Record a failed attempt under a row lock.
    async fn fail_attempt(
        &self,
        id: TaskId,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<NackOutcome>;

    /// Back to pending with one attempt undone.
    async fn requeue(&self, id: TaskId, now: DateTime<Utc>) -> StoreResult<()>;

    /// Reset running tasks last attempted before `older_than`. Returns the
    /// number of rows reset.
    async fn reset_stuck(&self, older_than: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<u64>;

    async fn stats(&self) -> StoreResult<TaskStats>;
}

/// Cron job persistence.
#[async_trait]
pub trait CronStore: Send + Sync {
    /// Upsert by name. Existing jobs keep their id and run history.
    async fn upsert_cron_jobs(
        &self,
        specs: &[CronJobSpec],
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<CronJob>>;

    async fn get_cron_job(&self, name: &str) -> StoreResult<Option<CronJob>>;

    async fn list_cron_jobs(&self) -> StoreResult<Vec<CronJob>>;

    /// Claim up to `limit` due active jobs, advance them, and insert one task
    /// per job, all in one transaction.
    ///
    /// Emitted tasks bypass `Queue::publish`: subject and delay were checked
    /// by `CronJobSpec::validate` in `upsert_cron_jobs`.
    async fn fire_due_cron_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        max_attempts: u32,
    ) -> StoreResult<Vec<FiredCronJob>>;
}
