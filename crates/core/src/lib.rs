//! `duraq-core`: domain model of the durable task queue.
//!
//! This crate contains **pure domain** logic (no storage, no runtime): task and
//! cron job records, their state transitions, retry backoff, and subject
//! routing. Storage adapters and background loops live in `duraq-infra`.

pub mod backoff;
pub mod cron;
pub mod error;
pub mod id;
pub mod subject;
pub mod task;

pub use backoff::{backoff, BACKOFF_BASE, BACKOFF_CAP, REQUEUE_DELAY};
pub use crate::cron::{CronExpression, CronJob, CronJobSpec, CronJobStatus, CronTick};
pub use error::{DomainError, DomainResult};
pub use id::{CronJobId, TaskId};
pub use subject::{match_subject, validate_subject, SubjectPattern};
pub use task::{
    delay_from, NackOutcome, NewTask, Task, TaskStatus, DEFAULT_MAX_ATTEMPTS, MAX_DELAY,
};
