//! `duraq-infra`: storage adapters and background runtime for the task queue.
//!
//! - [`store`]: `TaskStore`/`CronStore` ports with Postgres and in-memory adapters
//! - [`queue`]: publish, ack, nack, requeue and stuck-task cleanup
//! - [`consumer`]: subject-routed consumer pool with a shared concurrency limit
//! - [`scheduler`]: cron scheduler emitting tasks
//! - [`reaper`]: periodic stuck-task cleanup
//! - [`config`]: typed configuration and environment loading

mod background;

pub mod config;
pub mod consumer;
pub mod queue;
pub mod reaper;
pub mod scheduler;
pub mod store;

pub use background::LifecycleError;
pub use config::{ConfigError, ConsumerConfig, DuraqConfig, ReaperConfig, SchedulerConfig};
pub use consumer::{ConsumerPool, HandlerError, PoolError, PoolStats, TaskContext, TaskHandler};
pub use queue::{json_task, Queue, QueueError};
pub use reaper::Reaper;
pub use scheduler::{parse_cron_jobs, Scheduler, SchedulerError};
pub use store::{
    CronStore, FiredCronJob, InMemoryStore, PgStore, StoreError, StoreResult, TaskStats, TaskStore,
};
