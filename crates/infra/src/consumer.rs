//! Consumer pool.
//!
//! Each registration binds one subject pattern to one handler and gets its
//! own poll loop. Every handler invocation, across all registrations, first
//! takes a permit from one shared semaphore, so the number of handlers
//! running at once never exceeds `max_concurrency`.
//!
//! Shutdown is two-phase: the poll loops stop claiming, then `stop` waits
//! (bounded by `shutdown_timeout`) until every in-flight handler has resolved
//! its task.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use duraq_core::{DomainError, NackOutcome, SubjectPattern, Task, TaskId};

use crate::config::ConsumerConfig;
use crate::queue::Queue;

/// What a handler knows about the task it is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub subject: String,
    /// Failed attempts so far.
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_after: DateTime<Utc>,
}

impl From<&Task> for TaskContext {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            subject: task.subject.clone(),
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            run_after: task.run_after,
        }
    }
}

/// Handler outcome other than success.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Counts as a failed attempt; the task is nacked.
    #[error("{0}")]
    Failed(String),
    /// Put the task back without counting a failure.
    #[error("requeue requested: {0}")]
    Requeue(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn requeue(reason: impl Into<String>) -> Self {
        Self::Requeue(reason.into())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

/// Task handler.
///
/// Implemented for any `Fn(TaskContext, Vec<u8>) -> impl Future` closure.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: TaskContext, payload: Vec<u8>) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(TaskContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: TaskContext, payload: Vec<u8>) -> Result<(), HandlerError> {
        (self)(ctx, payload).await
    }
}

/// Consumer pool error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    InvalidPattern(#[from] DomainError),
    #[error("consumer pool already started")]
    AlreadyStarted,
    #[error("consumer pool is not running")]
    NotRunning,
    #[error("in-flight handlers did not finish within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub requeued: u64,
    pub ack_failures: u64,
    pub nack_failures: u64,
    pub in_flight: usize,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
    ack_failures: AtomicU64,
    nack_failures: AtomicU64,
    in_flight: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            nack_failures: self.nack_failures.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
struct Registration {
    pattern: SubjectPattern,
    handler: Arc<dyn TaskHandler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Pool of subject consumers sharing one concurrency limit.
pub struct ConsumerPool {
    queue: Queue,
    config: ConsumerConfig,
    registrations: Vec<Registration>,
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
    shutdown: Option<watch::Sender<bool>>,
    loops: Vec<JoinHandle<()>>,
    lifecycle: Lifecycle,
}

impl ConsumerPool {
    pub fn new(queue: Queue, config: ConsumerConfig) -> Self {
        let permits = config.max_concurrency.max(1);
        Self {
            queue,
            config,
            registrations: Vec::new(),
            semaphore: Arc::new(Semaphore::new(permits)),
            counters: Arc::new(Counters::default()),
            shutdown: None,
            loops: Vec::new(),
            lifecycle: Lifecycle::Idle,
        }
    }

    /// Bind `pattern` to `handler`. Only allowed before [`start`](Self::start).
    pub fn register(
        &mut self,
        pattern: &str,
        handler: impl TaskHandler,
    ) -> Result<(), PoolError> {
        if self.lifecycle != Lifecycle::Idle {
            return Err(PoolError::AlreadyStarted);
        }
        let pattern = SubjectPattern::parse(pattern)?;
        debug!(%pattern, "consumer registered");
        self.registrations.push(Registration {
            pattern,
            handler: Arc::new(handler),
        });
        Ok(())
    }

    /// Spawn one poll loop per registration.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.lifecycle != Lifecycle::Idle {
            return Err(PoolError::AlreadyStarted);
        }
        if self.registrations.is_empty() {
            warn!("consumer pool started with no registrations");
        }

        let (tx, rx) = watch::channel(false);
        for registration in &self.registrations {
            let unit = ConsumerLoop {
                registration: registration.clone(),
                queue: self.queue.clone(),
                semaphore: self.semaphore.clone(),
                counters: self.counters.clone(),
                poll_interval: self.config.poll_interval,
            };
            self.loops.push(tokio::spawn(unit.run(rx.clone())));
        }
        self.shutdown = Some(tx);
        self.lifecycle = Lifecycle::Running;

        info!(
            consumers = self.registrations.len(),
            max_concurrency = self.config.max_concurrency,
            "consumer pool started"
        );
        Ok(())
    }

    /// Stop claiming, then wait for in-flight handlers.
    pub async fn stop(&mut self) -> Result<(), PoolError> {
        if self.lifecycle != Lifecycle::Running {
            return Err(PoolError::NotRunning);
        }
        self.lifecycle = Lifecycle::Stopped;

        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        let loops = std::mem::take(&mut self.loops);
        let semaphore = self.semaphore.clone();
        let permits = u32::try_from(self.config.max_concurrency.max(1)).unwrap_or(u32::MAX);

        let drain = async move {
            for handle in loops {
                if let Err(e) = handle.await {
                    error!(error = %e, "consumer loop terminated abnormally");
                }
            }
            // Every in-flight handler holds a permit until its task is resolved.
            let _all = semaphore.acquire_many(permits).await;
        };

        match tokio::time::timeout(self.config.shutdown_timeout, drain).await {
            Ok(()) => {
                info!(stats = ?self.stats(), "consumer pool stopped");
                Ok(())
            }
            Err(_) => {
                let stats = self.stats();
                error!(in_flight = stats.in_flight, "consumer pool shutdown timed out");
                Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout))
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }
}

struct ConsumerLoop {
    registration: Registration,
    queue: Queue,
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
    poll_interval: Duration,
}

impl ConsumerLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let pattern = self.registration.pattern.clone();
        info!(%pattern, "consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.queue.store().claim_next(&pattern, Utc::now()).await {
                Ok(Some(task)) => {
                    debug!(task_id = %task.id, subject = %task.subject, "task claimed");
                    self.dispatch(task, permit);
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    error!(%pattern, error = %e, "failed to claim task");
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!(%pattern, "consumer stopped");
    }

    fn dispatch(&self, task: Task, permit: OwnedSemaphorePermit) {
        let handler = self.registration.handler.clone();
        let queue = self.queue.clone();
        let counters = self.counters.clone();

        tokio::spawn(async move {
            let _permit = permit;
            counters.in_flight.fetch_add(1, Ordering::Relaxed);

            let ctx = TaskContext::from(&task);
            let id = task.id;
            // Run the handler in its own task so a panic is caught as a JoinError.
            let outcome = match tokio::spawn(async move { handler.handle(ctx, task.payload).await }).await {
                Ok(outcome) => outcome,
                Err(join_err) => Err(HandlerError::failed(panic_message(join_err))),
            };

            resolve(&queue, &counters, id, outcome).await;
            counters.in_flight.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

async fn resolve(queue: &Queue, counters: &Counters, id: TaskId, outcome: Result<(), HandlerError>) {
    counters.processed.fetch_add(1, Ordering::Relaxed);
    match outcome {
        Ok(()) => match queue.ack(id).await {
            Ok(()) => {
                counters.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.ack_failures.fetch_add(1, Ordering::Relaxed);
                error!(task_id = %id, error = %e, "failed to ack task");
            }
        },
        Err(HandlerError::Requeue(reason)) => match queue.requeue(id).await {
            Ok(()) => {
                counters.requeued.fetch_add(1, Ordering::Relaxed);
                debug!(task_id = %id, %reason, "handler requested requeue");
            }
            Err(e) => {
                counters.nack_failures.fetch_add(1, Ordering::Relaxed);
                error!(task_id = %id, error = %e, "failed to requeue task");
            }
        },
        Err(HandlerError::Failed(message)) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            match queue.nack(id, &message).await {
                Ok(NackOutcome::Retry { .. }) | Ok(NackOutcome::Failed) => {}
                Err(e) => {
                    counters.nack_failures.fetch_add(1, Ordering::Relaxed);
                    error!(task_id = %id, error = %e, "failed to nack task");
                }
            }
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "handler cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("handler panicked: {msg}")
    } else {
        "handler panicked".to_string()
    }
}
