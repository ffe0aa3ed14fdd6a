//! Producer and resolution API over a [`TaskStore`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use duraq_core::{DomainError, NackOutcome, NewTask, Task, TaskId};

use crate::store::{StoreError, TaskStats, TaskStore};

/// Queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// A task in the batch was rejected before anything was written.
    #[error("invalid task at index {index}: {source}")]
    InvalidTask {
        index: usize,
        #[source]
        source: DomainError,
    },
    #[error("failed to encode payload: {0}")]
    Encode(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Durable task queue.
///
/// Cheap to clone; clones share the underlying store.
#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn TaskStore>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").finish_non_exhaustive()
    }
}

impl Queue {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub(crate) fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Enqueue a batch atomically.
    ///
    /// Every task is validated first; a single invalid task rejects the
    /// batch and nothing is written.
    pub async fn publish(&self, tasks: Vec<NewTask>) -> Result<Vec<TaskId>, QueueError> {
        for (index, task) in tasks.iter().enumerate() {
            task.validate()
                .map_err(|source| QueueError::InvalidTask { index, source })?;
        }
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let tasks: Vec<Task> = tasks.into_iter().map(|t| Task::new(t, now)).collect();
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();

        self.store.insert_tasks(&tasks).await?;
        debug!(task_count = ids.len(), "tasks published");
        Ok(ids)
    }

    /// Enqueue a single task.
    pub async fn publish_one(&self, task: NewTask) -> Result<TaskId, QueueError> {
        let ids = self.publish(vec![task]).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| QueueError::Store(StoreError::Storage("empty publish result".to_string())))
    }

    /// Mark a running task completed.
    ///
    /// Failures here say nothing about the task itself, so callers log them
    /// rather than feeding them back into retries.
    pub async fn ack(&self, id: TaskId) -> Result<(), QueueError> {
        self.store.complete(id, Utc::now()).await?;
        debug!(task_id = %id, "task acked");
        Ok(())
    }

    /// Record a failed attempt; retries with backoff or parks the task as
    /// failed once attempts are exhausted.
    pub async fn nack(&self, id: TaskId, err: &str) -> Result<NackOutcome, QueueError> {
        let outcome = self.store.fail_attempt(id, err, Utc::now()).await?;
        match outcome {
            NackOutcome::Retry { run_after } => {
                info!(task_id = %id, %run_after, error = %err, "task scheduled for retry");
            }
            NackOutcome::Failed => {
                warn!(task_id = %id, error = %err, "task failed permanently");
            }
        }
        Ok(outcome)
    }

    /// Put a task back without counting a failure.
    pub async fn requeue(&self, id: TaskId) -> Result<(), QueueError> {
        self.store.requeue(id, Utc::now()).await?;
        info!(task_id = %id, "task requeued");
        Ok(())
    }

    /// Reset tasks stuck in running for longer than `timeout`.
    pub async fn cleanup_stuck_tasks(&self, timeout: Duration) -> Result<u64, QueueError> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .filter(|cutoff| *cutoff >= DateTime::UNIX_EPOCH);
        let Some(cutoff) = cutoff else {
            debug!(timeout_secs = timeout.as_secs(), "stuck timeout predates any claim; nothing to reset");
            return Ok(0);
        };
        let reset = self.store.reset_stuck(cutoff, now).await?;
        if reset > 0 {
            warn!(reset, timeout_secs = timeout.as_secs(), "reset stuck tasks");
        }
        Ok(reset)
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<Task>, QueueError> {
        Ok(self.store.get_task(id).await?)
    }

    /// Task counts per status. `failed` is the alerting signal.
    pub async fn stats(&self) -> Result<TaskStats, QueueError> {
        let stats = self.store.stats().await.inspect_err(|e| {
            error!(error = %e, "failed to read queue stats");
        })?;
        Ok(stats)
    }
}

/// Build a task whose payload is `value` encoded as JSON.
pub fn json_task<T: Serialize>(subject: impl Into<String>, value: &T) -> Result<NewTask, QueueError> {
    let payload = serde_json::to_vec(value).map_err(|e| QueueError::Encode(e.to_string()))?;
    Ok(NewTask::new(subject, payload))
}
