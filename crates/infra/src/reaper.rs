//! Stuck-task reaper.
//!
//! A worker that dies mid-handler leaves its task in `running` forever. The
//! reaper periodically resets such tasks to `pending` so another consumer can
//! pick them up. Attempts are not touched.

use std::time::Duration;

use tracing::error;

use crate::background::{sleep_or_stop, BackgroundLoop, LifecycleError};
use crate::config::ReaperConfig;
use crate::queue::{Queue, QueueError};

#[derive(Debug)]
pub struct Reaper {
    queue: Queue,
    config: ReaperConfig,
    background: BackgroundLoop,
}

impl Reaper {
    pub fn new(queue: Queue, config: ReaperConfig) -> Self {
        Self {
            queue,
            config,
            background: BackgroundLoop::new("reaper"),
        }
    }

    /// One pass. Returns the number of tasks reset.
    pub async fn run_once(&self) -> Result<u64, QueueError> {
        self.queue.cleanup_stuck_tasks(self.config.stuck_timeout).await
    }

    pub fn start(&mut self) -> Result<(), LifecycleError> {
        let queue = self.queue.clone();
        let interval = self.config.interval;
        let stuck_timeout: Duration = self.config.stuck_timeout;
        self.background.start(move |mut shutdown| async move {
            loop {
                if let Err(e) = queue.cleanup_stuck_tasks(stuck_timeout).await {
                    error!(error = %e, "stuck task cleanup failed");
                }
                if sleep_or_stop(&mut shutdown, interval).await {
                    break;
                }
            }
        })
    }

    pub async fn stop(&mut self) -> Result<(), LifecycleError> {
        self.background.stop(self.config.stop_timeout).await
    }

    pub fn is_running(&self) -> bool {
        self.background.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, TaskStore};
    use chrono::Utc;
    use duraq_core::{NewTask, Task, TaskStatus};

    fn stuck_task(minutes_ago: i64) -> Task {
        let now = Utc::now();
        let mut task = Task::new(NewTask::new("a.b", vec![]), now);
        task.claim(now - chrono::Duration::minutes(minutes_ago)).unwrap();
        task
    }

    #[tokio::test]
    async fn run_once_resets_old_running_tasks() {
        let store = InMemoryStore::arc();
        let old = stuck_task(11);
        let recent = stuck_task(5);
        store.insert_tasks(&[old.clone(), recent.clone()]).await.unwrap();

        let reaper = Reaper::new(Queue::new(store.clone()), ReaperConfig::default());
        assert_eq!(reaper.run_once().await.unwrap(), 1);
        assert_eq!(reaper.run_once().await.unwrap(), 0);

        assert_eq!(store.get_task(old.id).await.unwrap().unwrap().status, TaskStatus::Pending);
        assert_eq!(store.get_task(recent.id).await.unwrap().unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn background_loop_reaps_and_stops() {
        let store = InMemoryStore::arc();
        let old = stuck_task(30);
        store.insert_tasks(std::slice::from_ref(&old)).await.unwrap();

        let config = ReaperConfig::default()
            .with_interval(Duration::from_millis(20))
            .with_stop_timeout(Duration::from_secs(1));
        let mut reaper = Reaper::new(Queue::new(store.clone()), config);
        reaper.start().unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.get_task(old.id).await.unwrap().unwrap().status != TaskStatus::Pending {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        reaper.stop().await.unwrap();
        assert!(!reaper.is_running());
        assert!(matches!(reaper.stop().await, Err(LifecycleError::NotRunning("reaper"))));
    }
}
