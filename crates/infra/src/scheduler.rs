//! Cron scheduler.
//!
//! Each tick claims due active cron jobs with a skip-locked select, advances
//! them, and emits one task per job, all in one store transaction. Several
//! scheduler replicas may run against the same store; each due job is fired
//! by exactly one of them per tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, error, info, warn};

use duraq_core::{CronJob, CronJobSpec, DomainError};

use crate::background::{sleep_or_stop, BackgroundLoop, LifecycleError};
use crate::config::SchedulerConfig;
use crate::store::{CronStore, FiredCronJob, StoreError};

/// Scheduler error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    /// A job definition was rejected; nothing was written.
    #[error("invalid cron job definition: {0}")]
    InvalidJob(#[from] DomainError),
    #[error("failed to parse cron job definitions: {0}")]
    Definitions(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Periodically fires due cron jobs.
pub struct Scheduler {
    store: Arc<dyn CronStore>,
    config: SchedulerConfig,
    background: BackgroundLoop,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("running", &self.background.is_running())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(store: Arc<dyn CronStore>, config: SchedulerConfig) -> Self {
        Self {
            store,
            config,
            background: BackgroundLoop::new("scheduler"),
        }
    }

    /// Register or update jobs by name.
    ///
    /// Every definition is validated before anything is written; one bad
    /// definition rejects the batch.
    pub async fn create_or_update_cron_jobs(
        &self,
        specs: Vec<CronJobSpec>,
    ) -> Result<Vec<CronJob>, SchedulerError> {
        for spec in &specs {
            spec.validate()?;
        }
        let jobs = self.store.upsert_cron_jobs(&specs, Utc::now()).await?;
        for job in &jobs {
            info!(
                cron_job = %job.name,
                expression = %job.expression,
                status = %job.status,
                next_run_at = %job.next_run_at,
                "cron job registered"
            );
        }
        Ok(jobs)
    }

    pub async fn get_cron_job(&self, name: &str) -> Result<Option<CronJob>, SchedulerError> {
        Ok(self.store.get_cron_job(name).await?)
    }

    pub async fn list_cron_jobs(&self) -> Result<Vec<CronJob>, SchedulerError> {
        Ok(self.store.list_cron_jobs().await?)
    }

    /// Run one tick now. Returns the number of jobs fired.
    pub async fn process_cron_jobs(&self) -> Result<usize, SchedulerError> {
        self.process_cron_jobs_at(Utc::now()).await
    }

    /// Run one tick as of `now`.
    pub async fn process_cron_jobs_at(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        tick(self.store.as_ref(), &self.config, now).await
    }

    /// Spawn the tick loop.
    ///
    /// The first tick waits a random jitter in `[0, poll_interval)` so that
    /// replicas started together do not tick in lockstep.
    pub fn start(&mut self) -> Result<(), SchedulerError> {
        let store = self.store.clone();
        let config = self.config.clone();
        self.background.start(move |mut shutdown| async move {
            let jitter = jitter(config.poll_interval);
            debug!(jitter_ms = jitter.as_millis() as u64, "scheduler jitter");
            if sleep_or_stop(&mut shutdown, jitter).await {
                return;
            }
            loop {
                if let Err(e) = tick(store.as_ref(), &config, Utc::now()).await {
                    error!(error = %e, "cron tick failed");
                }
                if sleep_or_stop(&mut shutdown, config.poll_interval).await {
                    break;
                }
            }
        })?;
        Ok(())
    }

    /// Signal the loop and wait for it, bounded by `stop_timeout`.
    pub async fn stop(&mut self) -> Result<(), SchedulerError> {
        self.background.stop(self.config.stop_timeout).await?;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.background.is_running()
    }
}

/// Parse a JSON array of job definitions. Any invalid entry fails the whole
/// document.
pub fn parse_cron_jobs(json: &str) -> Result<Vec<CronJobSpec>, SchedulerError> {
    let specs: Vec<CronJobSpec> =
        serde_json::from_str(json).map_err(|e| SchedulerError::Definitions(e.to_string()))?;
    for spec in &specs {
        spec.validate()?;
    }
    Ok(specs)
}

async fn tick(
    store: &dyn CronStore,
    config: &SchedulerConfig,
    now: DateTime<Utc>,
) -> Result<usize, SchedulerError> {
    let fired = store
        .fire_due_cron_jobs(now, config.batch_size, config.default_max_attempts)
        .await?;
    for FiredCronJob { job, task, exhausted } in &fired {
        info!(
            cron_job = %job.name,
            task_id = %task.id,
            subject = %task.subject,
            next_run_at = %job.next_run_at,
            "cron job fired"
        );
        if *exhausted {
            warn!(cron_job = %job.name, expression = %job.expression, "cron schedule exhausted, job disabled");
        }
    }
    Ok(fired.len())
}

fn jitter(poll_interval: Duration) -> Duration {
    let max_ms = u64::try_from(poll_interval.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, TaskStore};
    use duraq_core::{CronExpression, CronJobStatus, TaskStatus};

    fn spec(name: &str, expression: &str) -> CronJobSpec {
        CronJobSpec::new(
            name,
            CronExpression::parse(expression).unwrap(),
            format!("cron.{name}"),
            name.as_bytes().to_vec(),
        )
    }

    #[tokio::test]
    async fn tick_fires_due_job_once() {
        let store = InMemoryStore::arc();
        let scheduler = Scheduler::new(store.clone(), SchedulerConfig::default());
        let job = scheduler
            .create_or_update_cron_jobs(vec![spec("cleanup", "0 * * * * *")])
            .await
            .unwrap()
            .remove(0);

        let due_at = job.next_run_at;
        assert_eq!(scheduler.process_cron_jobs_at(due_at).await.unwrap(), 1);

        let after = scheduler.get_cron_job("cleanup").await.unwrap().unwrap();
        assert!(after.next_run_at > due_at);
        assert_eq!(after.last_run_at, Some(due_at));

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 1);

        // Same instant again: nothing is due any more.
        assert_eq!(scheduler.process_cron_jobs_at(due_at).await.unwrap(), 0);
        assert_eq!(store.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn emitted_task_copies_subject_and_payload() {
        let store = InMemoryStore::arc();
        let scheduler = Scheduler::new(store.clone(), SchedulerConfig::default());
        let job = scheduler
            .create_or_update_cron_jobs(vec![spec("report", "0 0 * * * *")])
            .await
            .unwrap()
            .remove(0);
        scheduler.process_cron_jobs_at(job.next_run_at).await.unwrap();

        let pattern = duraq_core::SubjectPattern::parse("cron.report").unwrap();
        let task = store.claim_next(&pattern, job.next_run_at).await.unwrap().unwrap();
        assert_eq!(task.payload, b"report".to_vec());
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.max_attempts, 3);
    }

    #[tokio::test]
    async fn disabled_job_emits_nothing() {
        let store = InMemoryStore::arc();
        let scheduler = Scheduler::new(store.clone(), SchedulerConfig::default());
        let job = scheduler
            .create_or_update_cron_jobs(vec![
                spec("paused", "0 * * * * *").with_status(CronJobStatus::Disabled),
            ])
            .await
            .unwrap()
            .remove(0);

        let fired = scheduler
            .process_cron_jobs_at(job.next_run_at + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(fired, 0);
        assert_eq!(store.stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn upsert_updates_in_place() {
        let store = InMemoryStore::arc();
        let scheduler = Scheduler::new(store, SchedulerConfig::default());
        let first = scheduler
            .create_or_update_cron_jobs(vec![spec("sync", "0 * * * * *")])
            .await
            .unwrap()
            .remove(0);
        let second = scheduler
            .create_or_update_cron_jobs(vec![spec("sync", "0 0 * * * *")])
            .await
            .unwrap()
            .remove(0);

        assert_eq!(first.id, second.id);
        assert_eq!(second.expression.as_str(), "0 0 * * * *");
        assert_eq!(second.next_run_at, first.next_run_at);
        assert_eq!(scheduler.list_cron_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_definition_rejects_batch() {
        let store = InMemoryStore::arc();
        let scheduler = Scheduler::new(store, SchedulerConfig::default());
        let mut bad = spec("bad", "0 * * * * *");
        bad.subject = "cron.*".to_string();

        let err = scheduler
            .create_or_update_cron_jobs(vec![spec("good", "0 * * * * *"), bad])
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidJob(_)));
        assert!(scheduler.list_cron_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_task_delay_is_rejected_at_registration() {
        let store = InMemoryStore::arc();
        let scheduler = Scheduler::new(store.clone(), SchedulerConfig::default());
        let slow = spec("slow", "* * * * * *").with_task_run_after(Duration::from_secs(10_000_000_000_000));

        let err = scheduler.create_or_update_cron_jobs(vec![slow]).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidJob(_)));
        assert!(scheduler.list_cron_jobs().await.unwrap().is_empty());

        assert_eq!(scheduler.process_cron_jobs().await.unwrap(), 0);
        assert_eq!(store.stats().await.unwrap().total(), 0);
    }

    #[test]
    fn parse_rejects_document_with_bad_expression() {
        let good = r#"[{"name":"a","expression":"0 * * * * *","subject":"cron.a"}]"#;
        assert_eq!(parse_cron_jobs(good).unwrap().len(), 1);

        let bad = r#"[
            {"name":"a","expression":"0 * * * * *","subject":"cron.a"},
            {"name":"b","expression":"* * * *","subject":"cron.b"}
        ]"#;
        assert!(matches!(parse_cron_jobs(bad), Err(SchedulerError::Definitions(_))));
    }

    #[tokio::test]
    async fn running_scheduler_emits_tasks_and_stops() {
        let store = InMemoryStore::arc();
        // Registered a minute ago so the job is already due.
        store
            .upsert_cron_jobs(
                &[spec("minutely", "* * * * * *")],
                Utc::now() - chrono::Duration::minutes(1),
            )
            .await
            .unwrap();

        let config = SchedulerConfig::default()
            .with_poll_interval(Duration::from_millis(20))
            .with_stop_timeout(Duration::from_secs(1));
        let mut scheduler = Scheduler::new(store.clone(), config);
        scheduler.start().unwrap();
        assert!(matches!(
            scheduler.start(),
            Err(SchedulerError::Lifecycle(LifecycleError::AlreadyRunning(_)))
        ));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.stats().await.unwrap().pending == 0 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_running());
    }

    #[test]
    fn jitter_stays_below_interval() {
        for _ in 0..100 {
            assert!(jitter(Duration::from_millis(50)) < Duration::from_millis(50));
        }
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
    }
}
