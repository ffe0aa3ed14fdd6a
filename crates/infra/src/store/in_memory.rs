//! In-memory store for tests and development.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use duraq_core::{
    CronJob, CronJobSpec, CronJobStatus, NackOutcome, SubjectPattern, Task, TaskId, TaskStatus,
};

use super::{CronStore, FiredCronJob, StoreError, StoreResult, TaskStats, TaskStore};

#[derive(Debug, Default)]
struct State {
    tasks: HashMap<TaskId, Task>,
    cron_jobs: HashMap<String, CronJob>,
}

/// Both tables behind one mutex, so every operation is atomic and the
/// cron tick can insert tasks in the same critical section.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Storage("in-memory store mutex poisoned".to_string()))
    }

    fn update_task<T>(
        &self,
        id: TaskId,
        apply: impl FnOnce(&mut Task) -> Result<T, duraq_core::DomainError>,
    ) -> StoreResult<T> {
        let mut state = self.lock()?;
        let task = state.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        // Work on a copy so a rejected transition leaves the row untouched.
        let mut next = task.clone();
        let out = apply(&mut next)?;
        *task = next;
        Ok(out)
    }
}

fn insert_all(state: &mut State, tasks: &[Task]) -> StoreResult<()> {
    let mut seen = std::collections::HashSet::with_capacity(tasks.len());
    for task in tasks {
        if state.tasks.contains_key(&task.id) || !seen.insert(task.id) {
            return Err(StoreError::Conflict(format!("task {} already exists", task.id)));
        }
        if task.subject.is_empty() {
            return Err(StoreError::Constraint(format!("task {} has an empty subject", task.id)));
        }
    }
    for task in tasks {
        state.tasks.insert(task.id, task.clone());
    }
    Ok(())
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn insert_tasks(&self, tasks: &[Task]) -> StoreResult<()> {
        let mut state = self.lock()?;
        insert_all(&mut state, tasks)
    }

    async fn get_task(&self, id: TaskId) -> StoreResult<Option<Task>> {
        Ok(self.lock()?.tasks.get(&id).cloned())
    }

    async fn claim_next(
        &self,
        pattern: &SubjectPattern,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Task>> {
        let mut state = self.lock()?;
        let next = state
            .tasks
            .values()
            .filter(|task| task.is_due(now) && pattern.matches(&task.subject))
            .min_by_key(|task| (task.run_after, task.id))
            .map(|task| task.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let task = state.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        task.claim(now)?;
        Ok(Some(task.clone()))
    }

    async fn complete(&self, id: TaskId, now: DateTime<Utc>) -> StoreResult<()> {
        self.update_task(id, |task| task.complete(now))
    }

    async fn fail_attempt(
        &self,
        id: TaskId,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<NackOutcome> {
        self.update_task(id, |task| task.fail_attempt(error, now))
    }

    async fn requeue(&self, id: TaskId, now: DateTime<Utc>) -> StoreResult<()> {
        self.update_task(id, |task| task.requeue(now))
    }

    async fn reset_stuck(&self, older_than: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.lock()?;
        let mut reset = 0;
        for task in state.tasks.values_mut().filter(|task| task.is_stuck(older_than)) {
            task.reset_stuck(now)?;
            reset += 1;
        }
        Ok(reset)
    }

    async fn stats(&self) -> StoreResult<TaskStats> {
        let state = self.lock()?;
        let mut stats = TaskStats::default();
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl CronStore for InMemoryStore {
    async fn upsert_cron_jobs(
        &self,
        specs: &[CronJobSpec],
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<CronJob>> {
        for spec in specs {
            spec.validate()?;
        }

        let mut state = self.lock()?;
        let mut jobs = Vec::with_capacity(specs.len());
        for spec in specs {
            let job = match state.cron_jobs.get_mut(&spec.name) {
                Some(existing) => {
                    existing.apply(spec.clone(), now);
                    existing.clone()
                }
                None => {
                    let job = CronJob::new(spec.clone(), now);
                    state.cron_jobs.insert(job.name.clone(), job.clone());
                    job
                }
            };
            jobs.push(job);
        }
        Ok(jobs)
    }

    async fn get_cron_job(&self, name: &str) -> StoreResult<Option<CronJob>> {
        Ok(self.lock()?.cron_jobs.get(name).cloned())
    }

    async fn list_cron_jobs(&self) -> StoreResult<Vec<CronJob>> {
        let mut jobs: Vec<CronJob> = self.lock()?.cron_jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }

    async fn fire_due_cron_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        max_attempts: u32,
    ) -> StoreResult<Vec<FiredCronJob>> {
        let mut state = self.lock()?;

        let mut due: Vec<&CronJob> = state
            .cron_jobs
            .values()
            .filter(|job| job.status == CronJobStatus::Active && job.next_run_at <= now)
            .collect();
        due.sort_by_key(|job| job.next_run_at);
        let names: Vec<String> = due.into_iter().take(limit).map(|job| job.name.clone()).collect();

        let mut advanced = Vec::with_capacity(names.len());
        for name in &names {
            let Some(job) = state.cron_jobs.get(name) else {
                continue;
            };
            let mut job = job.clone();
            let tick = job.fire(now, max_attempts)?;
            advanced.push(FiredCronJob {
                job,
                task: tick.task,
                exhausted: tick.exhausted,
            });
        }

        let tasks: Vec<Task> = advanced.iter().map(|fired| fired.task.clone()).collect();
        insert_all(&mut state, &tasks)?;
        for fired in &advanced {
            state.cron_jobs.insert(fired.job.name.clone(), fired.job.clone());
        }
        Ok(advanced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duraq_core::{CronExpression, NewTask};

    fn pattern(p: &str) -> SubjectPattern {
        SubjectPattern::parse(p).unwrap()
    }

    #[tokio::test]
    async fn claim_picks_oldest_due_matching_task() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let old = Task::new(NewTask::new("a.one", vec![]).run_after(now - chrono::Duration::seconds(30)), now);
        let new = Task::new(NewTask::new("a.two", vec![]).run_after(now - chrono::Duration::seconds(5)), now);
        let other = Task::new(NewTask::new("b.one", vec![]).run_after(now - chrono::Duration::seconds(60)), now);
        let future = Task::new(NewTask::new("a.three", vec![]).run_after(now + chrono::Duration::seconds(60)), now);
        store
            .insert_tasks(&[new.clone(), old.clone(), other, future])
            .await
            .unwrap();

        let claimed = store.claim_next(&pattern("a.*"), now).await.unwrap().unwrap();
        assert_eq!(claimed.id, old.id);
        assert_eq!(claimed.status, TaskStatus::Running);
        assert_eq!(claimed.last_attempt, Some(now));

        let claimed = store.claim_next(&pattern("a.*"), now).await.unwrap().unwrap();
        assert_eq!(claimed.id, new.id);

        assert!(store.claim_next(&pattern("a.*"), now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_with_duplicate_is_rejected_whole() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let first = Task::new(NewTask::new("a.b", vec![1]), now);
        let third = Task::new(NewTask::new("a.b", vec![3]), now);

        let err = store
            .insert_tasks(&[first.clone(), first.clone(), third.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(store.get_task(first.id).await.unwrap().is_none());
        assert!(store.get_task(third.id).await.unwrap().is_none());
        assert_eq!(store.stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn rejected_transition_leaves_row_untouched() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let task = Task::new(NewTask::new("a.b", vec![]), now);
        store.insert_tasks(std::slice::from_ref(&task)).await.unwrap();

        let err = store.complete(task.id, now).await.unwrap_err();
        assert!(matches!(err, StoreError::Domain(_)));
        assert_eq!(store.get_task(task.id).await.unwrap().unwrap(), task);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let store = InMemoryStore::new();
        let id = TaskId::new();
        assert!(matches!(
            store.complete(id, Utc::now()).await,
            Err(StoreError::TaskNotFound(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn cron_fire_respects_limit_and_order() {
        let store = InMemoryStore::new();
        let created = Utc::now() - chrono::Duration::minutes(5);
        let every_second = CronExpression::parse("* * * * * *").unwrap();
        let specs: Vec<CronJobSpec> = ["a", "b", "c"]
            .iter()
            .map(|name| CronJobSpec::new(*name, every_second.clone(), format!("cron.{name}"), vec![]))
            .collect();
        store.upsert_cron_jobs(&specs, created).await.unwrap();

        let now = Utc::now();
        let fired = store.fire_due_cron_jobs(now, 2, 3).await.unwrap();
        assert_eq!(fired.len(), 2);
        assert_eq!(store.stats().await.unwrap().pending, 2);

        let fired = store.fire_due_cron_jobs(now, 10, 3).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert!(store.fire_due_cron_jobs(now, 10, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_rejects_unroutable_subject_and_oversized_delay() {
        let store = InMemoryStore::new();
        let every_minute = CronExpression::parse("0 * * * * *").unwrap();
        let wildcard = CronJobSpec::new("wild", every_minute.clone(), "cron.*", vec![]);
        let slow = CronJobSpec::new("slow", every_minute, "cron.slow", vec![])
            .with_task_run_after(std::time::Duration::from_secs(10_000_000_000_000));

        for spec in [wildcard, slow] {
            let err = store.upsert_cron_jobs(&[spec], Utc::now()).await.unwrap_err();
            assert!(matches!(err, StoreError::Domain(_)));
        }
        assert!(store.list_cron_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn never_firing_job_is_stored_disabled() {
        let store = InMemoryStore::new();
        let feb30 = CronExpression::parse("0 0 0 30 2 *").unwrap();
        let jobs = store
            .upsert_cron_jobs(&[CronJobSpec::new("feb30", feb30, "cron.feb30", vec![])], Utc::now())
            .await
            .unwrap();
        assert_eq!(jobs[0].status, CronJobStatus::Disabled);

        let later = Utc::now() + chrono::Duration::days(400);
        assert!(store.fire_due_cron_jobs(later, 10, 3).await.unwrap().is_empty());
        assert_eq!(store.stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn exhausted_job_fires_once_and_is_disabled() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut job = CronJob::new(
            CronJobSpec::new("last", CronExpression::parse("0 0 0 30 2 *").unwrap(), "cron.last", vec![]),
            now,
        );
        // Stored while its schedule still had one fire left.
        job.status = CronJobStatus::Active;
        job.next_run_at = now - chrono::Duration::minutes(1);
        store.lock().unwrap().cron_jobs.insert(job.name.clone(), job);

        let fired = store.fire_due_cron_jobs(now, 10, 3).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert!(fired[0].exhausted);
        assert_eq!(fired[0].job.status, CronJobStatus::Disabled);

        let stored = store.get_cron_job("last").await.unwrap().unwrap();
        assert_eq!(stored.status, CronJobStatus::Disabled);
        assert_eq!(stored.last_run_at, Some(now));
        assert_eq!(store.stats().await.unwrap().pending, 1);
        assert!(store.fire_due_cron_jobs(now + chrono::Duration::days(1), 10, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_fire_leaves_store_usable() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut job = CronJob::new(
            CronJobSpec::new("slow", CronExpression::parse("0 * * * * *").unwrap(), "cron.slow", vec![]),
            now - chrono::Duration::minutes(5),
        );
        job.task_run_after = std::time::Duration::from_secs(10_000_000_000_000);
        store.lock().unwrap().cron_jobs.insert(job.name.clone(), job);

        let err = store.fire_due_cron_jobs(now, 10, 3).await.unwrap_err();
        assert!(matches!(err, StoreError::Domain(_)));
        assert_eq!(store.stats().await.unwrap().total(), 0);
        assert!(store.insert_tasks(&[Task::new(NewTask::new("a.b", vec![]), now)]).await.is_ok());
    }
}
