//! Recurring cron jobs.
//!
//! A cron job is registered by name and fires on a six-field schedule
//! (`sec min hour day-of-month month day-of-week`). Every fire emits one task
//! carrying the job's subject and payload.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::CronJobId;
use crate::subject::validate_subject;
use crate::task::{delay_from, NewTask, Task, MAX_DELAY};

const CRON_FIELDS: usize = 6;

/// A validated six-field cron expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronExpression {
    source: String,
    schedule: ::cron::Schedule,
}

impl CronExpression {
    pub fn parse(expression: impl Into<String>) -> DomainResult<Self> {
        let source = expression.into();
        let fields = source.split_whitespace().count();
        if fields != CRON_FIELDS {
            return Err(DomainError::invalid_cron(
                source,
                format!("expected {CRON_FIELDS} fields, found {fields}"),
            ));
        }
        let schedule = ::cron::Schedule::from_str(&source)
            .map_err(|e| DomainError::invalid_cron(source.clone(), e.to_string()))?;
        Ok(Self { source, schedule })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First fire time strictly after `after`, if the schedule has one.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl PartialEq for CronExpression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for CronExpression {}

impl core::fmt::Display for CronExpression {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.source)
    }
}

impl TryFrom<String> for CronExpression {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<CronExpression> for String {
    fn from(value: CronExpression) -> Self {
        value.source
    }
}

impl FromStr for CronExpression {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronJobStatus {
    #[default]
    Active,
    /// Sticky; never claimed by a scheduler tick.
    Disabled,
}

impl CronJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CronJobStatus::Active => "active",
            CronJobStatus::Disabled => "disabled",
        }
    }
}

impl core::fmt::Display for CronJobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CronJobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(CronJobStatus::Active),
            "disabled" => Ok(CronJobStatus::Disabled),
            other => Err(DomainError::validation(format!(
                "unknown cron job status `{other}`"
            ))),
        }
    }
}

/// Registration input for a cron job, keyed by `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronJobSpec {
    pub name: String,
    pub expression: CronExpression,
    #[serde(default)]
    pub status: CronJobStatus,
    pub subject: String,
    #[serde(default)]
    pub payload: Vec<u8>,
    /// Delay applied to each emitted task.
    #[serde(default)]
    pub task_run_after: Duration,
}

impl CronJobSpec {
    pub fn new(
        name: impl Into<String>,
        expression: CronExpression,
        subject: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            name: name.into(),
            expression,
            status: CronJobStatus::Active,
            subject: subject.into(),
            payload: payload.into(),
            task_run_after: Duration::ZERO,
        }
    }

    pub fn with_status(mut self, status: CronJobStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_task_run_after(mut self, delay: Duration) -> Self {
        self.task_run_after = delay;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("cron job name must not be empty"));
        }
        if self.task_run_after > MAX_DELAY {
            return Err(DomainError::validation(format!(
                "cron job `{}` task_run_after of {}s exceeds the {}s limit",
                self.name,
                self.task_run_after.as_secs(),
                MAX_DELAY.as_secs()
            )));
        }
        validate_subject(&self.subject)
    }
}

/// Persisted cron job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronJob {
    pub id: CronJobId,
    pub name: String,
    pub expression: CronExpression,
    pub status: CronJobStatus,
    pub subject: String,
    pub payload: Vec<u8>,
    pub task_run_after: Duration,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of firing a due job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronTick {
    pub task: Task,
    /// The schedule has no further fire time; the job was disabled.
    pub exhausted: bool,
}

impl CronJob {
    /// Register a new job. A schedule with no future fire registers disabled.
    pub fn new(spec: CronJobSpec, now: DateTime<Utc>) -> Self {
        let next = spec.expression.next_after(now);
        let status = if next.is_some() {
            spec.status
        } else {
            CronJobStatus::Disabled
        };
        Self {
            id: CronJobId::new(),
            name: spec.name,
            expression: spec.expression,
            status,
            subject: spec.subject,
            payload: spec.payload,
            task_run_after: spec.task_run_after,
            next_run_at: next.unwrap_or(now),
            last_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the definition while keeping id and run history.
    ///
    /// As with [`CronJob::new`], an expression with no future fire disables
    /// the job.
    pub fn apply(&mut self, spec: CronJobSpec, now: DateTime<Utc>) {
        self.status = if spec.expression.next_after(now).is_some() {
            spec.status
        } else {
            CronJobStatus::Disabled
        };
        self.expression = spec.expression;
        self.subject = spec.subject;
        self.payload = spec.payload;
        self.task_run_after = spec.task_run_after;
        self.updated_at = now;
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == CronJobStatus::Active && self.next_run_at <= now
    }

    /// Advance the schedule past `now` and build the task for this fire.
    pub fn fire(&mut self, now: DateTime<Utc>, max_attempts: u32) -> DomainResult<CronTick> {
        if !self.is_due(now) {
            return Err(DomainError::validation(format!(
                "cron job `{}` is not due",
                self.name
            )));
        }
        // Checked before any state changes so a rejected fire leaves the job as is.
        let run_after = delay_from(now, self.task_run_after)?;

        let exhausted = match self.expression.next_after(now) {
            Some(next) => {
                self.next_run_at = next;
                false
            }
            None => {
                self.status = CronJobStatus::Disabled;
                true
            }
        };
        self.last_run_at = Some(now);
        self.updated_at = now;

        let new = NewTask::new(self.subject.clone(), self.payload.clone())
            .run_after(run_after)
            .max_attempts(max_attempts);

        Ok(CronTick {
            task: Task::new(new, now),
            exhausted,
        })
    }
}
