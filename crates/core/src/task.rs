//! Task record and its state machine.
//!
//! Legal transitions:
//!
//! ```text
//! Pending --claim--> Running --ack--> Completed
//!                       |
//!                       +--nack--> Pending (retry, backoff) | Failed (exhausted)
//!                       +--requeue--> Pending (attempt undone)
//!                       +--reset_stuck--> Pending (crash recovery)
//! ```
//!
//! `Completed` and `Failed` are terminal.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backoff::{backoff, REQUEUE_DELAY};
use crate::error::{DomainError, DomainResult};
use crate::id::TaskId;
use crate::subject::validate_subject;

/// Attempts granted to a task when the producer does not choose.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Longest delay a task may be scheduled ahead by.
pub const MAX_DELAY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// `at + delay`, rejecting delays above [`MAX_DELAY`].
pub fn delay_from(at: DateTime<Utc>, delay: Duration) -> DomainResult<DateTime<Utc>> {
    if delay > MAX_DELAY {
        return Err(DomainError::validation(format!(
            "delay of {}s exceeds the {}s limit",
            delay.as_secs(),
            MAX_DELAY.as_secs()
        )));
    }
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .ok_or_else(|| DomainError::validation(format!("{at} plus {delay:?} is out of range")))
}

/// Task execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting until `run_after` to be claimed.
    Pending,
    /// Claimed by a consumer.
    Running,
    /// Handler succeeded.
    Completed,
    /// Attempts exhausted; parked for inspection.
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(DomainError::validation(format!("unknown task status `{other}`"))),
        }
    }
}

/// A task as submitted by a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub subject: String,
    pub payload: Vec<u8>,
    /// Earliest eligible time; `None` means immediately.
    pub run_after: Option<DateTime<Utc>>,
    pub max_attempts: u32,
}

impl NewTask {
    pub fn new(subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            run_after: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Do not run before `at`.
    pub fn run_after(mut self, at: DateTime<Utc>) -> Self {
        self.run_after = Some(at);
        self
    }

    /// Do not run before `delay` has elapsed from now.
    pub fn delayed(self, delay: Duration) -> DomainResult<Self> {
        let at = delay_from(Utc::now(), delay)?;
        Ok(self.run_after(at))
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        validate_subject(&self.subject)?;
        if let Some(at) = self.run_after {
            let latest = delay_from(Utc::now(), MAX_DELAY)?;
            if at > latest {
                return Err(DomainError::validation(format!(
                    "run_after {at} is more than {}s ahead",
                    MAX_DELAY.as_secs()
                )));
            }
        }
        Ok(())
    }
}

/// What a failed attempt resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Scheduled for another attempt.
    Retry { run_after: DateTime<Utc> },
    /// Attempts exhausted.
    Failed,
}

/// A durable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub subject: String,
    pub status: TaskStatus,
    pub run_after: DateTime<Utc>,
    pub payload: Vec<u8>,
    pub max_attempts: u32,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Materialize a submitted task. Validation is the caller's job.
    pub fn new(new: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            subject: new.subject,
            status: TaskStatus::Pending,
            run_after: new.run_after.unwrap_or(now),
            payload: new.payload,
            max_attempts: new.max_attempts,
            attempts: 0,
            last_error: None,
            last_attempt: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pending and eligible at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.run_after <= now
    }

    /// Running with a last attempt older than `cutoff`.
    pub fn is_stuck(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Running && self.last_attempt.is_some_and(|at| at < cutoff)
    }

    /// Pending → Running.
    pub fn claim(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != TaskStatus::Pending {
            return Err(DomainError::invalid_transition(self.status, "claim"));
        }
        self.status = TaskStatus::Running;
        self.last_attempt = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Running → Completed.
    pub fn complete(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != TaskStatus::Running {
            return Err(DomainError::invalid_transition(self.status, "ack"));
        }
        self.status = TaskStatus::Completed;
        self.updated_at = now;
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// With attempts left the task goes back to Pending after
    /// `backoff(attempts)`, counted after the increment; otherwise it is
    /// parked as Failed.
    pub fn fail_attempt(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> DomainResult<NackOutcome> {
        if self.status != TaskStatus::Running {
            return Err(DomainError::invalid_transition(self.status, "nack"));
        }
        self.last_error = Some(error.into());
        self.updated_at = now;

        if self.attempts >= self.max_attempts {
            self.status = TaskStatus::Failed;
            return Ok(NackOutcome::Failed);
        }

        self.attempts += 1;
        self.status = TaskStatus::Pending;
        self.run_after = later(self.run_after, now + to_chrono(backoff(self.attempts)));
        Ok(NackOutcome::Retry {
            run_after: self.run_after,
        })
    }

    /// Put the task back without counting a failure.
    ///
    /// Undoes one logical attempt and delays the next run by
    /// [`REQUEUE_DELAY`].
    pub fn requeue(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::invalid_transition(self.status, "requeue"));
        }
        self.status = TaskStatus::Pending;
        self.attempts = self.attempts.saturating_sub(1);
        self.run_after = later(self.run_after, now + to_chrono(REQUEUE_DELAY));
        self.updated_at = now;
        Ok(())
    }

    /// Running → Pending after a worker vanished. Attempts are untouched.
    pub fn reset_stuck(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != TaskStatus::Running {
            return Err(DomainError::invalid_transition(self.status, "reset_stuck"));
        }
        self.status = TaskStatus::Pending;
        self.run_after = later(self.run_after, now);
        self.updated_at = now;
        Ok(())
    }
}

fn later(a: DateTime<Utc>, b: DateTime<Utc>) -> DateTime<Utc> {
    if a > b { a } else { b }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
