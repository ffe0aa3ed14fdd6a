//! Domain error model.

use thiserror::Error;

use crate::task::TaskStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures only (validation, illegal state transitions).
/// Storage and runtime failures belong to `duraq-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. empty subject).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A subject pattern cannot be used for routing.
    #[error("invalid subject pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A cron expression was rejected by the parser.
    #[error("invalid cron expression `{expression}`: {reason}")]
    InvalidCron { expression: String, reason: String },

    /// The requested state transition is not legal from the current status.
    #[error("illegal transition `{action}` from status {from}")]
    InvalidTransition { from: TaskStatus, action: &'static str },

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_pattern(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_cron(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCron {
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_transition(from: TaskStatus, action: &'static str) -> Self {
        Self::InvalidTransition { from, action }
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
