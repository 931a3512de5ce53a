//! Error types for lifeline-heartbeat.

use lifeline_cells::GroupError;
use thiserror::Error;

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown check-in interval {0:?}")]
    UnknownInterval(String),
}

/// Rejected daily check-in answers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoreError {
    #[error("unknown question {0:?}")]
    UnknownQuestion(String),

    #[error("answer {value} to {question_id:?} is outside {min}..={max}")]
    OutOfRange {
        question_id: String,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// A failed webhook attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("webhook returned status {0}")]
    Status(u16),

    #[error("escalation is disabled or has no webhook")]
    Disabled,
}

/// Errors surfaced by the coordinator.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Score(#[from] ScoreError),

    #[error(transparent)]
    Group(#[from] GroupError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
