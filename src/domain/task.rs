//! Activity tasks and their typed failures.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Deterministic task correlation id: the position of the request within
/// the orchestration's replay (the first requested task is 0).
pub type TaskId = u64;

/// Outcome of one activity execution
pub type TaskResult = Result<Value, TaskFailure>;

/// A scheduled unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTask {
    /// Correlation id within the instance
    pub task_id: TaskId,

    /// Registered activity name
    pub activity_name: String,

    /// Input passed to the activity
    pub input: Value,
}

impl ActivityTask {
    pub fn new(task_id: TaskId, activity_name: impl Into<String>, input: Value) -> Self {
        Self {
            task_id,
            activity_name: activity_name.into(),
            input,
        }
    }
}

/// Classification of an activity failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transport or infrastructure error, worth retrying
    Transient,

    /// An attempt exceeded its time budget
    Timeout,

    /// The activity rejected the request; retrying will not help
    Business,

    /// No activity is registered under the requested name
    NotRegistered,

    /// Input or output could not be (de)serialized
    Payload,
}

impl FailureKind {
    /// Whether the executor retries failures of this kind
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }
}

/// A typed activity failure, surfaced to orchestrations as a value.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Business, message)
    }

    pub fn not_registered(activity: &str) -> Self {
        Self::new(
            FailureKind::NotRegistered,
            format!("No activity registered as '{}'", activity),
        )
    }

    pub fn payload(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Payload, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}
