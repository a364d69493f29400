//! History events for the durable orchestration engine.
//!
//! Every change to an orchestration instance is recorded as an immutable
//! event in a per-instance, append-only history. The state of an instance
//! is never stored anywhere else: it is rebuilt by replaying these events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::task::{TaskFailure, TaskId};

/// A single entry in an instance's history.
///
/// `sequence` is monotonic per instance and starts at 1. Task events carry
/// a `task_id` that correlates a `TaskScheduled` with its single
/// `TaskCompleted` or `TaskFailed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Position of this event in the instance history (1-based)
    pub sequence: u64,

    /// When this event was recorded
    pub timestamp: DateTime<Utc>,

    /// The orchestration instance this event belongs to
    pub instance_id: String,

    /// Type of event
    pub kind: EventKind,

    /// Task correlation id (task events only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,

    /// Activity name for task events, orchestrator name for `OrchestratorStarted`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Event payload: orchestration input, task input, task output or result
    #[serde(default)]
    pub payload: Value,

    /// Failure message (failed tasks, failed or terminated instances)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HistoryEvent {
    /// Create a bare event stamped with the current time
    pub fn new(instance_id: impl Into<String>, sequence: u64, kind: EventKind) -> Self {
        Self {
            sequence,
            timestamp: Utc::now(),
            instance_id: instance_id.into(),
            kind,
            task_id: None,
            name: None,
            payload: Value::Null,
            error: None,
        }
    }

    /// Attach task correlation information
    pub fn with_task(mut self, task_id: TaskId, name: impl Into<String>) -> Self {
        self.task_id = Some(task_id);
        self.name = Some(name.into());
        self
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Attach error information
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn orchestrator_started(
        instance_id: impl Into<String>,
        orchestrator: impl Into<String>,
        input: Value,
    ) -> Self {
        let mut event = Self::new(instance_id, 1, EventKind::OrchestratorStarted).with_payload(input);
        event.name = Some(orchestrator.into());
        event
    }

    pub fn task_scheduled(
        instance_id: impl Into<String>,
        sequence: u64,
        task_id: TaskId,
        name: impl Into<String>,
        input: Value,
    ) -> Self {
        Self::new(instance_id, sequence, EventKind::TaskScheduled)
            .with_task(task_id, name)
            .with_payload(input)
    }

    pub fn task_completed(
        instance_id: impl Into<String>,
        sequence: u64,
        task_id: TaskId,
        name: impl Into<String>,
        output: Value,
    ) -> Self {
        Self::new(instance_id, sequence, EventKind::TaskCompleted)
            .with_task(task_id, name)
            .with_payload(output)
    }

    /// A failed task stores the full [`TaskFailure`] as payload so its kind
    /// survives replay.
    pub fn task_failed(
        instance_id: impl Into<String>,
        sequence: u64,
        task_id: TaskId,
        name: impl Into<String>,
        failure: &TaskFailure,
    ) -> Self {
        let payload = serde_json::to_value(failure).unwrap_or(Value::Null);
        Self::new(instance_id, sequence, EventKind::TaskFailed)
            .with_task(task_id, name)
            .with_payload(payload)
            .with_error(failure.message.clone())
    }

    /// Decode the failure carried by a `TaskFailed` event.
    ///
    /// Histories written by older hosts may only carry the message; those
    /// decode as business failures.
    pub fn failure(&self) -> Option<TaskFailure> {
        if self.kind != EventKind::TaskFailed {
            return None;
        }
        serde_json::from_value(self.payload.clone())
            .ok()
            .or_else(|| Some(TaskFailure::business(self.error.clone().unwrap_or_default())))
    }

    /// Whether this event ends the instance
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// Types of events recorded in an instance history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The instance was created with its input
    OrchestratorStarted,

    /// The orchestration requested an activity
    TaskScheduled,

    /// A scheduled activity returned a value
    TaskCompleted,

    /// A scheduled activity returned a typed failure
    TaskFailed,

    /// The orchestration returned its output
    OrchestratorCompleted,

    /// The orchestration failed (unhandled failure, determinism violation, limit)
    OrchestratorFailed,

    /// The instance was cancelled externally or timed out
    OrchestratorTerminated,
}

impl EventKind {
    /// Whether this event ends the instance
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::OrchestratorCompleted | Self::OrchestratorFailed | Self::OrchestratorTerminated
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::OrchestratorStarted => "OrchestratorStarted",
            Self::TaskScheduled => "TaskScheduled",
            Self::TaskCompleted => "TaskCompleted",
            Self::TaskFailed => "TaskFailed",
            Self::OrchestratorCompleted => "OrchestratorCompleted",
            Self::OrchestratorFailed => "OrchestratorFailed",
            Self::OrchestratorTerminated => "OrchestratorTerminated",
        };
        f.write_str(label)
    }
}
