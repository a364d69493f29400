//! Orchestration instance state and reconstruction from history.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::events::{EventKind, HistoryEvent};
use super::task::{ActivityTask, TaskFailure, TaskId, TaskResult};

/// A task as seen through the history: its request and, once known, its outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub task: ActivityTask,
    pub outcome: Option<TaskResult>,
}

/// An orchestration instance, derived entirely from its history
#[derive(Debug, Clone)]
pub struct OrchestrationInstance {
    /// Unique identifier for this instance
    pub instance_id: String,

    /// Registered name of the orchestration being run
    pub orchestrator_name: String,

    /// Input the instance was started with
    pub input: Value,

    /// Current lifecycle status
    pub status: InstanceStatus,

    /// Orchestration output (completed instances)
    pub output: Option<Value>,

    /// Why the instance failed or was terminated
    pub failure_reason: Option<String>,

    /// When the instance was created
    pub created_at: DateTime<Utc>,

    /// Timestamp of the last history event
    pub last_updated_at: DateTime<Utc>,

    /// Sequence number of the last history event
    pub last_sequence: u64,

    /// Scheduled tasks keyed by task id
    pub tasks: BTreeMap<TaskId, TaskRecord>,
}

impl OrchestrationInstance {
    /// Reconstruct instance state from its history
    pub fn from_events(events: &[HistoryEvent]) -> Option<Self> {
        let first = events.first()?;
        if first.kind != EventKind::OrchestratorStarted {
            return None;
        }

        let mut instance = Self {
            instance_id: first.instance_id.clone(),
            orchestrator_name: first.name.clone().unwrap_or_default(),
            input: first.payload.clone(),
            status: InstanceStatus::Pending,
            output: None,
            failure_reason: None,
            created_at: first.timestamp,
            last_updated_at: first.timestamp,
            last_sequence: first.sequence,
            tasks: BTreeMap::new(),
        };

        for event in &events[1..] {
            instance.apply_event(event);
        }

        Some(instance)
    }

    /// Apply a single event to update instance state.
    ///
    /// Events arriving after a terminal event are ignored.
    pub fn apply_event(&mut self, event: &HistoryEvent) {
        self.last_sequence = event.sequence;
        self.last_updated_at = event.timestamp;

        if self.is_terminal() {
            return;
        }

        match event.kind {
            EventKind::OrchestratorStarted => {}
            EventKind::TaskScheduled => {
                if let Some(task_id) = event.task_id {
                    let task = ActivityTask::new(
                        task_id,
                        event.name.clone().unwrap_or_default(),
                        event.payload.clone(),
                    );
                    self.tasks.insert(task_id, TaskRecord { task, outcome: None });
                    self.status = InstanceStatus::Running;
                }
            }
            EventKind::TaskCompleted => {
                if let Some(record) = event.task_id.and_then(|id| self.tasks.get_mut(&id)) {
                    if record.outcome.is_none() {
                        record.outcome = Some(Ok(event.payload.clone()));
                    }
                }
            }
            EventKind::TaskFailed => {
                if let Some(record) = event.task_id.and_then(|id| self.tasks.get_mut(&id)) {
                    if record.outcome.is_none() {
                        let failure = event
                            .failure()
                            .unwrap_or_else(|| TaskFailure::business("unknown failure"));
                        record.outcome = Some(Err(failure));
                    }
                }
            }
            EventKind::OrchestratorCompleted => {
                self.status = InstanceStatus::Completed;
                self.output = Some(event.payload.clone());
            }
            EventKind::OrchestratorFailed => {
                self.status = InstanceStatus::Failed;
                self.failure_reason = event.error.clone();
            }
            EventKind::OrchestratorTerminated => {
                self.status = InstanceStatus::Terminated;
                self.failure_reason = event.error.clone();
            }
        }
    }

    /// Check if the instance has reached a final state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Scheduled tasks that have no recorded outcome yet, in task order
    pub fn outstanding_tasks(&self) -> Vec<ActivityTask> {
        self.tasks
            .values()
            .filter(|record| record.outcome.is_none())
            .map(|record| record.task.clone())
            .collect()
    }

    /// Whether the given task already has a recorded outcome
    pub fn is_task_resolved(&self, task_id: TaskId) -> bool {
        self.tasks
            .get(&task_id)
            .map(|record| record.outcome.is_some())
            .unwrap_or(false)
    }

    /// Task records in scheduling order
    pub fn task_records(&self) -> Vec<TaskRecord> {
        self.tasks.values().cloned().collect()
    }

    /// Get a human-readable status summary
    pub fn status_summary(&self) -> String {
        match (&self.status, &self.failure_reason) {
            (InstanceStatus::Failed, Some(reason)) | (InstanceStatus::Terminated, Some(reason)) => {
                format!("{} ({})", self.status, reason)
            }
            (status, _) => status.to_string(),
        }
    }
}

/// Lifecycle status of an orchestration instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created, no work scheduled yet
    Pending,

    /// At least one task has been scheduled
    Running,

    /// The orchestration returned a value
    Completed,

    /// An unhandled failure ended the orchestration
    Failed,

    /// Cancelled externally or timed out
    Terminated,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Terminated => "Terminated",
        };
        f.write_str(label)
    }
}
