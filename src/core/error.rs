//! Errors surfaced to callers of the engine and runtime.

use thiserror::Error;

use crate::domain::{InstanceStatus, TaskId};

use super::history::HistoryError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Instance already exists: {0}")]
    InstanceAlreadyExists(String),

    #[error("Instance {instance_id} is already {status}")]
    InstanceTerminal {
        instance_id: String,
        status: InstanceStatus,
    },

    #[error("No orchestration registered as '{0}'")]
    UnknownOrchestrator(String),

    #[error("Instance {instance_id} has no scheduled task {task_id}")]
    UnknownTask { instance_id: String, task_id: TaskId },

    #[error("Instance {0} suspended without scheduling any work")]
    Stalled(String),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("History store error: {0:#}")]
    Store(#[from] anyhow::Error),

    #[error("Serialization error: {0}")]
    Payload(#[from] serde_json::Error),
}
