//! Domain types for the orchestration engine.
//!
//! This module contains the core data structures:
//! - Events: Immutable history entries for an instance
//! - Task: Scheduled activity work and typed failures
//! - Instance: Orchestration state rebuilt from history

pub mod events;
pub mod instance;
pub mod task;

// Re-export commonly used types
pub use events::{EventKind, HistoryEvent};
pub use instance::{InstanceStatus, OrchestrationInstance, TaskRecord};
pub use task::{ActivityTask, FailureKind, TaskFailure, TaskId, TaskResult};
