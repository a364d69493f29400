//! Core orchestration logic.
//!
//! This module contains:
//! - History: Append-only per-instance event log and its backends
//! - Context/Engine: Deterministic replay of orchestration code
//! - Executor: Activity execution with retry, timeout and dedupe
//! - Registry: Name-based lookup of orchestrations and activities
//! - Runtime: Host that drives instances to completion
//! - Safety: Runaway protection limits

pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod history;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod safety;

// Re-export commonly used types
pub use context::{decode_input, encode_output, DeterminismViolation, Interrupt, OrchestrationContext};
pub use engine::{Orchestration, ReplayEngine, TurnOutcome, TurnStatus};
pub use error::EngineError;
pub use executor::{generate_idempotency_key, hash_input, ActivityExecutor};
pub use history::{
    HistoryError, HistoryStore, InMemoryHistoryStore, JsonlHistoryStore, SqliteHistoryStore,
};
pub use registry::{Registry, RegistryBuilder, RegistryError};
pub use retry::RetryPolicy;
pub use runtime::{InstanceStatusReport, Runtime, RuntimeSettings};
pub use safety::{SafetyLimits, SafetyViolation};
