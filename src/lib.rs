//! sagaflow - Durable, replay-safe orchestration
//!
//! Orchestrations are ordinary Rust functions that call activities through
//! an [`OrchestrationContext`]. Every scheduling decision and every activity
//! outcome is appended to a per-instance history; after a restart the
//! orchestration is replayed against that history and continues where it
//! left off.
//!
//! # Architecture
//!
//! - All state changes are recorded as immutable history events
//! - Instance state is derived by folding the history
//! - Orchestration code is re-executed on every turn and must be deterministic
//! - Activities run in a bounded worker pool with retry and timeouts
//!
//! # Modules
//!
//! - `domain`: History events, tasks and instance state
//! - `core`: History stores, replay engine, executor, registry, runtime
//! - `saga`: Saga coordinator with reverse-order compensation
//! - `etl`: Fan-out/fan-in ETL pipeline with rule validation
//! - `adapters`: Activity trait, HTTP activities and in-process services
//! - `config`: YAML configuration discovery
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the order saga to completion
//! sagaflow start OrderSagaOrchestrator --input order.json --wait
//!
//! # Check instance status
//! sagaflow status <instance-id>
//!
//! # Continue an interrupted instance
//! sagaflow resume <instance-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod etl;
pub mod saga;

// Re-export main types at crate root for convenience
pub use adapters::{Activity, ActivityContext};
pub use core::{
    EngineError, Interrupt, Orchestration, OrchestrationContext, Registry, Runtime, RuntimeSettings,
};
pub use domain::{EventKind, HistoryEvent, InstanceStatus, OrchestrationInstance, TaskFailure};
pub use etl::{EtlOrchestration, EtlResult};
pub use saga::{OrderSagaOrchestration, SagaDefinition, SagaOrchestration, SagaOutcome};
