//! Saga coordination on top of the replay engine.
//!
//! A saga runs its steps in order. When a step fails, the steps that
//! already succeeded are compensated in reverse order of completion, then
//! the saga reports a binary outcome: fully completed or rolled back.
//!
//! - `definition`: Declarative step lists (YAML-loadable)
//! - `coordinator`: Saga state and the replay-safe coordinator
//! - `order`: The order-fulfillment saga

pub mod coordinator;
pub mod definition;
pub mod order;

pub use coordinator::{run_saga, CompensationFailure, SagaOrchestration, SagaOutcome, SagaState, StepRecord};
pub use definition::{SagaDefinition, SagaStep};
pub use order::{Order, OrderItem, OrderResult, OrderSagaOrchestration, OrderStatus};
