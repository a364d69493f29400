//! Activity interfaces for external work.
//!
//! Activities are plain request/response functions registered by name.
//! The engine and coordinators only ever see the [`Activity`] trait; how an
//! activity reaches the outside world (HTTP, files, in-process simulation)
//! is up to the implementation.

pub mod etl;
pub mod http;
pub mod order;

use std::future::Future;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::domain::{TaskFailure, TaskId, TaskResult};

pub use http::HttpActivity;

/// Information about the invocation an activity is serving
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityContext {
    /// Instance that scheduled the task
    pub instance_id: String,

    /// Task correlation id within the instance
    pub task_id: TaskId,

    /// Registered activity name
    pub activity_name: String,

    /// Attempt number (1-indexed)
    pub attempt: u32,

    /// Stable key for this task: identical across retries and re-dispatches
    pub idempotency_key: String,
}

impl ActivityContext {
    /// Derive a stable identifier such as `TXN-<uuid>` from the idempotency key.
    ///
    /// Re-executing the same task yields the same id, which lets activities
    /// upsert instead of duplicating effects.
    pub fn stable_id(&self, prefix: &str) -> String {
        let uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, self.idempotency_key.as_bytes());
        format!("{}-{}", prefix, uuid.simple().to_string().to_uppercase())
    }
}

/// A named unit of work
#[async_trait]
pub trait Activity: Send + Sync {
    /// Execute the activity with its input
    async fn invoke(&self, ctx: &ActivityContext, input: Value) -> TaskResult;
}

/// Adapts an async closure into an [`Activity`]
pub struct FnActivity<F>(pub F);

#[async_trait]
impl<F, Fut> Activity for FnActivity<F>
where
    F: Fn(ActivityContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = TaskResult> + Send,
{
    async fn invoke(&self, ctx: &ActivityContext, input: Value) -> TaskResult {
        (self.0)(ctx.clone(), input).await
    }
}

/// Decode an activity input, mapping errors to a payload failure
pub fn decode<T: DeserializeOwned>(input: Value) -> Result<T, TaskFailure> {
    serde_json::from_value(input).map_err(|e| TaskFailure::payload(format!("Invalid input: {}", e)))
}

/// Encode an activity output, mapping errors to a payload failure
pub fn encode<T: Serialize>(output: &T) -> TaskResult {
    serde_json::to_value(output).map_err(|e| TaskFailure::payload(format!("Invalid output: {}", e)))
}
