//! Activity executor: runs one scheduled task to a single outcome.
//!
//! - Resolves the activity by name (unknown names fail without retry)
//! - Bounds each attempt with a timeout
//! - Retries transient failures and timeouts with backoff
//! - Dedupes by idempotency key, so a task dispatched twice (for example
//!   after a crash between scheduling and dispatch) runs once

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{debug, error, instrument, warn};

use crate::adapters::ActivityContext;
use crate::domain::{ActivityTask, TaskFailure, TaskId, TaskResult};

use super::registry::Registry;
use super::retry::RetryPolicy;

/// Generate an idempotency key for a task: "{instance_id}:{task_id}:{hash16}"
pub fn generate_idempotency_key(instance_id: &str, task_id: TaskId, activity_name: &str) -> String {
    format!("{}:{}:{}", instance_id, task_id, hash_input(activity_name))
}

/// Hash input content (first 16 chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

/// Dedupe entries grouped by instance, then by idempotency key
type Ledger = Mutex<HashMap<String, HashMap<String, Arc<OnceCell<TaskResult>>>>>;

/// Executes activity tasks with retry, timeout and deduplication
#[derive(Clone)]
pub struct ActivityExecutor {
    registry: Arc<Registry>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    ledger: Arc<Ledger>,
}

impl ActivityExecutor {
    pub fn new(registry: Arc<Registry>, retry: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self {
            registry,
            retry,
            attempt_timeout,
            ledger: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Execute a task, returning the outcome shared by every dispatch of it
    #[instrument(skip(self, task), fields(task_id = task.task_id, activity = %task.activity_name))]
    pub async fn execute(&self, instance_id: &str, task: &ActivityTask) -> TaskResult {
        let key = generate_idempotency_key(instance_id, task.task_id, &task.activity_name);
        let cell = self.ledger_entry(instance_id, &key);

        if cell.initialized() {
            debug!(%key, "Task already executed, returning recorded outcome");
        }

        cell.get_or_init(|| self.execute_with_retry(instance_id, task, key.clone()))
            .await
            .clone()
    }

    /// Number of distinct tasks this executor has run or is running
    pub fn executed_tasks(&self) -> usize {
        self.ledger
            .lock()
            .map(|ledger| ledger.values().map(HashMap::len).sum())
            .unwrap_or(0)
    }

    /// Drop dedupe entries for an instance that can no longer dispatch work
    pub fn forget_instance(&self, instance_id: &str) {
        if let Ok(mut ledger) = self.ledger.lock() {
            ledger.remove(instance_id);
        }
    }

    fn ledger_entry(&self, instance_id: &str, key: &str) -> Arc<OnceCell<TaskResult>> {
        let mut ledger = match self.ledger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let tasks = ledger.entry(instance_id.to_string()).or_default();
        Arc::clone(tasks.entry(key.to_string()).or_default())
    }

    async fn execute_with_retry(&self, instance_id: &str, task: &ActivityTask, key: String) -> TaskResult {
        let Some(activity) = self.registry.activity(&task.activity_name) else {
            error!(activity = %task.activity_name, "No activity registered");
            return Err(TaskFailure::not_registered(&task.activity_name));
        };

        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let started = Instant::now();
            let ctx = ActivityContext {
                instance_id: instance_id.to_string(),
                task_id: task.task_id,
                activity_name: task.activity_name.clone(),
                attempt,
                idempotency_key: key.clone(),
            };

            let result = match tokio::time::timeout(
                self.attempt_timeout,
                activity.invoke(&ctx, task.input.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TaskFailure::timeout(format!(
                    "Activity '{}' timed out after {}ms",
                    task.activity_name,
                    self.attempt_timeout.as_millis()
                ))),
            };

            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(output) => {
                    debug!(attempt, duration_ms, "Activity completed");
                    return Ok(output);
                }
                Err(failure) if self.retry.should_retry_failure(&failure, attempt) => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "Activity failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(failure) => {
                    if failure.is_retryable() {
                        error!(attempt, error = %failure, "Activity failed, retries exhausted");
                    } else {
                        debug!(attempt, error = %failure, "Activity returned a failure");
                    }
                    return Err(failure);
                }
            }
        }
    }
}
