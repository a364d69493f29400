//! Runtime host: owns the history store, registry and executor and drives
//! instances from start to a terminal state.
//!
//! Turns for one instance are serialised through a per-instance lock;
//! different instances proceed concurrently. Activities are dispatched
//! through a bounded worker pool shared by every instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    ActivityTask, EventKind, HistoryEvent, InstanceStatus, OrchestrationInstance, TaskFailure,
    TaskId, TaskResult,
};

use super::engine::{ReplayEngine, TurnOutcome, TurnStatus};
use super::error::EngineError;
use super::executor::ActivityExecutor;
use super::history::{validate_instance_id, HistoryStore};
use super::registry::Registry;
use super::retry::RetryPolicy;
use super::safety::SafetyLimits;

/// Settings for a [`Runtime`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Activities running at once across all instances (default: 16)
    #[serde(default = "default_max_concurrent_activities")]
    pub max_concurrent_activities: usize,

    /// Per-attempt activity timeout in seconds (default: 30)
    #[serde(default = "default_activity_timeout")]
    pub activity_timeout_seconds: u64,

    /// Time allowed to drive one instance to completion (default: 300 = 5 min)
    #[serde(default = "default_instance_timeout")]
    pub instance_timeout_seconds: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub safety: SafetyLimits,
}

fn default_max_concurrent_activities() -> usize {
    16
}
fn default_activity_timeout() -> u64 {
    30
}
fn default_instance_timeout() -> u64 {
    300
} // 5 min

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_concurrent_activities: default_max_concurrent_activities(),
            activity_timeout_seconds: default_activity_timeout(),
            instance_timeout_seconds: default_instance_timeout(),
            retry: RetryPolicy::default(),
            safety: SafetyLimits::default(),
        }
    }
}

/// Caller-facing view of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatusReport {
    pub instance_id: String,
    pub orchestrator_name: String,
    pub status: InstanceStatus,
    pub output: Option<Value>,
    pub failure_reason: Option<String>,
}

impl From<&OrchestrationInstance> for InstanceStatusReport {
    fn from(instance: &OrchestrationInstance) -> Self {
        Self {
            instance_id: instance.instance_id.clone(),
            orchestrator_name: instance.orchestrator_name.clone(),
            status: instance.status,
            output: instance.output.clone(),
            failure_reason: instance.failure_reason.clone(),
        }
    }
}

/// Orchestration host
pub struct Runtime {
    store: Arc<dyn HistoryStore>,
    registry: Arc<Registry>,
    executor: ActivityExecutor,
    engine: ReplayEngine,
    settings: RuntimeSettings,
    workers: Arc<Semaphore>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Runtime {
    pub fn new(store: Arc<dyn HistoryStore>, registry: Registry, settings: RuntimeSettings) -> Self {
        let registry = Arc::new(registry);
        let executor = ActivityExecutor::new(
            Arc::clone(&registry),
            settings.retry.clone(),
            Duration::from_secs(settings.activity_timeout_seconds),
        );

        Self {
            store,
            engine: ReplayEngine::new(settings.safety.clone()),
            workers: Arc::new(Semaphore::new(settings.max_concurrent_activities.max(1))),
            registry,
            executor,
            settings,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    pub fn executor(&self) -> &ActivityExecutor {
        &self.executor
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    fn instance_lock(&self, instance_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(instance_id.to_string()).or_default())
    }

    async fn load(&self, instance_id: &str) -> Result<(Vec<HistoryEvent>, OrchestrationInstance), EngineError> {
        let history = self.store.read(instance_id).await?;
        let instance = OrchestrationInstance::from_events(&history)
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?;
        Ok((history, instance))
    }

    /// Start a new instance with a generated id
    pub async fn start(&self, orchestrator_name: &str, input: Value) -> Result<String, EngineError> {
        let instance_id = Uuid::new_v4().to_string();
        self.start_with_id(&instance_id, orchestrator_name, input).await?;
        Ok(instance_id)
    }

    /// Start a new instance with a caller-supplied id
    #[instrument(skip(self, input))]
    pub async fn start_with_id(
        &self,
        instance_id: &str,
        orchestrator_name: &str,
        input: Value,
    ) -> Result<(), EngineError> {
        validate_instance_id(instance_id)?;
        if self.registry.orchestration(orchestrator_name).is_none() {
            return Err(EngineError::UnknownOrchestrator(orchestrator_name.to_string()));
        }

        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock().await;

        if self.store.exists(instance_id).await? {
            return Err(EngineError::InstanceAlreadyExists(instance_id.to_string()));
        }

        let event = HistoryEvent::orchestrator_started(instance_id, orchestrator_name, input);
        self.store.append(instance_id, &[event]).await?;

        info!("Orchestration instance created");
        Ok(())
    }

    /// Rebuild an instance from its history
    pub async fn get_instance(&self, instance_id: &str) -> Result<OrchestrationInstance, EngineError> {
        Ok(self.load(instance_id).await?.1)
    }

    /// Current status, output or failure reason of an instance
    pub async fn get_status(&self, instance_id: &str) -> Result<InstanceStatusReport, EngineError> {
        let instance = self.get_instance(instance_id).await?;
        Ok(InstanceStatusReport::from(&instance))
    }

    /// Full history of an instance
    pub async fn history(&self, instance_id: &str) -> Result<Vec<HistoryEvent>, EngineError> {
        Ok(self.load(instance_id).await?.0)
    }

    /// All instances known to the store
    pub async fn list_instances(&self) -> Result<Vec<OrchestrationInstance>, EngineError> {
        let mut instances = Vec::new();
        for instance_id in self.store.list_instances().await? {
            let history = self.store.read(&instance_id).await?;
            if let Some(instance) = OrchestrationInstance::from_events(&history) {
                instances.push(instance);
            }
        }
        instances.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(instances)
    }

    /// Cancel an instance. In-flight activities are not aborted; their
    /// completions are ignored once the instance is terminal.
    #[instrument(skip(self))]
    pub async fn terminate(&self, instance_id: &str, reason: &str) -> Result<(), EngineError> {
        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock().await;

        let (_, instance) = self.load(instance_id).await?;
        if instance.is_terminal() {
            return Err(EngineError::InstanceTerminal {
                instance_id: instance_id.to_string(),
                status: instance.status,
            });
        }

        let event = HistoryEvent::new(instance_id, instance.last_sequence + 1, EventKind::OrchestratorTerminated)
            .with_error(reason);
        self.store.append(instance_id, &[event]).await?;
        self.executor.forget_instance(instance_id);

        warn!("Orchestration instance terminated");
        Ok(())
    }

    /// Run one replay turn and persist its events
    #[instrument(skip(self))]
    pub async fn advance(&self, instance_id: &str) -> Result<TurnOutcome, EngineError> {
        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock().await;

        let (history, instance) = self.load(instance_id).await?;
        if instance.is_terminal() {
            return Err(EngineError::InstanceTerminal {
                instance_id: instance_id.to_string(),
                status: instance.status,
            });
        }

        let orchestration = self
            .registry
            .orchestration(&instance.orchestrator_name)
            .ok_or_else(|| EngineError::UnknownOrchestrator(instance.orchestrator_name.clone()))?;

        let outcome = self.engine.run_turn(instance_id, orchestration.as_ref(), &history)?;
        self.store.append(instance_id, &outcome.new_events).await?;

        match &outcome.status {
            TurnStatus::Suspended => {
                debug!(decisions = outcome.decisions.len(), "Turn suspended");
            }
            TurnStatus::Completed(_) => {
                info!("Orchestration completed");
                self.executor.forget_instance(instance_id);
            }
            TurnStatus::Failed(reason) => {
                warn!(%reason, "Orchestration failed");
                self.executor.forget_instance(instance_id);
            }
            TurnStatus::NonDeterministic(_) => {
                self.executor.forget_instance(instance_id);
            }
        }

        Ok(outcome)
    }

    /// Record the outcome of a scheduled task.
    ///
    /// Returns `false` when the outcome was ignored: the instance is already
    /// terminal or the task already has an outcome.
    pub async fn record_completion(
        &self,
        instance_id: &str,
        task_id: TaskId,
        result: TaskResult,
    ) -> Result<bool, EngineError> {
        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock().await;

        let (_, instance) = self.load(instance_id).await?;
        if instance.is_terminal() {
            debug!(instance_id, task_id, "Ignoring completion for terminal instance");
            return Ok(false);
        }

        let Some(record) = instance.tasks.get(&task_id) else {
            return Err(EngineError::UnknownTask {
                instance_id: instance_id.to_string(),
                task_id,
            });
        };
        if record.outcome.is_some() {
            debug!(instance_id, task_id, "Ignoring duplicate completion");
            return Ok(false);
        }

        let sequence = instance.last_sequence + 1;
        let name = record.task.activity_name.clone();
        let event = match result {
            Ok(output) => HistoryEvent::task_completed(instance_id, sequence, task_id, name, output),
            Err(failure) => HistoryEvent::task_failed(instance_id, sequence, task_id, name, &failure),
        };
        self.store.append(instance_id, &[event]).await?;

        Ok(true)
    }

    /// Drive an instance until it reaches a terminal state.
    ///
    /// Tasks that were scheduled but never completed (for example because
    /// the host crashed after recording them) are dispatched again first.
    /// If the instance does not finish within the instance timeout it is
    /// terminated.
    #[instrument(skip(self))]
    pub async fn run_to_completion(&self, instance_id: &str) -> Result<InstanceStatusReport, EngineError> {
        let limit = Duration::from_secs(self.settings.instance_timeout_seconds);

        match tokio::time::timeout(limit, self.drive(instance_id)).await {
            Ok(result) => result,
            Err(_) => {
                let reason = format!(
                    "Orchestration timed out after {}s",
                    self.settings.instance_timeout_seconds
                );
                match self.terminate(instance_id, &reason).await {
                    Ok(()) | Err(EngineError::InstanceTerminal { .. }) => {}
                    Err(e) => return Err(e),
                }
                self.get_status(instance_id).await
            }
        }
    }

    async fn drive(&self, instance_id: &str) -> Result<InstanceStatusReport, EngineError> {
        loop {
            let instance = self.get_instance(instance_id).await?;
            if instance.is_terminal() {
                return Ok(InstanceStatusReport::from(&instance));
            }

            let outstanding = instance.outstanding_tasks();
            let dispatched = !outstanding.is_empty();
            if dispatched {
                self.dispatch(instance_id, outstanding).await?;
            }

            let outcome = match self.advance(instance_id).await {
                Ok(outcome) => outcome,
                // Terminated concurrently
                Err(EngineError::InstanceTerminal { .. }) => continue,
                Err(e) => return Err(e),
            };

            if !outcome.is_complete() && outcome.decisions.is_empty() && !dispatched {
                return Err(EngineError::Stalled(instance_id.to_string()));
            }
        }
    }

    /// Run tasks through the worker pool, recording each outcome as it arrives
    async fn dispatch(&self, instance_id: &str, tasks: Vec<ActivityTask>) -> Result<(), EngineError> {
        debug!(instance_id, count = tasks.len(), "Dispatching tasks");

        let mut running = DetachOnDrop(JoinSet::new());
        for task in tasks {
            let executor = self.executor.clone();
            let workers = Arc::clone(&self.workers);
            let instance_id = instance_id.to_string();

            running.0.spawn(async move {
                let result = match workers.acquire_owned().await {
                    Ok(_permit) => executor.execute(&instance_id, &task).await,
                    Err(_) => Err(TaskFailure::transient("Worker pool closed")),
                };
                (task.task_id, result)
            });
        }

        while let Some(joined) = running.0.join_next().await {
            let (task_id, result) =
                joined.map_err(|e| EngineError::Store(anyhow::anyhow!("Activity worker panicked: {}", e)))?;
            self.record_completion(instance_id, task_id, result).await?;
        }

        Ok(())
    }
}

/// Workers outlive an abandoned dispatch (for example on instance timeout);
/// their completions are simply never recorded.
struct DetachOnDrop<T: 'static>(JoinSet<T>);

impl<T: 'static> Drop for DetachOnDrop<T> {
    fn drop(&mut self) {
        self.0.detach_all();
    }
}
