//! The restricted execution context handed to orchestration code.
//!
//! Orchestrations never touch the clock, random numbers or I/O directly.
//! Everything nondeterministic flows through this context:
//! - activity results come from history once recorded
//! - `current_time` is the instance start timestamp
//! - `new_guid` derives ids from the instance id and a replay counter
//!
//! Suspension is expressed as a value: when a requested task has no
//! recorded outcome, the call returns `Err(Interrupt::Suspended)` and the
//! orchestration propagates it with `?`. The inner `Result` of a call is
//! the business outcome, which the orchestration handles explicitly.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{ActivityTask, OrchestrationInstance, TaskFailure, TaskId, TaskResult};

use super::safety::{SafetyLimits, SafetyViolation};

/// Why an orchestration pass stopped before returning a value
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Interrupt {
    /// Waiting on at least one task without a recorded outcome
    #[error("Orchestration suspended awaiting task results")]
    Suspended,

    /// A task failure the orchestration chose not to handle
    #[error("Unhandled task failure: {0}")]
    Failed(#[from] TaskFailure),

    #[error(transparent)]
    NonDeterministic(#[from] DeterminismViolation),

    #[error("Safety limit reached: {0}")]
    Limit(#[from] SafetyViolation),

    #[error("Payload error: {0}")]
    Payload(String),

    #[error("Invalid orchestration input: {0}")]
    InvalidInput(String),
}

/// Replay produced a different scheduling decision than history recorded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeterminismViolation {
    #[error("Non-deterministic orchestration: task {position} was '{expected}' in history but '{actual}' on replay")]
    NameMismatch {
        position: TaskId,
        expected: String,
        actual: String,
    },

    #[error("Non-deterministic orchestration: task {position} ('{name}') requested with different input than recorded")]
    InputMismatch { position: TaskId, name: String },

    #[error("Non-deterministic orchestration: finished without requesting {unconsumed} recorded task(s)")]
    UnconsumedHistory { unconsumed: usize },
}

/// Decode an orchestration input into a typed value
pub fn decode_input<T: DeserializeOwned>(input: Value) -> Result<T, Interrupt> {
    serde_json::from_value(input).map_err(|e| Interrupt::InvalidInput(e.to_string()))
}

/// Encode an orchestration output
pub fn encode_output<T: Serialize>(output: &T) -> Result<Value, Interrupt> {
    serde_json::to_value(output).map_err(|e| Interrupt::Payload(e.to_string()))
}

/// Execution context for one replay pass of one instance
#[derive(Debug)]
pub struct OrchestrationContext {
    instance_id: String,
    started_at: DateTime<Utc>,
    limits: SafetyLimits,

    /// Tasks recorded in history, indexed by position
    recorded: Vec<(ActivityTask, Option<TaskResult>)>,

    /// Next deterministic task position
    cursor: u64,

    /// Tasks requested for the first time during this pass
    scheduled: Vec<ActivityTask>,

    /// Set once a request has no recorded outcome; the pass is over
    suspended: bool,

    guid_counter: u64,
}

impl OrchestrationContext {
    /// Build a context from the instance state rebuilt from history
    pub fn new(instance: &OrchestrationInstance, limits: SafetyLimits) -> Self {
        let recorded = instance
            .tasks
            .values()
            .map(|record| (record.task.clone(), record.outcome.clone()))
            .collect();

        Self {
            instance_id: instance.instance_id.clone(),
            started_at: instance.created_at,
            limits,
            recorded,
            cursor: 0,
            scheduled: Vec::new(),
            suspended: false,
            guid_counter: 0,
        }
    }

    /// The id of the running instance
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Deterministic "now": the timestamp at which the instance started
    pub fn current_time(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Deterministic unique id, identical across replays of the same pass position
    pub fn new_guid(&mut self) -> Uuid {
        let name = format!("{}:{}", self.instance_id, self.guid_counter);
        self.guid_counter += 1;
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }

    /// True while the orchestration is re-executing code that already ran in
    /// an earlier pass. Use it to avoid repeating side effects such as logs.
    pub fn is_replaying(&self) -> bool {
        (self.cursor as usize) < self.recorded.len()
    }

    /// Request a single activity.
    ///
    /// Returns `Ok(Ok(output))` or `Ok(Err(failure))` once the task has a
    /// recorded outcome, and `Err(Interrupt::Suspended)` while it is pending.
    pub fn call_activity<I, O>(
        &mut self,
        name: &str,
        input: &I,
    ) -> Result<Result<O, TaskFailure>, Interrupt>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let input = serde_json::to_value(input).map_err(|e| Interrupt::Payload(e.to_string()))?;
        let task_id = self.claim(name, input)?;

        match self.outcome(task_id) {
            Some(outcome) => decode_outcome(name, outcome),
            None => Err(self.suspend()),
        }
    }

    /// Request several independent activities at once (fan-out).
    ///
    /// Every call is scheduled in the same pass, in the order given. The
    /// results are returned in that same order only once all of them have
    /// an outcome; until then the pass suspends.
    pub fn call_all<I, O>(
        &mut self,
        calls: &[(String, I)],
    ) -> Result<Vec<Result<O, TaskFailure>>, Interrupt>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let mut task_ids = Vec::with_capacity(calls.len());
        for (name, input) in calls {
            let input =
                serde_json::to_value(input).map_err(|e| Interrupt::Payload(e.to_string()))?;
            task_ids.push((name.as_str(), self.claim(name, input)?));
        }

        let mut results = Vec::with_capacity(task_ids.len());
        for (name, task_id) in task_ids {
            match self.outcome(task_id) {
                Some(outcome) => results.push(decode_outcome(name, outcome)?),
                None => return Err(self.suspend()),
            }
        }

        Ok(results)
    }

    /// Assign the next deterministic position to a request, checking it
    /// against history when the position was already recorded.
    fn claim(&mut self, name: &str, input: Value) -> Result<TaskId, Interrupt> {
        // Requests made after the pass suspended are never scheduled
        if self.suspended {
            return Err(Interrupt::Suspended);
        }

        let position = self.cursor;
        self.cursor += 1;

        if let Some((recorded, _)) = self.recorded.get(position as usize) {
            if recorded.activity_name != name {
                return Err(DeterminismViolation::NameMismatch {
                    position,
                    expected: recorded.activity_name.clone(),
                    actual: name.to_string(),
                }
                .into());
            }
            if recorded.input != input {
                return Err(DeterminismViolation::InputMismatch {
                    position,
                    name: name.to_string(),
                }
                .into());
            }
            return Ok(recorded.task_id);
        }

        self.limits.check_task_count(position + 1)?;
        self.limits.validate_payload(name, &input)?;
        self.scheduled.push(ActivityTask::new(position, name, input));
        Ok(position)
    }

    fn suspend(&mut self) -> Interrupt {
        self.suspended = true;
        Interrupt::Suspended
    }

    /// Whether a request in this pass is still waiting on its outcome
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    fn outcome(&self, task_id: TaskId) -> Option<TaskResult> {
        self.recorded
            .get(task_id as usize)
            .and_then(|(_, outcome)| outcome.clone())
    }

    /// Tasks first requested during this pass
    pub(crate) fn take_scheduled(&mut self) -> Vec<ActivityTask> {
        std::mem::take(&mut self.scheduled)
    }

    /// Recorded tasks the orchestration never reached during this pass
    pub(crate) fn unconsumed(&self) -> usize {
        self.recorded.len().saturating_sub(self.cursor as usize)
    }

    pub(crate) fn limits(&self) -> &SafetyLimits {
        &self.limits
    }
}

fn decode_outcome<O: DeserializeOwned>(
    name: &str,
    outcome: TaskResult,
) -> Result<Result<O, TaskFailure>, Interrupt> {
    match outcome {
        Ok(value) => serde_json::from_value(value).map(Ok).map_err(|e| {
            Interrupt::Payload(format!("Failed to decode output of '{}': {}", name, e))
        }),
        Err(failure) => Ok(Err(failure)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HistoryEvent;
    use serde_json::json;

    fn context(events: &[HistoryEvent]) -> OrchestrationContext {
        let instance = OrchestrationInstance::from_events(events).unwrap();
        OrchestrationContext::new(&instance, SafetyLimits::default())
    }

    fn started() -> HistoryEvent {
        HistoryEvent::orchestrator_started("inst", "Demo", json!(null))
    }

    #[test]
    fn test_first_call_schedules_and_suspends() {
        let mut ctx = context(&[started()]);

        let result: Result<Result<String, TaskFailure>, Interrupt> = ctx.call_activity("A", &1);
        assert_eq!(result, Err(Interrupt::Suspended));
        assert_eq!(ctx.take_scheduled(), vec![ActivityTask::new(0, "A", json!(1))]);
    }

    #[test]
    fn test_recorded_outcome_is_returned() {
        let mut ctx = context(&[
            started(),
            HistoryEvent::task_scheduled("inst", 2, 0, "A", json!(1)),
            HistoryEvent::task_completed("inst", 3, 0, "A", json!("done")),
        ]);

        assert!(ctx.is_replaying());
        let result: Result<String, TaskFailure> = ctx.call_activity("A", &1).unwrap();
        assert_eq!(result, Ok("done".to_string()));
        assert!(!ctx.is_replaying());
        assert!(ctx.take_scheduled().is_empty());
    }

    #[test]
    fn test_recorded_failure_is_a_value() {
        let failure = TaskFailure::business("declined");
        let mut ctx = context(&[
            started(),
            HistoryEvent::task_scheduled("inst", 2, 0, "A", json!(1)),
            HistoryEvent::task_failed("inst", 3, 0, "A", &failure),
        ]);

        let result: Result<Value, TaskFailure> = ctx.call_activity("A", &1).unwrap();
        assert_eq!(result, Err(failure));
    }

    #[test]
    fn test_name_mismatch_is_detected() {
        let mut ctx = context(&[started(), HistoryEvent::task_scheduled("inst", 2, 0, "A", json!(1))]);

        let result: Result<Result<Value, TaskFailure>, Interrupt> = ctx.call_activity("B", &1);
        assert!(matches!(
            result,
            Err(Interrupt::NonDeterministic(DeterminismViolation::NameMismatch { position: 0, .. }))
        ));
    }

    #[test]
    fn test_input_mismatch_is_detected() {
        let mut ctx = context(&[started(), HistoryEvent::task_scheduled("inst", 2, 0, "A", json!(1))]);

        let result: Result<Result<Value, TaskFailure>, Interrupt> = ctx.call_activity("A", &2);
        assert!(matches!(
            result,
            Err(Interrupt::NonDeterministic(DeterminismViolation::InputMismatch { .. }))
        ));
    }

    #[test]
    fn test_call_all_schedules_every_branch() {
        let mut ctx = context(&[started()]);
        let calls = vec![("X".to_string(), 1), ("Y".to_string(), 2), ("Z".to_string(), 3)];

        let result: Result<Vec<Result<Value, TaskFailure>>, Interrupt> = ctx.call_all(&calls);
        assert_eq!(result, Err(Interrupt::Suspended));

        let names: Vec<String> = ctx.take_scheduled().into_iter().map(|t| t.activity_name).collect();
        assert_eq!(names, vec!["X", "Y", "Z"]);
    }

    #[test]
    fn test_call_all_waits_for_every_branch() {
        let mut ctx = context(&[
            started(),
            HistoryEvent::task_scheduled("inst", 2, 0, "X", json!(1)),
            HistoryEvent::task_scheduled("inst", 3, 1, "Y", json!(2)),
            HistoryEvent::task_completed("inst", 4, 1, "Y", json!("y")),
        ]);
        let calls = vec![("X".to_string(), 1), ("Y".to_string(), 2)];

        let result: Result<Vec<Result<String, TaskFailure>>, Interrupt> = ctx.call_all(&calls);
        assert_eq!(result, Err(Interrupt::Suspended));
        assert!(ctx.take_scheduled().is_empty());
    }

    #[test]
    fn test_requests_after_suspension_are_not_scheduled() {
        let mut ctx = context(&[started()]);

        let first: Result<Result<Value, TaskFailure>, Interrupt> = ctx.call_activity("A", &1);
        assert_eq!(first, Err(Interrupt::Suspended));
        assert!(ctx.is_suspended());

        let second: Result<Result<Value, TaskFailure>, Interrupt> = ctx.call_activity("B", &2);
        assert_eq!(second, Err(Interrupt::Suspended));

        let calls = vec![("C".to_string(), 3)];
        let third: Result<Vec<Result<Value, TaskFailure>>, Interrupt> = ctx.call_all(&calls);
        assert_eq!(third, Err(Interrupt::Suspended));

        assert_eq!(ctx.take_scheduled(), vec![ActivityTask::new(0, "A", json!(1))]);
    }

    #[test]
    fn test_guids_are_stable() {
        let mut first = context(&[started()]);
        let mut second = context(&[started()]);

        assert_eq!(first.new_guid(), second.new_guid());
        assert_ne!(first.new_guid(), first.new_guid());
    }

    #[test]
    fn test_task_limit() {
        let instance = OrchestrationInstance::from_events(&[started()]).unwrap();
        let limits = SafetyLimits {
            max_tasks_per_instance: 1,
            ..Default::default()
        };
        let mut ctx = OrchestrationContext::new(&instance, limits);
        let calls = vec![("X".to_string(), 1), ("Y".to_string(), 2)];

        let result: Result<Vec<Result<Value, TaskFailure>>, Interrupt> = ctx.call_all(&calls);
        assert!(matches!(result, Err(Interrupt::Limit(SafetyViolation::MaxTasks { .. }))));
    }
}
