//! Replay-safe saga coordinator.
//!
//! [`SagaState`] is rebuilt on every replay pass from the outcomes the
//! context returns; it is never persisted on its own. Compensation order is
//! the reverse of `completed_steps`, not of the static step list. A failed
//! compensation is recorded for manual intervention and the remaining
//! compensations still run. Compensations are never retried here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::core::{encode_output, Interrupt, Orchestration, OrchestrationContext};

use super::definition::{SagaDefinition, SagaStep};

/// Per-step progress
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub attempted: bool,
    pub succeeded: bool,

    /// Output of the step (reservation id, transaction id, ...)
    pub result_token: Option<Value>,
}

/// A compensation that failed and needs a human
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationFailure {
    pub step: String,
    pub activity: String,
    pub reason: String,
}

/// Saga progress, derived from history on every pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SagaState {
    pub saga_id: String,
    pub steps: BTreeMap<String, StepRecord>,

    /// Steps that succeeded, in completion order
    pub completed_steps: Vec<String>,

    /// Steps that were rolled back, in compensation order
    pub compensated_steps: Vec<String>,

    /// Compensation activities that ran successfully, in order
    pub compensation_activities: Vec<String>,

    pub failed_compensations: Vec<CompensationFailure>,
    pub failure_step: Option<String>,
    pub failure_reason: Option<String>,
}

impl SagaState {
    pub fn new(saga_id: impl Into<String>) -> Self {
        Self {
            saga_id: saga_id.into(),
            ..Self::default()
        }
    }

    /// Result token of a completed step
    pub fn token(&self, step: &str) -> Option<&Value> {
        self.steps.get(step).and_then(|record| record.result_token.as_ref())
    }

    /// Whether any compensation needs manual intervention
    pub fn needs_intervention(&self) -> bool {
        !self.failed_compensations.is_empty()
    }
}

/// Binary saga outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "state", rename_all = "snake_case")]
pub enum SagaOutcome {
    /// Every step succeeded
    Completed(SagaState),

    /// A step failed and compensation was attempted
    Failed(SagaState),
}

impl SagaOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn state(&self) -> &SagaState {
        match self {
            Self::Completed(state) | Self::Failed(state) => state,
        }
    }

    pub fn into_state(self) -> SagaState {
        match self {
            Self::Completed(state) | Self::Failed(state) => state,
        }
    }
}

/// Run `definition` forward with `input` passed to every step.
///
/// Only engine interrupts (suspension, determinism, limits) are returned as
/// errors; step failures become a [`SagaOutcome::Failed`].
pub fn run_saga(
    ctx: &mut OrchestrationContext,
    definition: &SagaDefinition,
    saga_id: &str,
    input: &Value,
) -> Result<SagaOutcome, Interrupt> {
    let mut state = SagaState::new(saga_id);

    if !ctx.is_replaying() {
        info!(saga = %definition.name, saga_id, "Starting saga");
    }

    for (index, step) in definition.steps.iter().enumerate() {
        state.steps.entry(step.name.clone()).or_default().attempted = true;

        match ctx.call_activity::<_, Value>(&step.activity, input)? {
            Ok(token) => {
                if !ctx.is_replaying() {
                    info!(saga_id, step = %step.name, number = index + 1, "Saga step completed");
                }
                let record = state.steps.entry(step.name.clone()).or_default();
                record.succeeded = true;
                record.result_token = Some(token);
                state.completed_steps.push(step.name.clone());
            }
            Err(failure) => {
                if !ctx.is_replaying() {
                    error!(saga_id, step = %step.name, error = %failure, "Saga step failed");
                }
                state.failure_step = Some(step.name.clone());
                state.failure_reason = Some(step.failure_reason(&failure.message));

                compensate(ctx, definition, &mut state)?;
                return Ok(SagaOutcome::Failed(state));
            }
        }
    }

    if !ctx.is_replaying() {
        info!(saga_id, "Saga completed");
    }
    Ok(SagaOutcome::Completed(state))
}

fn compensate(
    ctx: &mut OrchestrationContext,
    definition: &SagaDefinition,
    state: &mut SagaState,
) -> Result<(), Interrupt> {
    if !ctx.is_replaying() {
        warn!(
            saga_id = %state.saga_id,
            failure_step = ?state.failure_step,
            "Starting compensation"
        );
    }

    let completed: Vec<String> = state.completed_steps.iter().rev().cloned().collect();
    for step_name in completed {
        let Some(step) = definition.get_step(&step_name) else {
            continue;
        };
        compensate_step(ctx, step, state)?;
    }

    if !ctx.is_replaying() {
        warn!(
            saga_id = %state.saga_id,
            compensated = ?state.compensated_steps,
            failed = state.failed_compensations.len(),
            "Compensation finished"
        );
    }
    Ok(())
}

fn compensate_step(
    ctx: &mut OrchestrationContext,
    step: &SagaStep,
    state: &mut SagaState,
) -> Result<(), Interrupt> {
    let Some(ref activity) = step.compensation else {
        // Nothing to undo
        state.compensated_steps.push(step.name.clone());
        return Ok(());
    };

    let token = state.token(&step.name).cloned().unwrap_or(Value::Null);
    match ctx.call_activity::<_, Value>(activity, &token)? {
        Ok(_) => {
            state.compensated_steps.push(step.name.clone());
            state.compensation_activities.push(activity.clone());
        }
        Err(failure) => {
            if !ctx.is_replaying() {
                error!(
                    saga_id = %state.saga_id,
                    step = %step.name,
                    compensation = %activity,
                    error = %failure,
                    "Compensation FAILED, manual intervention required"
                );
            }
            state.failed_compensations.push(CompensationFailure {
                step: step.name.clone(),
                activity: activity.clone(),
                reason: failure.message,
            });
        }
    }
    Ok(())
}

/// Runs any [`SagaDefinition`] as an orchestration. The instance id is the
/// saga id; the output is the serialized [`SagaOutcome`].
pub struct SagaOrchestration {
    definition: SagaDefinition,
}

impl SagaOrchestration {
    pub fn new(definition: SagaDefinition) -> Self {
        Self { definition }
    }

    pub fn definition(&self) -> &SagaDefinition {
        &self.definition
    }
}

impl Orchestration for SagaOrchestration {
    fn run(&self, ctx: &mut OrchestrationContext, input: Value) -> Result<Value, Interrupt> {
        let saga_id = ctx.instance_id().to_string();
        let outcome = run_saga(ctx, &self.definition, &saga_id, &input)?;
        encode_output(&outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ReplayEngine, TurnStatus};
    use crate::domain::{HistoryEvent, TaskFailure, TaskResult};
    use serde_json::json;

    fn definition() -> SagaDefinition {
        SagaDefinition::new(
            "three",
            vec![
                SagaStep::new("A", "DoA").with_compensation("UndoA"),
                SagaStep::new("B", "DoB"),
                SagaStep::new("C", "DoC").with_compensation("UndoC"),
            ],
        )
    }

    /// Drive the saga with a scripted outcome per activity
    fn drive(script: impl Fn(&str) -> TaskResult) -> (SagaOutcome, Vec<String>) {
        let engine = ReplayEngine::default();
        let saga = SagaOrchestration::new(definition());
        let mut history = vec![HistoryEvent::orchestrator_started("s1", "three", json!({"order": 1}))];
        let mut invoked = Vec::new();

        loop {
            let outcome = engine.run_turn("s1", &saga, &history).unwrap();
            history.extend(outcome.new_events.iter().cloned());
            match outcome.status {
                TurnStatus::Completed(output) => {
                    return (serde_json::from_value(output).unwrap(), invoked);
                }
                TurnStatus::Suspended => {}
                other => panic!("unexpected status {:?}", other),
            }
            for task in outcome.decisions {
                invoked.push(task.activity_name.clone());
                let sequence = history.last().unwrap().sequence + 1;
                history.push(match script(&task.activity_name) {
                    Ok(v) => HistoryEvent::task_completed("s1", sequence, task.task_id, task.activity_name, v),
                    Err(f) => HistoryEvent::task_failed("s1", sequence, task.task_id, task.activity_name, &f),
                });
            }
        }
    }

    #[test]
    fn test_all_steps_succeed() {
        let (outcome, invoked) = drive(|name| Ok(json!(format!("{}-token", name))));

        assert!(outcome.is_success());
        assert_eq!(invoked, vec!["DoA", "DoB", "DoC"]);
        assert_eq!(outcome.state().completed_steps, vec!["A", "B", "C"]);
        assert!(outcome.state().compensated_steps.is_empty());
        assert_eq!(outcome.state().token("C"), Some(&json!("DoC-token")));
    }

    #[test]
    fn test_last_step_failure_compensates_in_reverse() {
        let (outcome, invoked) = drive(|name| match name {
            "DoC" => Err(TaskFailure::business("boom")),
            other => Ok(json!(format!("{}-token", other))),
        });

        let state = outcome.state();
        assert!(!outcome.is_success());
        assert_eq!(invoked, vec!["DoA", "DoB", "DoC", "UndoA"]);
        assert_eq!(state.compensated_steps, vec!["B", "A"]);
        assert_eq!(state.compensation_activities, vec!["UndoA"]);
        assert_eq!(state.failure_step.as_deref(), Some("C"));
        assert_eq!(state.failure_reason.as_deref(), Some("C failed: boom"));
    }

    #[test]
    fn test_compensation_receives_result_token() {
        let engine = ReplayEngine::default();
        let saga = SagaOrchestration::new(definition());
        let history = vec![
            HistoryEvent::orchestrator_started("s1", "three", json!(null)),
            HistoryEvent::task_scheduled("s1", 2, 0, "DoA", json!(null)),
            HistoryEvent::task_completed("s1", 3, 0, "DoA", json!("RES-1")),
            HistoryEvent::task_scheduled("s1", 4, 1, "DoB", json!(null)),
            HistoryEvent::task_failed("s1", 5, 1, "DoB", &TaskFailure::business("no")),
        ];

        let outcome = engine.run_turn("s1", &saga, &history).unwrap();
        assert_eq!(outcome.decisions.len(), 1);
        assert_eq!(outcome.decisions[0].activity_name, "UndoA");
        assert_eq!(outcome.decisions[0].input, json!("RES-1"));
    }

    #[test]
    fn test_failed_compensation_does_not_stop_others() {
        let definition = SagaDefinition::new(
            "two-comps",
            vec![
                SagaStep::new("A", "DoA").with_compensation("UndoA"),
                SagaStep::new("B", "DoB").with_compensation("UndoB"),
                SagaStep::new("C", "DoC"),
            ],
        );
        let engine = ReplayEngine::default();
        let saga = SagaOrchestration::new(definition);
        let history = vec![
            HistoryEvent::orchestrator_started("s1", "two-comps", json!(null)),
            HistoryEvent::task_scheduled("s1", 2, 0, "DoA", json!(null)),
            HistoryEvent::task_completed("s1", 3, 0, "DoA", json!("a")),
            HistoryEvent::task_scheduled("s1", 4, 1, "DoB", json!(null)),
            HistoryEvent::task_completed("s1", 5, 1, "DoB", json!("b")),
            HistoryEvent::task_scheduled("s1", 6, 2, "DoC", json!(null)),
            HistoryEvent::task_failed("s1", 7, 2, "DoC", &TaskFailure::business("no")),
            HistoryEvent::task_scheduled("s1", 8, 3, "UndoB", json!("b")),
            HistoryEvent::task_failed("s1", 9, 3, "UndoB", &TaskFailure::transient("refund api down")),
        ];

        let outcome = engine.run_turn("s1", &saga, &history).unwrap();
        assert_eq!(outcome.decisions[0].activity_name, "UndoA");
    }
}
