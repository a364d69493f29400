//! Deterministic replay engine.
//!
//! A turn re-executes an orchestration from its start against the recorded
//! history. Completed tasks resolve synchronously from history; the first
//! unresolved request suspends the pass. The turn produces:
//! - scheduling decisions for tasks requested for the first time
//! - the history events to append (scheduled tasks, terminal event)
//! - the resulting status of the instance
//!
//! The engine itself performs no I/O. Persisting events and dispatching
//! decisions is the runtime's job.

use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{ActivityTask, EventKind, HistoryEvent, OrchestrationInstance};

use super::context::{DeterminismViolation, Interrupt, OrchestrationContext};
use super::error::EngineError;
use super::safety::SafetyLimits;

/// Orchestration logic: deterministic code driven through an [`OrchestrationContext`]
pub trait Orchestration: Send + Sync {
    fn run(&self, ctx: &mut OrchestrationContext, input: Value) -> Result<Value, Interrupt>;
}

impl<F> Orchestration for F
where
    F: Fn(&mut OrchestrationContext, Value) -> Result<Value, Interrupt> + Send + Sync,
{
    fn run(&self, ctx: &mut OrchestrationContext, input: Value) -> Result<Value, Interrupt> {
        self(ctx, input)
    }
}

/// How a turn left the instance
#[derive(Debug, Clone, PartialEq)]
pub enum TurnStatus {
    /// Waiting on scheduled tasks
    Suspended,

    /// The orchestration returned its output
    Completed(Value),

    /// An unhandled failure, limit or payload error ended the orchestration
    Failed(String),

    /// Replay diverged from history; the instance is failed
    NonDeterministic(DeterminismViolation),
}

/// Result of one replay turn
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub instance_id: String,

    /// Tasks to dispatch, in the order the orchestration requested them
    pub decisions: Vec<ActivityTask>,

    /// Events to append to history, sequences already assigned
    pub new_events: Vec<HistoryEvent>,

    pub status: TurnStatus,
}

impl TurnOutcome {
    /// Whether this turn ended the instance
    pub fn is_complete(&self) -> bool {
        !matches!(self.status, TurnStatus::Suspended)
    }

    /// Output of a completed orchestration
    pub fn output(&self) -> Option<&Value> {
        match &self.status {
            TurnStatus::Completed(output) => Some(output),
            _ => None,
        }
    }

    /// Failure reason of a failed orchestration
    pub fn failure(&self) -> Option<String> {
        match &self.status {
            TurnStatus::Failed(reason) => Some(reason.clone()),
            TurnStatus::NonDeterministic(violation) => Some(violation.to_string()),
            _ => None,
        }
    }
}

/// Replays orchestrations against their history
#[derive(Debug, Clone, Default)]
pub struct ReplayEngine {
    limits: SafetyLimits,
}

impl ReplayEngine {
    pub fn new(limits: SafetyLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Run one turn of `orchestration` for `instance_id`.
    ///
    /// The orchestration input is taken from the `OrchestratorStarted`
    /// event at the head of `history`.
    pub fn run_turn(
        &self,
        instance_id: &str,
        orchestration: &dyn Orchestration,
        history: &[HistoryEvent],
    ) -> Result<TurnOutcome, EngineError> {
        let instance = OrchestrationInstance::from_events(history)
            .filter(|instance| instance.instance_id == instance_id)
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?;

        if instance.is_terminal() {
            return Err(EngineError::InstanceTerminal {
                instance_id: instance_id.to_string(),
                status: instance.status,
            });
        }

        let mut ctx = OrchestrationContext::new(&instance, self.limits.clone());
        let result = orchestration.run(&mut ctx, instance.input.clone());
        let scheduled = ctx.take_scheduled();

        let status = match result {
            // Whatever the code did after a pending request, the pass is suspended
            _ if ctx.is_suspended() => TurnStatus::Suspended,
            Ok(output) => match self.check_finished(&ctx) {
                Err(violation) => TurnStatus::NonDeterministic(violation),
                Ok(()) => match ctx.limits().validate_payload("orchestration output", &output) {
                    Ok(()) => TurnStatus::Completed(output),
                    Err(violation) => TurnStatus::Failed(violation.to_string()),
                },
            },
            Err(Interrupt::Suspended) => TurnStatus::Suspended,
            Err(Interrupt::NonDeterministic(violation)) => TurnStatus::NonDeterministic(violation),
            Err(Interrupt::Failed(failure)) => match self.check_finished(&ctx) {
                Err(violation) => TurnStatus::NonDeterministic(violation),
                Ok(()) => TurnStatus::Failed(failure.message),
            },
            Err(other) => TurnStatus::Failed(other.to_string()),
        };

        let mut sequence = instance.last_sequence;
        let mut next_sequence = || {
            sequence += 1;
            sequence
        };
        let mut new_events = Vec::new();

        // A failing turn schedules nothing
        let decisions = match status {
            TurnStatus::Suspended | TurnStatus::Completed(_) => scheduled,
            _ => Vec::new(),
        };

        for task in &decisions {
            new_events.push(HistoryEvent::task_scheduled(
                instance_id,
                next_sequence(),
                task.task_id,
                task.activity_name.clone(),
                task.input.clone(),
            ));
        }

        match &status {
            TurnStatus::Suspended => {
                debug!(instance_id, scheduled = decisions.len(), "Orchestration suspended");
            }
            TurnStatus::Completed(output) => {
                new_events.push(
                    HistoryEvent::new(instance_id, next_sequence(), EventKind::OrchestratorCompleted)
                        .with_payload(output.clone()),
                );
            }
            TurnStatus::Failed(reason) => {
                new_events.push(
                    HistoryEvent::new(instance_id, next_sequence(), EventKind::OrchestratorFailed)
                        .with_error(reason.clone()),
                );
            }
            TurnStatus::NonDeterministic(violation) => {
                warn!(instance_id, %violation, "Determinism violation, failing instance");
                new_events.push(
                    HistoryEvent::new(instance_id, next_sequence(), EventKind::OrchestratorFailed)
                        .with_error(violation.to_string()),
                );
            }
        }

        Ok(TurnOutcome {
            instance_id: instance_id.to_string(),
            decisions,
            new_events,
            status,
        })
    }

    fn check_finished(&self, ctx: &OrchestrationContext) -> Result<(), DeterminismViolation> {
        match ctx.unconsumed() {
            0 => Ok(()),
            unconsumed => Err(DeterminismViolation::UnconsumedHistory { unconsumed }),
        }
    }
}
