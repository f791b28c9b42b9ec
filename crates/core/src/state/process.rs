//! The transition function.
//!
//! [`apply`] is the only code that mutates a [`ProcessInstance`]. The engine
//! runs it on a copy before persisting a record and on the live instance
//! after; recovery runs the very same function over the persisted log, which
//! is what makes replay reproduce the pre-crash state exactly.

use chrono::{DateTime, Utc};
use pe_protocol::definition_models::ProcessDefinition;
use pe_protocol::instance_models::{
    ChildRef, Phase, ProcessInstance, ResultRef, Spent, StepState, StepStatus,
};
use pe_protocol::ipc::ControlAction;
use pe_protocol::transition_models::{Transition, TransitionRecord};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransitionError {
    #[error("log does not start with a created record")]
    NotCreated,

    #[error("instance was already created")]
    AlreadyCreated,

    #[error("record for {found} applied to instance {expected}")]
    WrongInstance { expected: Uuid, found: Uuid },

    #[error("expected sequence {expected}, found {found}")]
    OutOfSequence { expected: u64, found: u64 },

    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("step '{step_id}' cannot move from {from} to {to}")]
    IllegalStepMove {
        step_id: String,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("phase cannot move from {from} to {to}")]
    IllegalPhaseMove { from: Phase, to: Phase },

    #[error("instance is terminal ({0}); no further transitions are accepted")]
    Terminal(Phase),

    #[error("step '{step_id}' has no child {child_id}")]
    UnknownChild { step_id: String, child_id: Uuid },

    #[error("{0}")]
    Inconsistent(String),
}

pub type TransitionResult<T> = Result<T, TransitionError>;

/// Build a new instance from its `Created` record.
pub fn create(record: &TransitionRecord) -> TransitionResult<ProcessInstance> {
    let Transition::Created {
        definition,
        parent,
        root_id,
        depth,
        path,
        budget,
        variables,
    } = &record.transition
    else {
        return Err(TransitionError::NotCreated);
    };
    if record.seq != 0 {
        return Err(TransitionError::OutOfSequence {
            expected: 0,
            found: record.seq,
        });
    }

    Ok(ProcessInstance {
        id: record.instance_id,
        parent: parent.clone(),
        root_id: *root_id,
        depth: *depth,
        path: path.clone(),
        steps: step_states(definition),
        definition: definition.clone(),
        phase: Phase::Pending,
        variables: variables.clone(),
        budget: budget.clone(),
        spent: Spent::default(),
        paused: false,
        cancel_requested: false,
        outcome: None,
        created_at: record.at,
        updated_at: record.at,
        last_seq: 0,
    })
}

/// Rebuild an instance from its full log.
pub fn replay(records: &[TransitionRecord]) -> TransitionResult<ProcessInstance> {
    let (first, rest) = records.split_first().ok_or(TransitionError::NotCreated)?;
    let mut instance = create(first)?;
    for record in rest {
        apply(&mut instance, record)?;
    }
    Ok(instance)
}

fn step_states(definition: &ProcessDefinition) -> BTreeMap<String, StepState> {
    definition
        .steps
        .iter()
        .map(|s| (s.id.clone(), StepState::new(s.id.clone())))
        .collect()
}

/// Whether the phase machine allows `from -> to`.
pub fn phase_move_allowed(from: Phase, to: Phase) -> bool {
    use Phase::*;
    if from.is_terminal() {
        return false;
    }
    match to {
        Failed | Escalated | Cancelled => true,
        Planning => from == Pending,
        Executing => matches!(from, Pending | Planning | Evaluating),
        Evaluating => from == Executing,
        Finalizing => matches!(from, Executing | Evaluating),
        Completed => from == Finalizing,
        Pending => false,
    }
}

/// Apply one record to an instance.
///
/// # Errors
///
/// Any record that does not fit the instance's current state is rejected
/// and the instance is left untouched.
pub fn apply(instance: &mut ProcessInstance, record: &TransitionRecord) -> TransitionResult<()> {
    if record.instance_id != instance.id {
        return Err(TransitionError::WrongInstance {
            expected: instance.id,
            found: record.instance_id,
        });
    }
    if record.seq != instance.last_seq + 1 {
        return Err(TransitionError::OutOfSequence {
            expected: instance.last_seq + 1,
            found: record.seq,
        });
    }
    if instance.phase.is_terminal() {
        return Err(TransitionError::Terminal(instance.phase));
    }

    let mut next = instance.clone();
    apply_transition(&mut next, &record.transition, record.at)?;
    next.last_seq = record.seq;
    next.updated_at = record.at;
    *instance = next;
    Ok(())
}

fn step_mut<'a>(instance: &'a mut ProcessInstance, step_id: &str) -> TransitionResult<&'a mut StepState> {
    instance
        .steps
        .get_mut(step_id)
        .ok_or_else(|| TransitionError::UnknownStep(step_id.to_string()))
}

fn move_step(step: &mut StepState, to: StepStatus, allowed_from: &[StepStatus]) -> TransitionResult<()> {
    if !allowed_from.contains(&step.status) {
        return Err(TransitionError::IllegalStepMove {
            step_id: step.step_id.clone(),
            from: step.status,
            to,
        });
    }
    step.status = to;
    Ok(())
}

fn apply_transition(
    instance: &mut ProcessInstance,
    transition: &Transition,
    at: DateTime<Utc>,
) -> TransitionResult<()> {
    use StepStatus::*;

    match transition {
        Transition::Created { .. } => return Err(TransitionError::AlreadyCreated),

        Transition::PhaseChanged { to, reason } => {
            if !phase_move_allowed(instance.phase, *to) {
                return Err(TransitionError::IllegalPhaseMove {
                    from: instance.phase,
                    to: *to,
                });
            }
            instance.phase = *to;
            if to.is_terminal() {
                instance.outcome = reason.clone();
            }
        }

        Transition::PlanSynthesized { definition, .. } => {
            if instance.phase != Phase::Planning {
                return Err(TransitionError::Inconsistent(format!(
                    "plan synthesized while {}",
                    instance.phase
                )));
            }
            instance.steps = step_states(definition);
            instance.definition = definition.clone();
        }

        Transition::StepDispatched {
            step_id,
            correlation_id,
            idempotency_key,
            worker_id,
            attempt,
        } => {
            let step = step_mut(instance, step_id)?;
            move_step(step, Dispatched, &[Pending, Blocked, Retrying])?;
            if *attempt != step.attempts + 1 {
                return Err(TransitionError::Inconsistent(format!(
                    "step '{step_id}' dispatched as attempt {attempt} after {} attempts",
                    step.attempts
                )));
            }
            step.attempts = *attempt;
            step.correlation_id = Some(*correlation_id);
            step.idempotency_key = Some(idempotency_key.clone());
            step.worker_id = Some(worker_id.clone());
            step.last_dispatched_at = Some(at);
            step.blocked_since = None;
            step.blocked_reason = None;
        }

        Transition::StepRedispatched {
            step_id,
            correlation_id,
        } => {
            let step = step_mut(instance, step_id)?;
            if step.correlation_id != Some(*correlation_id) {
                return Err(TransitionError::Inconsistent(format!(
                    "step '{step_id}' re-dispatched under a different correlation id"
                )));
            }
            move_step(step, Dispatched, &[UnknownOutcome])?;
            step.last_dispatched_at = Some(at);
        }

        Transition::StepAwaitingResult {
            step_id,
            correlation_id,
        } => {
            let step = step_mut(instance, step_id)?;
            if step.correlation_id != Some(*correlation_id) {
                return Err(TransitionError::Inconsistent(format!(
                    "step '{step_id}' acknowledged under a different correlation id"
                )));
            }
            move_step(step, AwaitingResult, &[Dispatched, UnknownOutcome])?;
        }

        Transition::StepBlocked { step_id, reason } => {
            let step = step_mut(instance, step_id)?;
            let was_dispatched = step.status == Dispatched;
            move_step(step, Blocked, &[Pending, Blocked, Retrying, Dispatched])?;
            if was_dispatched {
                // The unit never left; the attempt does not count.
                step.attempts = step.attempts.saturating_sub(1);
                step.correlation_id = None;
                step.idempotency_key = None;
            }
            if step.blocked_since.is_none() {
                step.blocked_since = Some(at);
            }
            step.blocked_reason = Some(reason.clone());
        }

        Transition::StepOutputReceived {
            step_id,
            result,
            output,
        } => {
            let step = step_mut(instance, step_id)?;
            move_step(step, AwaitingResult, &[Dispatched, AwaitingResult, UnknownOutcome])?;
            if step.candidate.is_some() {
                return Err(TransitionError::Inconsistent(format!(
                    "step '{step_id}' already holds an output awaiting a verdict"
                )));
            }
            step.last_result = Some(result.clone());
            step.candidate = Some(output.clone());
        }

        Transition::StepEvaluated { step_id, verdict } => {
            let step = step_mut(instance, step_id)?;
            if step.status != AwaitingResult || step.candidate.is_none() {
                return Err(TransitionError::Inconsistent(format!(
                    "step '{step_id}' evaluated without an output"
                )));
            }
            step.last_score = Some(verdict.score);
        }

        Transition::StepSucceeded {
            step_id,
            result,
            output,
        } => {
            let declared = instance
                .definition
                .step(step_id)
                .map(|s| s.outputs.clone())
                .unwrap_or_default();
            let step = step_mut(instance, step_id)?;
            let from: &[StepStatus] = if matches!(result, ResultRef::Children { count: 0 }) {
                &[Pending]
            } else {
                &[Dispatched, AwaitingResult, UnknownOutcome]
            };
            move_step(step, Succeeded, from)?;
            step.last_result = Some(result.clone());
            step.candidate = None;
            step.last_error = None;
            step.feedback.clear();
            bind_step_output(&mut instance.variables, step_id, &declared, output);
        }

        Transition::StepFailed { step_id, error } => {
            let step = step_mut(instance, step_id)?;
            move_step(
                step,
                Failed,
                &[Dispatched, AwaitingResult, UnknownOutcome, Blocked, Pending, Retrying],
            )?;
            step.last_error = Some(error.clone());
            step.candidate = None;
        }

        Transition::StepRetrying {
            step_id, feedback, ..
        } => {
            let step = step_mut(instance, step_id)?;
            move_step(step, Retrying, &[Failed])?;
            step.feedback = feedback.clone();
            step.correlation_id = None;
        }

        Transition::StepOutcomeUnknown {
            step_id,
            correlation_id,
        } => {
            let step = step_mut(instance, step_id)?;
            if step.correlation_id != Some(*correlation_id) {
                return Err(TransitionError::Inconsistent(format!(
                    "step '{step_id}' has no dispatch under {correlation_id}"
                )));
            }
            move_step(step, UnknownOutcome, &[Dispatched, AwaitingResult, UnknownOutcome])?;
        }

        Transition::ChildSpawned {
            step_id,
            child_id,
            index,
            budget,
            ..
        } => {
            let step = step_mut(instance, step_id)?;
            move_step(step, AwaitingResult, &[Pending, AwaitingResult])?;
            if step.children.iter().any(|c| c.child_id == *child_id || c.index == *index) {
                return Err(TransitionError::Inconsistent(format!(
                    "step '{step_id}' already spawned child {index}"
                )));
            }
            step.children.push(ChildRef {
                child_id: *child_id,
                index: *index,
                phase: None,
                output: None,
            });
            // The allocation is committed to the parent and never refunded.
            instance.spent.iterations = instance.spent.iterations.saturating_add(budget.max_iterations);
            instance.spent.external_calls = instance
                .spent
                .external_calls
                .saturating_add(budget.max_external_calls);
            instance.spent.spend = (instance.spent.spend + budget.max_spend).min(instance.budget.max_spend);
        }

        Transition::ChildTerminated {
            step_id,
            child_id,
            phase,
            output,
        } => {
            if !phase.is_terminal() {
                return Err(TransitionError::Inconsistent(format!(
                    "child {child_id} reported non-terminal phase {phase}"
                )));
            }
            let step = step_mut(instance, step_id)?;
            let child = step
                .children
                .iter_mut()
                .find(|c| c.child_id == *child_id)
                .ok_or_else(|| TransitionError::UnknownChild {
                    step_id: step_id.clone(),
                    child_id: *child_id,
                })?;
            child.phase = Some(*phase);
            child.output = output.clone();
        }

        Transition::BudgetCharged {
            iterations,
            external_calls,
            spend,
        } => {
            let spent = &mut instance.spent;
            spent.iterations = spent.iterations.saturating_add(*iterations);
            spent.external_calls = spent.external_calls.saturating_add(*external_calls);
            spent.spend += spend.max(0.0);
            if spent.iterations > instance.budget.max_iterations
                || spent.external_calls > instance.budget.max_external_calls
                || spent.spend > instance.budget.max_spend + f64::EPSILON
            {
                return Err(TransitionError::Inconsistent(
                    "charge exceeds the allocated budget".to_string(),
                ));
            }
        }

        Transition::Control { action } => match action {
            ControlAction::Pause => instance.paused = true,
            ControlAction::Resume => instance.paused = false,
            ControlAction::Cancel => instance.cancel_requested = true,
        },

        Transition::OutputsBound { outputs } => {
            for (name, value) in outputs {
                instance
                    .variables
                    .insert(format!("outputs.{name}"), value.clone());
            }
        }
    }
    Ok(())
}

/// Bind `steps.<id>.output` and every declared output found in it.
fn bind_step_output(
    variables: &mut BTreeMap<String, Value>,
    step_id: &str,
    declared: &[String],
    output: &Value,
) {
    variables.insert(format!("steps.{step_id}.output"), output.clone());
    for name in declared {
        if let Some(value) = output.get(name) {
            variables.insert(format!("steps.{step_id}.{name}"), value.clone());
        }
    }
}
