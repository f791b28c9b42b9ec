//! The decision function.
//!
//! Given a step, its state, the retry policy in force, the budget check and
//! what just happened, [`decide`] says what the engine does next. The engine
//! turns the decision into transition records; the decision itself has no
//! side effects and no notion of time.

use pe_protocol::definition_models::{ErrorKind, RetryPolicy, StepDefinition, StepKind};
use pe_protocol::instance_models::{
    BudgetDimension, Phase, StepError, StepState, TerminationReason,
};
use pe_protocol::quality_models::QualityVerdict;

/// What prompted the decision.
#[derive(Debug, Clone, Copy)]
pub enum Trigger<'a> {
    /// Every dependency succeeded. `items` is the length of the list a loop
    /// step iterates over.
    Ready { items: Option<usize> },
    /// A worker replied, or the step timed out.
    Replied(Result<(), &'a StepError>),
    /// The quality loop scored the step's output.
    Verdict(&'a QualityVerdict),
}

#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    pub step: &'a StepDefinition,
    pub state: &'a StepState,
    pub retry: &'a RetryPolicy,
    /// Outcome of checking the budget for the next action.
    pub budget: Result<(), BudgetDimension>,
    pub trigger: Trigger<'a>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Dispatch the step, or accept its output.
    Proceed,
    /// Run the step again after `delay_ms`, carrying `feedback`.
    Retry { feedback: Vec<String>, delay_ms: u64 },
    /// Stop the instance.
    Escalate { reason: TerminationReason },
    /// Spawn child instances for a subprocess or loop step.
    SpawnChildren { count: usize },
}

pub fn decide(input: DecisionInput<'_>) -> Decision {
    match input.trigger {
        Trigger::Ready { items } => on_ready(&input, items),
        Trigger::Replied(Ok(())) => Decision::Proceed,
        Trigger::Replied(Err(error)) => on_failure(&input, error),
        Trigger::Verdict(verdict) => on_verdict(&input, verdict),
    }
}

fn exhausted(dimension: BudgetDimension) -> Decision {
    Decision::Escalate {
        reason: TerminationReason::BudgetExhausted { dimension },
    }
}

fn escalate_step(step_id: &str, message: String) -> Decision {
    Decision::Escalate {
        reason: TerminationReason::StepEscalated {
            step_id: step_id.to_string(),
            message,
        },
    }
}

fn on_ready(input: &DecisionInput<'_>, items: Option<usize>) -> Decision {
    if let Err(dimension) = input.budget {
        return exhausted(dimension);
    }
    match input.step.kind() {
        StepKind::Action { .. } => Decision::Proceed,
        StepKind::Subprocess(_) => Decision::SpawnChildren { count: 1 },
        StepKind::Loop(_) => Decision::SpawnChildren {
            count: items.unwrap_or(0),
        },
    }
}

fn on_failure(input: &DecisionInput<'_>, error: &StepError) -> Decision {
    let step_id = input.step.id.as_str();
    if !matches!(input.step.kind(), StepKind::Action { .. }) {
        return escalate_step(step_id, error.message.clone());
    }
    if !input.retry.retries(error.kind) {
        return escalate_step(step_id, format!("{}: {}", error.kind, error.message));
    }
    if input.state.attempts >= input.retry.max_attempts {
        return escalate_step(
            step_id,
            format!(
                "retries exhausted after {} attempts: {}",
                input.state.attempts, error.message
            ),
        );
    }
    if let Err(dimension) = input.budget {
        return exhausted(dimension);
    }
    Decision::Retry {
        feedback: input.state.feedback.clone(),
        delay_ms: input.retry.backoff_ms(input.state.attempts + 1),
    }
}

/// Pass, then attempt ceiling, then budget.
fn on_verdict(input: &DecisionInput<'_>, verdict: &QualityVerdict) -> Decision {
    if verdict.passed() {
        return Decision::Proceed;
    }
    let step_id = input.step.id.as_str();
    let ceiling = input
        .step
        .quality
        .as_ref()
        .map_or(input.retry.max_attempts, |q| q.max_attempts);
    if input.state.attempts >= ceiling {
        return Decision::Escalate {
            reason: TerminationReason::QualityCeiling {
                step_id: step_id.to_string(),
                score: verdict.score,
            },
        };
    }
    if let Err(dimension) = input.budget {
        return exhausted(dimension);
    }
    if !input.retry.retries(ErrorKind::QualityRejected) {
        return escalate_step(
            step_id,
            format!("output rejected with score {:.2}", verdict.score),
        );
    }
    Decision::Retry {
        feedback: verdict.feedback.clone(),
        delay_ms: input.retry.backoff_ms(input.state.attempts + 1),
    }
}

/// Terminal phase an escalation ends in.
pub fn terminal_phase(reason: &TerminationReason) -> Phase {
    match reason {
        TerminationReason::AllStepsSucceeded => Phase::Completed,
        TerminationReason::BudgetExhausted { .. } => Phase::Failed,
        TerminationReason::Cancelled | TerminationReason::ParentTerminated { .. } => {
            Phase::Cancelled
        }
        _ => Phase::Escalated,
    }
}
