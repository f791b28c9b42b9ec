//! Transition log records.
//!
//! Every change to a process instance is expressed as a [`Transition`] and
//! appended to the instance's log before any external effect of the change
//! happens. Replaying the log in order rebuilds the instance exactly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::definition_models::ProcessDefinition;
use crate::instance_models::{Budget, ParentLink, Phase, ResultRef, StepError, TerminationReason};
use crate::ipc::ControlAction;
use crate::quality_models::QualityVerdict;

/// One state change of one instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transition {
    /// Always the first record of a log.
    Created {
        definition: ProcessDefinition,
        parent: Option<ParentLink>,
        root_id: Uuid,
        depth: u32,
        path: Vec<Uuid>,
        budget: Budget,
        variables: BTreeMap<String, Value>,
    },
    PhaseChanged {
        to: Phase,
        #[serde(default)]
        reason: Option<TerminationReason>,
    },
    /// Collaborative planning produced the definition to execute.
    PlanSynthesized {
        definition: ProcessDefinition,
        cached: bool,
    },
    StepDispatched {
        step_id: String,
        correlation_id: Uuid,
        idempotency_key: String,
        worker_id: String,
        attempt: u32,
    },
    /// Same unit, same correlation id, sent again after an unknown outcome.
    StepRedispatched {
        step_id: String,
        correlation_id: Uuid,
    },
    /// The transport accepted the unit (or a worker holds it).
    StepAwaitingResult {
        step_id: String,
        correlation_id: Uuid,
    },
    StepBlocked {
        step_id: String,
        reason: String,
    },
    /// Output received for a step gated by a quality policy.
    StepOutputReceived {
        step_id: String,
        result: ResultRef,
        output: Value,
    },
    StepEvaluated {
        step_id: String,
        verdict: QualityVerdict,
    },
    StepSucceeded {
        step_id: String,
        result: ResultRef,
        output: Value,
    },
    StepFailed {
        step_id: String,
        error: StepError,
    },
    StepRetrying {
        step_id: String,
        #[serde(default)]
        feedback: Vec<String>,
        delay_ms: u64,
    },
    /// In flight when the engine stopped; resolution pending.
    StepOutcomeUnknown {
        step_id: String,
        correlation_id: Uuid,
    },
    ChildSpawned {
        step_id: String,
        child_id: Uuid,
        index: usize,
        budget: Budget,
        #[serde(default)]
        bindings: BTreeMap<String, Value>,
    },
    ChildTerminated {
        step_id: String,
        child_id: Uuid,
        phase: Phase,
        #[serde(default)]
        output: Option<Value>,
    },
    BudgetCharged {
        #[serde(default)]
        iterations: u32,
        #[serde(default)]
        external_calls: u32,
        #[serde(default)]
        spend: f64,
    },
    Control {
        action: ControlAction,
    },
    OutputsBound {
        outputs: BTreeMap<String, Value>,
    },
}

impl Transition {
    /// Step the transition concerns, if any.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Transition::StepDispatched { step_id, .. }
            | Transition::StepRedispatched { step_id, .. }
            | Transition::StepAwaitingResult { step_id, .. }
            | Transition::StepBlocked { step_id, .. }
            | Transition::StepOutputReceived { step_id, .. }
            | Transition::StepEvaluated { step_id, .. }
            | Transition::StepSucceeded { step_id, .. }
            | Transition::StepFailed { step_id, .. }
            | Transition::StepRetrying { step_id, .. }
            | Transition::StepOutcomeUnknown { step_id, .. }
            | Transition::ChildSpawned { step_id, .. }
            | Transition::ChildTerminated { step_id, .. } => Some(step_id),
            _ => None,
        }
    }
}

/// A persisted transition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransitionRecord {
    pub instance_id: Uuid,
    /// Contiguous per instance, starting at 0.
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub transition: Transition,
}
