//! Runtime process instance models.
//!
//! A [`ProcessInstance`] is one live execution of a process definition, or of
//! a nested subprocess thereof. Instances form a tree addressed by id; every
//! instance knows its root, its depth and the ids of all of its ancestors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::bus_models::ArtifactRef;
use crate::definition_models::{ErrorKind, ProcessDefinition};

/// Lifecycle phase of a process instance.
///
/// Normal progression:
/// Pending -> (Planning) -> Executing <-> Evaluating -> Finalizing -> Completed
///
/// Failed, Escalated and Cancelled are terminal as well.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Planning,
    Executing,
    Evaluating,
    Finalizing,
    Completed,
    Failed,
    Escalated,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Phase::Completed | Phase::Failed | Phase::Escalated | Phase::Cancelled
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Pending => "pending",
            Phase::Planning => "planning",
            Phase::Executing => "executing",
            Phase::Evaluating => "evaluating",
            Phase::Finalizing => "finalizing",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Escalated => "escalated",
            Phase::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Status of a single step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    /// No eligible worker, or the transport refused the unit.
    Blocked,
    Dispatched,
    AwaitingResult,
    /// Dispatched before a restart; the outcome is being resolved.
    UnknownOutcome,
    Succeeded,
    Failed,
    Retrying,
}

impl StepStatus {
    /// A reply, a verdict or children are outstanding for the step.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            StepStatus::Dispatched | StepStatus::AwaitingResult | StepStatus::UnknownOutcome
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Blocked => "blocked",
            StepStatus::Dispatched => "dispatched",
            StepStatus::AwaitingResult => "awaiting_result",
            StepStatus::UnknownOutcome => "unknown_outcome",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Retrying => "retrying",
        };
        f.write_str(s)
    }
}

/// Pointer to a step result. Payloads never live in step state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultRef {
    /// Small payload delivered inline with the reply; the value itself is
    /// bound into the instance variables.
    Inline { correlation_id: Uuid, size: u64 },
    /// Payload held by the external artifact store.
    Artifact(ArtifactRef),
    /// Aggregated outputs of child instances.
    Children { count: usize },
}

/// Recorded failure of a step attempt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
    /// Worker hint, recorded for operators. Retry decisions ignore it.
    #[serde(default)]
    pub retryable: bool,
}

/// A child instance spawned by a subprocess or loop step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChildRef {
    pub child_id: Uuid,
    pub index: usize,
    /// Terminal phase once the parent has observed it.
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub output: Option<Value>,
}

/// Runtime state of one step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepState {
    pub step_id: String,
    pub status: StepStatus,
    /// Number of dispatches so far.
    pub attempts: u32,
    pub last_dispatched_at: Option<DateTime<Utc>>,
    pub correlation_id: Option<Uuid>,
    pub idempotency_key: Option<String>,
    pub worker_id: Option<String>,
    pub last_result: Option<ResultRef>,
    pub last_score: Option<f64>,
    /// Output received and awaiting a quality verdict.
    #[serde(default)]
    pub candidate: Option<Value>,
    pub last_error: Option<StepError>,
    /// Feedback attached to the next attempt's parameters.
    pub feedback: Vec<String>,
    pub blocked_since: Option<DateTime<Utc>>,
    pub blocked_reason: Option<String>,
    pub children: Vec<ChildRef>,
}

impl StepState {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            attempts: 0,
            last_dispatched_at: None,
            correlation_id: None,
            idempotency_key: None,
            worker_id: None,
            last_result: None,
            last_score: None,
            candidate: None,
            last_error: None,
            feedback: Vec::new(),
            blocked_since: None,
            blocked_reason: None,
            children: Vec::new(),
        }
    }
}

/// Resource ledger limits.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Budget {
    pub max_iterations: u32,
    pub max_external_calls: u32,
    pub max_spend: f64,
    pub max_wall_clock_ms: u64,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_iterations: 1_000,
            max_external_calls: 1_000,
            max_spend: 100.0,
            max_wall_clock_ms: 3_600_000,
        }
    }
}

/// Spent-so-far counters. Never decrease.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Spent {
    pub iterations: u32,
    pub external_calls: u32,
    pub spend: f64,
}

/// Which budget dimension ran out.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDimension {
    Iterations,
    ExternalCalls,
    Spend,
    WallClock,
}

impl std::fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BudgetDimension::Iterations => "iterations",
            BudgetDimension::ExternalCalls => "external calls",
            BudgetDimension::Spend => "spend",
            BudgetDimension::WallClock => "wall clock",
        };
        f.write_str(s)
    }
}

/// Why an instance reached a terminal phase.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminationReason {
    AllStepsSucceeded,
    StepEscalated { step_id: String, message: String },
    QualityCeiling { step_id: String, score: f64 },
    BlockedTooLong { step_id: String },
    BudgetExhausted { dimension: BudgetDimension },
    Cancelled,
    DepthExceeded { step_id: String, depth: u32 },
    PlanningFailed { message: String },
    ParentTerminated { parent_id: Uuid },
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::AllStepsSucceeded => write!(f, "all steps succeeded"),
            TerminationReason::StepEscalated { step_id, message } => {
                write!(f, "step '{step_id}' escalated: {message}")
            }
            TerminationReason::QualityCeiling { step_id, score } => write!(
                f,
                "step '{step_id}' reached its quality attempt ceiling (last score {score:.2})"
            ),
            TerminationReason::BlockedTooLong { step_id } => {
                write!(f, "step '{step_id}' stayed blocked past the ceiling")
            }
            TerminationReason::BudgetExhausted { dimension } => {
                write!(f, "budget exhausted: {dimension}")
            }
            TerminationReason::Cancelled => write!(f, "cancelled"),
            TerminationReason::DepthExceeded { step_id, depth } => {
                write!(f, "step '{step_id}' would nest beyond depth {depth}")
            }
            TerminationReason::PlanningFailed { message } => write!(f, "planning failed: {message}"),
            TerminationReason::ParentTerminated { parent_id } => {
                write!(f, "parent {parent_id} terminated")
            }
        }
    }
}

/// Link from a child instance to the step that spawned it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParentLink {
    pub instance_id: Uuid,
    pub step_id: String,
    /// Position among the step's children.
    pub index: usize,
}

/// The mutable runtime unit.
///
/// Mutated only by the state machine; every mutation corresponds to one
/// record of the instance's transition log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessInstance {
    pub id: Uuid,
    pub parent: Option<ParentLink>,
    pub root_id: Uuid,
    /// Root is 0.
    pub depth: u32,
    /// Ancestor ids from the root down to the direct parent.
    pub path: Vec<Uuid>,
    pub definition: ProcessDefinition,
    pub phase: Phase,
    pub steps: BTreeMap<String, StepState>,
    pub variables: BTreeMap<String, Value>,
    pub budget: Budget,
    pub spent: Spent,
    pub paused: bool,
    pub cancel_requested: bool,
    pub outcome: Option<TerminationReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Sequence number of the last applied transition.
    pub last_seq: u64,
}

impl ProcessInstance {
    pub fn parent_id(&self) -> Option<Uuid> {
        self.parent.as_ref().map(|p| p.instance_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn step(&self, id: &str) -> Option<&StepState> {
        self.steps.get(id)
    }

    /// Steps with a reply, verdict or children outstanding.
    pub fn in_flight_steps(&self) -> impl Iterator<Item = &StepState> {
        self.steps.values().filter(|s| s.status.is_in_flight())
    }

    /// Bound definition outputs, as a JSON object.
    pub fn outputs(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .variables
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix("outputs.")
                    .map(|name| (name.to_string(), v.clone()))
            })
            .collect();
        Value::Object(map)
    }
}
