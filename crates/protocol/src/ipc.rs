//! Control signals and engine events.
//!
//! The control surface accepts pause / resume / cancel signals addressed to
//! one instance or a whole subtree. The engine reports progress to observers
//! as [`Event`]s.
//!
//! Uses tagged enum serialization:
//! ```json
//! {
//!   "type": "phaseChanged",
//!   "payload": { "instance_id": "uuid-here", "phase": "executing" }
//! }
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::instance_models::{BudgetDimension, Phase, StepStatus};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
}

/// Which instances a signal addresses. Cancellation always reaches every
/// descendant regardless of scope.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ControlScope {
    #[default]
    Instance,
    Subtree,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ControlSignal {
    pub target: Uuid,
    pub action: ControlAction,
    #[serde(default)]
    pub scope: ControlScope,
}

impl ControlSignal {
    pub fn pause(target: Uuid) -> Self {
        Self {
            target,
            action: ControlAction::Pause,
            scope: ControlScope::Instance,
        }
    }

    pub fn resume(target: Uuid) -> Self {
        Self {
            target,
            action: ControlAction::Resume,
            scope: ControlScope::Instance,
        }
    }

    pub fn cancel(target: Uuid) -> Self {
        Self {
            target,
            action: ControlAction::Cancel,
            scope: ControlScope::Subtree,
        }
    }

    pub fn for_subtree(mut self) -> Self {
        self.scope = ControlScope::Subtree;
        self
    }
}

/// Events sent from the engine to observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Event {
    /// A root or child instance has been created.
    InstanceStarted {
        instance_id: Uuid,
        root_id: Uuid,
        parent_id: Option<Uuid>,
        name: String,
    },

    PhaseChanged {
        instance_id: Uuid,
        phase: Phase,
    },

    StepStatusChanged {
        instance_id: Uuid,
        step_id: String,
        status: StepStatus,
        attempt: u32,
    },

    InstanceCompleted {
        instance_id: Uuid,
    },

    /// Terminal-but-unsuccessful outcome requiring intervention.
    InstanceEscalated {
        instance_id: Uuid,
        reason: String,
    },

    InstanceFailed {
        instance_id: Uuid,
        reason: String,
    },

    /// Always surfaced; never silently absorbed.
    BudgetExhausted {
        instance_id: Uuid,
        dimension: BudgetDimension,
    },

    InstanceCancelled {
        instance_id: Uuid,
    },

    /// The instance's log could not be replayed. It is kept for inspection.
    InstanceQuarantined {
        instance_id: Uuid,
        error: String,
    },
}
