//! Engine-level error taxonomy.

use crate::definition::template::TemplateError;
use crate::definition::ValidationReport;
use crate::dispatch::DispatchError;
use crate::graph::CompileError;
use crate::journal::JournalError;
use crate::state::TransitionError;
use pe_protocol::definition_models::ErrorKind;
use pe_protocol::instance_models::BudgetDimension;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The definition is structurally invalid. Never retried.
    #[error("invalid process definition: {0}")]
    Validation(#[from] ValidationReport),

    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("step '{step_id}' failed ({kind}): {message}")]
    Execution {
        step_id: String,
        kind: ErrorKind,
        message: String,
    },

    #[error("step '{step_id}' timed out after {timeout_ms} ms")]
    Timeout { step_id: String, timeout_ms: u64 },

    #[error("instance {instance_id} exhausted its {dimension} budget")]
    BudgetExhausted {
        instance_id: Uuid,
        dimension: BudgetDimension,
    },

    /// The instance's log cannot be reconstructed. The instance is
    /// quarantined; other instances are unaffected.
    #[error("instance {instance_id} is quarantined: {reason}")]
    RecoveryInconsistency { instance_id: Uuid, reason: String },

    #[error("instance {instance_id} escalated: {reason}")]
    Escalated { instance_id: Uuid, reason: String },

    #[error("instance {0} was cancelled")]
    Cancelled(Uuid),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("instance {0} not found")]
    InstanceNotFound(Uuid),

    #[error("engine has stopped")]
    EngineStopped,
}

pub type EngineResult<T> = Result<T, EngineError>;
