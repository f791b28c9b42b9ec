//! Cloneable handle to a running engine.

use super::continuation::Callback;
use crate::definition::load_definition;
use crate::error::{EngineError, EngineResult};
use pe_protocol::bus_models::WorkerReply;
use pe_protocol::definition_models::ProcessDefinition;
use pe_protocol::instance_models::{Phase, ProcessInstance, TerminationReason};
use pe_protocol::ipc::ControlSignal;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

pub(crate) enum Command {
    Submit {
        definition: ProcessDefinition,
        inputs: BTreeMap<String, Value>,
        reply: oneshot::Sender<EngineResult<Uuid>>,
    },
    Control {
        signal: ControlSignal,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    Snapshot {
        instance_id: Uuid,
        reply: oneshot::Sender<EngineResult<ProcessInstance>>,
    },
    Descendants {
        instance_id: Uuid,
        reply: oneshot::Sender<EngineResult<Vec<Uuid>>>,
    },
    WaitTerminal {
        instance_id: Uuid,
        reply: oneshot::Sender<EngineResult<ProcessInstance>>,
    },
    Quarantined {
        reply: oneshot::Sender<Vec<(Uuid, String)>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// The in-process API of the engine.
///
/// Every call is a message to the engine task; the handle holds no state of
/// its own and can be cloned freely. Worker replies enter the engine only
/// through [`EngineHandle::deliver_reply`].
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    callbacks: mpsc::UnboundedSender<Callback>,
}

impl EngineHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        callbacks: mpsc::UnboundedSender<Callback>,
    ) -> Self {
        Self {
            commands,
            callbacks,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> EngineResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| EngineError::EngineStopped)?;
        rx.await.map_err(|_| EngineError::EngineStopped)
    }

    /// Validate a definition and start a root instance.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Validation` with every issue found when the
    /// definition is invalid or a declared input is not bound.
    pub async fn submit(
        &self,
        definition: ProcessDefinition,
        inputs: BTreeMap<String, Value>,
    ) -> EngineResult<Uuid> {
        self.request(|reply| Command::Submit {
            definition,
            inputs,
            reply,
        })
        .await?
    }

    /// Parse, validate and submit a structured document.
    pub async fn submit_document(
        &self,
        document: &Value,
        inputs: BTreeMap<String, Value>,
    ) -> EngineResult<Uuid> {
        let definition = load_definition(document)?;
        self.submit(definition, inputs).await
    }

    pub async fn control(&self, signal: ControlSignal) -> EngineResult<()> {
        self.request(|reply| Command::Control { signal, reply })
            .await?
    }

    /// Current state of one instance.
    pub async fn snapshot(&self, instance_id: Uuid) -> EngineResult<ProcessInstance> {
        self.request(|reply| Command::Snapshot { instance_id, reply })
            .await?
    }

    /// Every descendant of an instance, breadth first.
    pub async fn descendants(&self, instance_id: Uuid) -> EngineResult<Vec<Uuid>> {
        self.request(|reply| Command::Descendants { instance_id, reply })
            .await?
    }

    /// Wait until an instance reaches a terminal phase.
    pub async fn wait_terminal(&self, instance_id: Uuid) -> EngineResult<ProcessInstance> {
        self.request(|reply| Command::WaitTerminal { instance_id, reply })
            .await?
    }

    /// Submit, wait, and turn the outcome into a result.
    ///
    /// # Errors
    ///
    /// Escalation, budget exhaustion and cancellation surface as errors.
    pub async fn run_to_completion(
        &self,
        definition: ProcessDefinition,
        inputs: BTreeMap<String, Value>,
    ) -> EngineResult<Value> {
        let id = self.submit(definition, inputs).await?;
        let instance = self.wait_terminal(id).await?;
        outcome(&instance)
    }

    /// Hand a worker reply to the engine.
    pub fn deliver_reply(&self, reply: WorkerReply) -> EngineResult<()> {
        self.callbacks
            .send(Callback::Reply(reply))
            .map_err(|_| EngineError::EngineStopped)
    }

    /// Instances whose logs could not be replayed, with the reason.
    pub async fn quarantined(&self) -> EngineResult<Vec<(Uuid, String)>> {
        self.request(|reply| Command::Quarantined { reply }).await
    }

    pub async fn shutdown(&self) -> EngineResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Map a terminal instance onto a result.
pub fn outcome(instance: &ProcessInstance) -> EngineResult<Value> {
    let reason = instance
        .outcome
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| instance.phase.to_string());
    match (instance.phase, &instance.outcome) {
        (Phase::Completed, _) => Ok(instance.outputs()),
        (_, Some(TerminationReason::BudgetExhausted { dimension })) => {
            Err(EngineError::BudgetExhausted {
                instance_id: instance.id,
                dimension: *dimension,
            })
        }
        (Phase::Cancelled, _) => Err(EngineError::Cancelled(instance.id)),
        _ => Err(EngineError::Escalated {
            instance_id: instance.id,
            reason,
        }),
    }
}
