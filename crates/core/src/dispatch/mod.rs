//! Step dispatcher.
//!
//! Resolves a worker for an eligible step, renders its parameters, moves
//! oversized parameters into the artifact store and publishes the unit.
//! Publishing and the step timeout run as detached tasks that report back
//! through [`Callback`]s; the engine loop never waits on either.

use crate::definition::template::{self, TemplateError};
use crate::directory::{CapabilityDirectory, DirectoryError};
use crate::engine::continuation::Callback;
use crate::transport::{checksum, ArtifactError, ArtifactStore, TransportError, WorkerTransport};
use pe_protocol::bus_models::{ArtifactManifest, WorkUnit};
use pe_protocol::config_models::EngineSettings;
use pe_protocol::definition_models::{StepDefinition, StepKind};
use pe_protocol::instance_models::ProcessInstance;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;
use tracing::debug;
use uuid::Uuid;

/// Key under which quality feedback is attached to the next attempt.
pub const FEEDBACK_KEY: &str = "_feedback";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("no eligible worker for capability '{0}'")]
    NoEligibleWorker(String),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("failed to render parameters of step '{step_id}': {source}")]
    Render {
        step_id: String,
        source: TemplateError,
    },

    #[error("step '{0}' is not an action step")]
    NotAnAction(String),
}

impl DispatchError {
    /// Capacity problems block the step; everything else fails it.
    pub fn blocks(&self) -> bool {
        !matches!(
            self,
            DispatchError::Render { .. } | DispatchError::NotAnAction(_)
        )
    }
}

/// Stable across re-dispatches of the same attempt.
pub fn idempotency_key(instance_id: Uuid, step_id: &str, attempt: u32) -> String {
    format!("{instance_id}:{step_id}:{attempt}")
}

/// Manifest id for parameters offloaded under a correlation id.
fn params_manifest_id(correlation_id: Uuid) -> Uuid {
    let digest = blake3::hash(format!("params:{correlation_id}").as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest.as_bytes()[..16]);
    Uuid::from_bytes(bytes)
}

/// Render a step's parameter template and attach retry feedback.
///
/// # Errors
///
/// Returns [`DispatchError::Render`] when a reference is unbound.
pub fn render_params(
    step: &StepDefinition,
    variables: &BTreeMap<String, Value>,
    feedback: &[String],
) -> Result<Value, DispatchError> {
    let rendered =
        template::render_value(&step.params, variables).map_err(|source| DispatchError::Render {
            step_id: step.id.clone(),
            source,
        })?;
    if feedback.is_empty() {
        return Ok(rendered);
    }
    let feedback = json!(feedback);
    Ok(match rendered {
        Value::Object(mut map) => {
            map.insert(FEEDBACK_KEY.to_string(), feedback);
            Value::Object(map)
        }
        Value::Null => json!({ FEEDBACK_KEY: feedback }),
        other => json!({ "value": other, FEEDBACK_KEY: feedback }),
    })
}

/// Everything needed to publish one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedUnit {
    pub worker_id: String,
    pub action: String,
    pub params: Value,
}

#[derive(Clone)]
pub struct Dispatcher {
    directory: Arc<dyn CapabilityDirectory>,
    transport: Arc<dyn WorkerTransport>,
    artifacts: Arc<dyn ArtifactStore>,
    topic_prefix: String,
    reply_topic: String,
    inline_limit: usize,
}

impl Dispatcher {
    pub fn new(
        settings: &EngineSettings,
        directory: Arc<dyn CapabilityDirectory>,
        transport: Arc<dyn WorkerTransport>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            directory,
            transport,
            artifacts,
            topic_prefix: settings.dispatch_topic_prefix.clone(),
            reply_topic: settings.reply_topic.clone(),
            inline_limit: settings.inline_payload_limit,
        }
    }

    pub fn topic(&self, worker_id: &str) -> String {
        format!("{}{worker_id}", self.topic_prefix)
    }

    /// Pick a healthy worker. The list is rotated by attempt number so a
    /// retry prefers a different worker than the previous attempt.
    pub async fn resolve_worker(&self, capability: &str, attempt: u32) -> Result<String, DispatchError> {
        let workers = self.directory.healthy_workers(capability).await?;
        if workers.is_empty() {
            return Err(DispatchError::NoEligibleWorker(capability.to_string()));
        }
        let index = attempt.saturating_sub(1) as usize % workers.len();
        Ok(workers[index].clone())
    }

    /// Replace parameters larger than the inline limit with an artifact
    /// reference.
    pub async fn offload(
        &self,
        instance_id: Uuid,
        step_id: &str,
        correlation_id: Uuid,
        params: Value,
    ) -> Result<Value, DispatchError> {
        let bytes = params.to_string().into_bytes();
        if bytes.len() <= self.inline_limit {
            return Ok(params);
        }
        let size = bytes.len();
        let reference = self.artifacts.put(bytes).await?;

        let manifest = ArtifactManifest {
            id: params_manifest_id(correlation_id),
            instance_id,
            step_id: step_id.to_string(),
            reference: reference.clone(),
            metadata: BTreeMap::from([
                ("kind".to_string(), "params".to_string()),
                ("correlation_id".to_string(), correlation_id.to_string()),
            ]),
        };
        self.artifacts.register(manifest).await?;
        debug!(
            instance_id = %instance_id,
            step_id = %step_id,
            size,
            checksum = %reference.checksum,
            "Offloaded dispatch parameters"
        );
        Ok(json!({ "$artifact": reference }))
    }

    /// Resolve, render and offload one attempt of an action step.
    ///
    /// `worker_id` pins the worker (re-dispatch after an unknown outcome);
    /// otherwise one is resolved from the directory.
    pub async fn prepare(
        &self,
        instance: &ProcessInstance,
        step: &StepDefinition,
        attempt: u32,
        correlation_id: Uuid,
        worker_id: Option<&str>,
    ) -> Result<PreparedUnit, DispatchError> {
        let StepKind::Action { action, capability } = step.kind() else {
            return Err(DispatchError::NotAnAction(step.id.clone()));
        };
        let feedback = instance
            .step(&step.id)
            .map(|s| s.feedback.as_slice())
            .unwrap_or_default();
        let params = render_params(step, &instance.variables, feedback)?;
        let worker_id = match worker_id {
            Some(w) => w.to_string(),
            None => self.resolve_worker(capability, attempt).await?,
        };
        let params = self
            .offload(instance.id, &step.id, correlation_id, params)
            .await?;
        Ok(PreparedUnit {
            worker_id,
            action: action.to_string(),
            params,
        })
    }

    pub fn work_unit(
        &self,
        instance_id: Uuid,
        step_id: &str,
        attempt: u32,
        correlation_id: Uuid,
        idempotency_key: String,
        timeout_ms: u64,
        prepared: PreparedUnit,
    ) -> WorkUnit {
        WorkUnit {
            correlation_id,
            idempotency_key,
            instance_id,
            step_id: step_id.to_string(),
            attempt,
            worker_id: prepared.worker_id,
            action: prepared.action,
            params: prepared.params,
            reply_to: self.reply_topic.clone(),
            timeout_ms,
        }
    }

    /// Publish a unit in the background and arm its timeout.
    ///
    /// Returns the timer's abort handle; the publish task reports through
    /// `callbacks`.
    pub fn send(&self, unit: WorkUnit, callbacks: &UnboundedSender<Callback>) -> AbortHandle {
        let timer = arm_timeout(unit.correlation_id, unit.timeout_ms, callbacks.clone());
        let transport = Arc::clone(&self.transport);
        let topic = self.topic(&unit.worker_id);
        let tx = callbacks.clone();
        tokio::spawn(async move {
            let correlation_id = unit.correlation_id;
            let callback = match transport.publish(&topic, &unit).await {
                Ok(()) => Callback::Published { correlation_id },
                Err(error) => Callback::PublishFailed {
                    correlation_id,
                    error,
                },
            };
            let _ = tx.send(callback);
        });
        timer
    }
}

/// Fire `TimedOut` after `timeout_ms` unless aborted first.
pub fn arm_timeout(
    correlation_id: Uuid,
    timeout_ms: u64,
    callbacks: UnboundedSender<Callback>,
) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
        let _ = callbacks.send(Callback::TimedOut { correlation_id });
    })
    .abort_handle()
}

/// Verify offloaded content against its reference.
pub fn verify(content: &[u8], expected_checksum: &str) -> bool {
    checksum(content) == expected_checksum
}
