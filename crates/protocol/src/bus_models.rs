//! Messages crossing the publish/subscribe bus and the artifact store.
//!
//! The engine publishes a [`WorkUnit`] to a worker topic and later receives a
//! [`WorkerReply`] carrying the same correlation id. Payloads larger than the
//! configured inline limit never travel on the bus; an [`ArtifactRef`]
//! pointing into the artifact store travels instead.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::definition_models::ErrorKind;

/// Location, checksum and size of content held by the artifact store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub location: String,
    /// Hex-encoded BLAKE3 digest of the content.
    pub checksum: String,
    pub size: u64,
}

/// Manifest entry registered for stored content.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ArtifactManifest {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub step_id: String,
    pub reference: ArtifactRef,
    /// Immutable metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Outbound unit of work.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkUnit {
    pub correlation_id: Uuid,
    /// Stable across re-dispatches of the same attempt; workers use it to
    /// suppress duplicate side effects.
    pub idempotency_key: String,
    pub instance_id: Uuid,
    pub step_id: String,
    pub attempt: u32,
    pub worker_id: String,
    pub action: String,
    /// Rendered parameters, or `{"$artifact": ArtifactRef}` when offloaded.
    pub params: Value,
    pub reply_to: String,
    pub timeout_ms: u64,
}

impl WorkUnit {
    /// Reference to offloaded parameters, if any.
    pub fn offloaded_params(&self) -> Option<ArtifactRef> {
        self.params
            .get("$artifact")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Output of a successful step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum OutputPayload {
    Inline(Value),
    Artifact(ArtifactRef),
}

/// Execution metrics reported by a worker.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ExecutionMetrics {
    #[serde(default)]
    pub duration_ms: u64,
    /// Cost charged against the instance's spend budget.
    #[serde(default)]
    pub cost: f64,
}

/// Inbound reply body.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplyOutcome {
    Success {
        output: OutputPayload,
        #[serde(default)]
        metrics: ExecutionMetrics,
    },
    Error {
        kind: ErrorKind,
        message: String,
        #[serde(default)]
        retryable: bool,
    },
}

/// Inbound reply correlated to a dispatched unit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerReply {
    pub correlation_id: Uuid,
    #[serde(default)]
    pub worker_id: String,
    pub outcome: ReplyOutcome,
}

impl WorkerReply {
    pub fn success(correlation_id: Uuid, output: Value) -> Self {
        Self {
            correlation_id,
            worker_id: String::new(),
            outcome: ReplyOutcome::Success {
                output: OutputPayload::Inline(output),
                metrics: ExecutionMetrics::default(),
            },
        }
    }

    /// Success whose output was left in the artifact store.
    pub fn artifact(correlation_id: Uuid, reference: ArtifactRef) -> Self {
        Self {
            correlation_id,
            worker_id: String::new(),
            outcome: ReplyOutcome::Success {
                output: OutputPayload::Artifact(reference),
                metrics: ExecutionMetrics::default(),
            },
        }
    }

    pub fn error(correlation_id: Uuid, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            correlation_id,
            worker_id: String::new(),
            outcome: ReplyOutcome::Error {
                kind,
                message: message.into(),
                retryable: true,
            },
        }
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        if let ReplyOutcome::Success { metrics, .. } = &mut self.outcome {
            metrics.cost = cost;
        }
        self
    }
}

/// What the transport knows about a previously published unit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// The transport cannot answer this query.
    Unsupported,
    /// No worker ever received the unit.
    NeverSeen,
    /// A worker holds the unit and has not replied yet.
    InProgress,
    /// The unit was executed; the stored reply is attached.
    Completed { reply: WorkerReply },
}
