//! Outbound side of the worker bus and the artifact store.
//!
//! The engine publishes [`WorkUnit`]s through a [`WorkerTransport`]; replies
//! come back through [`crate::engine::EngineHandle::deliver_reply`]. The bus
//! adapter that bridges the two is external to the engine.

pub mod artifacts;

use async_trait::async_trait;
use pe_protocol::bus_models::{DeliveryStatus, WorkUnit};
use thiserror::Error;
use uuid::Uuid;

pub use artifacts::{checksum, ArtifactError, ArtifactStore, MemoryArtifactStore};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("transport rejected unit: {0}")]
    Rejected(String),
}

/// Topic-addressed publish side of the bus.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Publish a unit of work. Returns once the transport has accepted it.
    async fn publish(&self, topic: &str, unit: &WorkUnit) -> Result<(), TransportError>;

    /// What the transport knows about a unit, by correlation id.
    async fn query_status(&self, _correlation_id: Uuid) -> Result<DeliveryStatus, TransportError> {
        Ok(DeliveryStatus::Unsupported)
    }

    /// Whether a worker has already acted on an idempotency key.
    async fn check_idempotency(&self, _key: &str) -> Result<DeliveryStatus, TransportError> {
        Ok(DeliveryStatus::Unsupported)
    }
}
