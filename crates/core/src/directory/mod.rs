//! Capability directory client.
//!
//! The engine only ever reads the directory: given a capability, which
//! workers can perform it right now. Registering workers is the directory's
//! own business.

use async_trait::async_trait;
use pe_protocol::worker_models::WorkerManifest;
use std::collections::HashSet;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("capability directory unavailable: {0}")]
    Unavailable(String),
}

/// Read-only view of an external worker registry.
#[async_trait]
pub trait CapabilityDirectory: Send + Sync {
    /// Identifiers of currently healthy workers advertising `capability`.
    /// An empty list is a normal answer, not an error.
    async fn healthy_workers(&self, capability: &str) -> Result<Vec<String>, DirectoryError>;
}

/// Directory backed by a fixed set of worker manifests.
///
/// Health is tracked locally so operators (and tests) can take workers in
/// and out of rotation.
pub struct StaticDirectory {
    workers: Vec<WorkerManifest>,
    unhealthy: RwLock<HashSet<String>>,
}

impl StaticDirectory {
    /// Create a directory from worker manifests, usually the ones loaded
    /// from `.process-kit/workers/*.md`.
    ///
    /// # Arguments
    ///
    /// * `workers` - Manifests in preference order
    pub fn new(workers: Vec<WorkerManifest>) -> Self {
        Self {
            workers,
            unhealthy: RwLock::new(HashSet::new()),
        }
    }

    pub fn workers(&self) -> &[WorkerManifest] {
        &self.workers
    }

    pub async fn mark_unhealthy(&self, worker_id: &str) {
        self.unhealthy.write().await.insert(worker_id.to_string());
    }

    pub async fn mark_healthy(&self, worker_id: &str) {
        self.unhealthy.write().await.remove(worker_id);
    }
}

#[async_trait]
impl CapabilityDirectory for StaticDirectory {
    async fn healthy_workers(&self, capability: &str) -> Result<Vec<String>, DirectoryError> {
        let unhealthy = self.unhealthy.read().await;
        Ok(self
            .workers
            .iter()
            .filter(|w| w.can(capability) && !unhealthy.contains(&w.id))
            .map(|w| w.id.clone())
            .collect())
    }
}
