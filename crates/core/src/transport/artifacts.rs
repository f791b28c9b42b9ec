//! Artifact store interface and an in-memory implementation.
//!
//! Content is addressed by its BLAKE3 checksum. Registration of a manifest is
//! the durable fact; "registered" and "exists" mean the same thing.

use async_trait::async_trait;
use pe_protocol::bus_models::{ArtifactManifest, ArtifactRef};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    #[error("artifact store unavailable: {0}")]
    Unavailable(String),

    #[error("checksum mismatch for {location}")]
    ChecksumMismatch { location: String },

    #[error("artifact not found: {0}")]
    NotFound(String),
}

/// Hex BLAKE3 digest used as the artifact checksum.
pub fn checksum(content: &[u8]) -> String {
    blake3::hash(content).to_hex().to_string()
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write content and return where it lives.
    async fn put(&self, content: Vec<u8>) -> Result<ArtifactRef, ArtifactError>;

    async fn fetch(&self, reference: &ArtifactRef) -> Result<Vec<u8>, ArtifactError>;

    /// Register a manifest entry. Committed atomically; registering the same
    /// manifest id twice is a no-op.
    async fn register(&self, manifest: ArtifactManifest) -> Result<(), ArtifactError>;

    async fn exists(&self, manifest_id: Uuid) -> Result<bool, ArtifactError>;
}

/// Process-local artifact store.
#[derive(Default)]
pub struct MemoryArtifactStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    manifests: Mutex<HashMap<Uuid, ArtifactManifest>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn manifest(&self, id: Uuid) -> Option<ArtifactManifest> {
        self.manifests.lock().await.get(&id).cloned()
    }

    pub async fn manifest_count(&self) -> usize {
        self.manifests.lock().await.len()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, content: Vec<u8>) -> Result<ArtifactRef, ArtifactError> {
        let sum = checksum(&content);
        let reference = ArtifactRef {
            location: format!("mem://{sum}"),
            checksum: sum,
            size: content.len() as u64,
        };
        self.blobs
            .lock()
            .await
            .insert(reference.location.clone(), content);
        Ok(reference)
    }

    async fn fetch(&self, reference: &ArtifactRef) -> Result<Vec<u8>, ArtifactError> {
        let content = self
            .blobs
            .lock()
            .await
            .get(&reference.location)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(reference.location.clone()))?;
        if checksum(&content) != reference.checksum {
            return Err(ArtifactError::ChecksumMismatch {
                location: reference.location.clone(),
            });
        }
        Ok(content)
    }

    async fn register(&self, manifest: ArtifactManifest) -> Result<(), ArtifactError> {
        self.manifests
            .lock()
            .await
            .entry(manifest.id)
            .or_insert(manifest);
        Ok(())
    }

    async fn exists(&self, manifest_id: Uuid) -> Result<bool, ArtifactError> {
        Ok(self.manifests.lock().await.contains_key(&manifest_id))
    }
}
