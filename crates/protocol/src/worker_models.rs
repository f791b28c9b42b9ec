//! Worker manifest models for `.process-kit/workers/*.md`.
//!
//! Workers are described by Markdown files with YAML front matter. The
//! front matter lists the capabilities the worker advertises; the body holds
//! free-form operator notes.

use serde::{Deserialize, Serialize};

/// A worker as seen by the capability directory.
///
/// # Example
///
/// ```markdown
/// ---
/// id: summarizer-1
/// description: Summarizes documents
/// capabilities: [summarize, style-judge]
/// ---
///
/// Runs on the GPU pool. Prefer for long documents.
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerManifest {
    /// Unique identifier, also used to derive the worker's dispatch topic.
    pub id: String,

    #[serde(default)]
    pub description: String,

    /// Capability names the worker can perform.
    pub capabilities: Vec<String>,

    /// Markdown body of the manifest file.
    #[serde(skip)]
    pub notes: String,
}

impl WorkerManifest {
    pub fn new<I, S>(id: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            description: String::new(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            notes: String::new(),
        }
    }

    pub fn can(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}
