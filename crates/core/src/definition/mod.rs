//! Definition parsing and validation.
//!
//! A definition document goes through two stages before anything executes:
//! [`parser::parse_document`] checks the document's shape and builds a typed
//! [`ProcessDefinition`], then [`validator::validate`] checks its structure
//! (duplicate ids, dangling dependencies, cycles, unresolvable references,
//! policy bounds). Both stages collect every problem they find instead of
//! stopping at the first one, and neither has side effects.

pub mod parser;
pub mod template;
pub mod validator;

use pe_protocol::definition_models::ProcessDefinition;
use serde_json::Value;
use std::fmt;

/// Category of a validation issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueKind {
    /// Missing field, wrong type, or an undecodable document.
    Schema,
    DuplicateStep,
    UnknownDependency,
    /// A dependency cycle; the path starts and ends with the same step.
    Cycle(Vec<String>),
    UnresolvedReference,
    /// A retry, quality, planning or budget setting outside its bounds.
    InvalidPolicy,
}

/// A single problem found in a definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Location within the document, e.g. `steps[1].depends_on[0]`.
    pub path: String,
    pub kind: IssueKind,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Every issue found in one definition.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation issue(s)", self.issues.len())?;
        for issue in &self.issues {
            write!(f, "\n  - {issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationReport {}

impl ValidationReport {
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub(crate) fn push(&mut self, path: impl Into<String>, kind: IssueKind, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            path: path.into(),
            kind,
            message: message.into(),
        });
    }

    /// Cycle paths reported, in discovery order.
    pub fn cycles(&self) -> Vec<&[String]> {
        self.issues
            .iter()
            .filter_map(|i| match &i.kind {
                IssueKind::Cycle(path) => Some(path.as_slice()),
                _ => None,
            })
            .collect()
    }

    pub fn has(&self, kind: &IssueKind) -> bool {
        self.issues.iter().any(|i| &i.kind == kind)
    }

    pub(crate) fn into_result(self) -> Result<(), ValidationReport> {
        if self.issues.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

/// Parse and validate a structured document in one call.
///
/// # Example
///
/// ```rust
/// use pe_core::definition::load_definition;
/// use serde_json::json;
///
/// let doc = json!({
///     "name": "hello",
///     "steps": [ { "id": "greet", "action": "say", "params": { "text": "hi" } } ]
/// });
/// let definition = load_definition(&doc).expect("valid definition");
/// assert_eq!(definition.steps.len(), 1);
/// ```
pub fn load_definition(document: &Value) -> Result<ProcessDefinition, ValidationReport> {
    let definition = parser::parse_document(document)?;
    validator::validate(&definition)?;
    Ok(definition)
}
