//! Process definition models.
//!
//! A process definition is the immutable, author-supplied description of a
//! unit of work as a graph of steps. Definitions are usually loaded from
//! `.process-kit/processes/*.yaml`, but any structured document that
//! deserializes into these types is accepted.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::instance_models::Budget;
use crate::quality_models::QualityPolicy;

/// A named, ordered set of steps plus the metadata needed to execute them.
///
/// # Example
///
/// ```yaml
/// name: summarize
/// inputs: [topic]
/// outputs:
///   summary: "{{steps.write.output}}"
/// steps:
///   - id: gather
///     action: search
///     params: { query: "{{inputs.topic}}" }
///   - id: write
///     action: summarize
///     depends_on: [gather]
///     params: { items: "{{steps.gather.output}}" }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessDefinition {
    /// Human-readable name of the process.
    pub name: String,

    /// Names of the inputs a caller must (or may) bind at submission time.
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Steps in declaration order. Declaration order breaks ties when
    /// several steps become eligible at the same time.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,

    /// Named outputs rendered from templates once every step succeeded.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,

    /// Trivial processes never go through collaborative planning.
    #[serde(default)]
    pub trivial: bool,

    /// Optional collaborative planning phase.
    #[serde(default)]
    pub planning: Option<PlanningSpec>,

    /// Optional budget override. The engine default applies otherwise.
    #[serde(default)]
    pub budget: Option<Budget>,
}

impl ProcessDefinition {
    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// One step of a process definition.
///
/// A step is exactly one of: an action dispatched to a worker, a nested
/// subprocess, or a loop spawning one subprocess per element of a list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepDefinition {
    pub id: String,

    /// Action name sent to the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// Capability used to route the step. Defaults to the action name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,

    /// Parameter template. Strings may contain `{{...}}` references.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Declared output names, addressable as `steps.<id>.<name>`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subprocess: Option<Box<ProcessDefinition>>,

    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_spec: Option<LoopSpec>,
}

/// Borrowed view of what a step actually does.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepKind<'a> {
    Action { action: &'a str, capability: &'a str },
    Subprocess(&'a ProcessDefinition),
    Loop(&'a LoopSpec),
}

impl StepDefinition {
    /// Create an action step with no parameters or dependencies.
    pub fn action(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: Some(action.into()),
            capability: None,
            params: Value::Null,
            depends_on: Vec::new(),
            outputs: Vec::new(),
            timeout_ms: None,
            retry: None,
            quality: None,
            subprocess: None,
            loop_spec: None,
        }
    }

    /// Create a subprocess step.
    pub fn subprocess(id: impl Into<String>, definition: ProcessDefinition) -> Self {
        Self {
            action: None,
            subprocess: Some(Box::new(definition)),
            ..Self::action(id, "")
        }
    }

    /// Create a loop step spawning `body` once per element of `over`.
    pub fn loop_over(
        id: impl Into<String>,
        over: impl Into<String>,
        body: ProcessDefinition,
    ) -> Self {
        Self {
            action: None,
            loop_spec: Some(LoopSpec {
                over: over.into(),
                body: Box::new(body),
            }),
            ..Self::action(id, "")
        }
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_quality(mut self, quality: QualityPolicy) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Classify the step. Subprocess and loop payloads take precedence over
    /// the action name, which validation guarantees is absent for them.
    pub fn kind(&self) -> StepKind<'_> {
        if let Some(def) = &self.subprocess {
            return StepKind::Subprocess(def);
        }
        if let Some(spec) = &self.loop_spec {
            return StepKind::Loop(spec);
        }
        let action = self.action.as_deref().unwrap_or_default();
        StepKind::Action {
            action,
            capability: self.capability.as_deref().unwrap_or(action),
        }
    }

    /// Nested definition carried by a subprocess or loop step.
    pub fn nested_definition(&self) -> Option<&ProcessDefinition> {
        match self.kind() {
            StepKind::Subprocess(def) => Some(def),
            StepKind::Loop(spec) => Some(&spec.body),
            StepKind::Action { .. } => None,
        }
    }
}

/// Loop-over-subprocess construct.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoopSpec {
    /// Reference to a JSON array, e.g. `{{steps.gather.items}}`.
    pub over: String,

    /// Definition instantiated once per element, with `loop.item` and
    /// `loop.index` bound.
    #[serde(rename = "subprocess")]
    pub body: Box<ProcessDefinition>,
}

/// Error kinds a step failure can carry.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No reply arrived before the step deadline.
    Timeout,
    /// The worker reported a failure while executing.
    WorkerError,
    /// The worker rejected the parameters it was given.
    InvalidInput,
    /// A resource the worker needed was unavailable.
    ResourceUnavailable,
    /// The quality loop rejected the output.
    QualityRejected,
    /// One or more child instances did not complete.
    ChildFailed,
    /// Anything the engine could not classify.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::WorkerError => "worker_error",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::ResourceUnavailable => "resource_unavailable",
            ErrorKind::QualityRejected => "quality_rejected",
            ErrorKind::ChildFailed => "child_failed",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Bounded retry behaviour for a step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of dispatch attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Error kinds the engine retries. Everything else escalates.
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<ErrorKind>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_retry_on() -> Vec<ErrorKind> {
    vec![
        ErrorKind::Timeout,
        ErrorKind::WorkerError,
        ErrorKind::ResourceUnavailable,
        ErrorKind::QualityRejected,
        ErrorKind::Internal,
    ]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            retry_on: default_retry_on(),
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` attempts and a fixed short backoff.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, initial_ms: u64, multiplier: f64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.multiplier = multiplier;
        self.max_backoff_ms = max_ms;
        self
    }

    /// Delay before attempt `next_attempt` (the first retry is attempt 2).
    pub fn backoff_ms(&self, next_attempt: u32) -> u64 {
        let exponent = next_attempt.saturating_sub(2);
        let factor = self.multiplier.max(1.0).powi(exponent as i32);
        let delay = (self.initial_backoff_ms as f64 * factor).round();
        if delay.is_finite() {
            (delay as u64).min(self.max_backoff_ms)
        } else {
            self.max_backoff_ms
        }
    }

    pub fn retries(&self, kind: ErrorKind) -> bool {
        self.retry_on.contains(&kind)
    }
}

/// Optional collaborative planning phase.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlanningSpec {
    /// What the plan should achieve; sent to every proposer.
    pub goal: String,

    /// Capability advertised by workers able to propose plan fragments.
    pub proposer_capability: String,

    /// Maximum nesting depth of recursive decomposition.
    #[serde(default = "default_planning_depth")]
    pub max_depth: u32,

    /// Minimum number of usable proposals for planning to succeed.
    #[serde(default = "default_min_proposals")]
    pub min_proposals: usize,
}

fn default_planning_depth() -> u32 {
    2
}

fn default_min_proposals() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_kind_defaults_capability_to_action() {
        let step = StepDefinition::action("a", "search");
        assert_eq!(
            step.kind(),
            StepKind::Action {
                action: "search",
                capability: "search"
            }
        );

        let routed = step.with_capability("web-search");
        assert_eq!(
            routed.kind(),
            StepKind::Action {
                action: "search",
                capability: "web-search"
            }
        );
    }

    #[test]
    fn test_loop_step_deserializes_from_loop_key() {
        let step: StepDefinition = serde_json::from_value(json!({
            "id": "each",
            "loop": {
                "over": "{{steps.a.output}}",
                "subprocess": { "name": "body", "steps": [ { "id": "x", "action": "noop" } ] }
            }
        }))
        .unwrap();

        match step.kind() {
            StepKind::Loop(spec) => {
                assert_eq!(spec.over, "{{steps.a.output}}");
                assert_eq!(spec.body.steps.len(), 1);
            }
            other => panic!("expected loop step, got {other:?}"),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::attempts(5).with_backoff(100, 2.0, 350);
        assert_eq!(policy.backoff_ms(2), 100);
        assert_eq!(policy.backoff_ms(3), 200);
        assert_eq!(policy.backoff_ms(4), 350);
    }

    #[test]
    fn test_default_retry_policy_does_not_retry_invalid_input() {
        let policy = RetryPolicy::default();
        assert!(policy.retries(ErrorKind::Timeout));
        assert!(!policy.retries(ErrorKind::InvalidInput));
    }
}
