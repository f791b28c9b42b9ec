//! Collaborative planning.
//!
//! Before executing a definition that carries a `planning` section, the
//! engine asks every healthy worker advertising the proposer capability for
//! a plan fragment, in parallel, and merges the answers with
//! [`synthesis::merge`]. The merged plan is then decomposed: each action step
//! is offered back to the proposers as a unit, and a unit they split up is
//! replaced by a subprocess step. Decomposition walks an explicit work queue
//! and stops at atomic units, at units every proposer declines, or at the
//! configured depth.
//!
//! Plans are cached by definition fingerprint, so an equivalent definition
//! submitted again skips the proposers entirely.

pub mod synthesis;

use crate::definition::validator::validate;
use crate::definition::ValidationReport;
use crate::directory::{CapabilityDirectory, DirectoryError};
use async_trait::async_trait;
use pe_protocol::definition_models::{PlanningSpec, ProcessDefinition, StepDefinition, StepKind};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use synthesis::Proposal;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanningError {
    #[error("no plan proposer is configured")]
    NoProposer,

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("{got} usable proposal(s), at least {needed} required")]
    NotEnoughProposals { needed: usize, got: usize },

    #[error("proposer {worker_id} failed: {message}")]
    Proposer { worker_id: String, message: String },

    #[error("synthesized plan is invalid: {0}")]
    Invalid(ValidationReport),
}

/// What a proposer is asked.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanRequest {
    pub instance_id: Uuid,
    pub goal: String,
    /// The plan as it stands.
    pub definition: ProcessDefinition,
    /// The step to decompose; `None` asks for top-level steps.
    pub unit: Option<StepDefinition>,
    /// Decomposition depth of `unit`; 0 for the top level.
    pub depth: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanResponse {
    Proposal(Proposal),
    /// The unit should not be decomposed.
    Atomic,
    Decline,
}

/// A worker able to propose plan fragments.
#[async_trait]
pub trait PlanProposer: Send + Sync {
    async fn propose(
        &self,
        worker_id: &str,
        request: &PlanRequest,
    ) -> Result<PlanResponse, PlanningError>;
}

/// Why planning is skipped for a definition that has a planning section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    Trivial,
    ForcedDirect,
}

impl fmt::Display for Skip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Skip::Trivial => f.write_str("definition is marked trivial"),
            Skip::ForcedDirect => f.write_str("direct execution is forced"),
        }
    }
}

pub fn skip_reason(definition: &ProcessDefinition, force_direct: bool) -> Option<Skip> {
    if definition.trivial {
        Some(Skip::Trivial)
    } else if force_direct {
        Some(Skip::ForcedDirect)
    } else {
        None
    }
}

/// BLAKE3 over the canonical JSON form of a definition.
pub fn fingerprint(definition: &ProcessDefinition) -> String {
    let canonical = serde_json::to_value(definition)
        .map(|v| v.to_string())
        .unwrap_or_else(|_| definition.name.clone());
    blake3::hash(canonical.as_bytes()).to_hex().to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanOutcome {
    pub definition: ProcessDefinition,
    /// Proposer requests made, charged as external calls.
    pub external_calls: u32,
}

#[derive(Clone)]
pub struct Planner {
    directory: Arc<dyn CapabilityDirectory>,
    proposer: Option<Arc<dyn PlanProposer>>,
    cache: Arc<Mutex<HashMap<String, ProcessDefinition>>>,
}

impl Planner {
    pub fn new(
        directory: Arc<dyn CapabilityDirectory>,
        proposer: Option<Arc<dyn PlanProposer>>,
    ) -> Self {
        Self {
            directory,
            proposer,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// A previously synthesized plan for an equivalent definition.
    pub async fn cached(&self, definition: &ProcessDefinition) -> Option<ProcessDefinition> {
        self.cache
            .lock()
            .await
            .get(&fingerprint(definition))
            .cloned()
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// Solicit proposals, merge them, decompose the result and cache it.
    ///
    /// # Errors
    ///
    /// Fails when no proposer is configured, the directory is unreachable,
    /// fewer than `min_proposals` usable proposals arrive, or the merged
    /// plan does not validate.
    pub async fn plan(
        &self,
        instance_id: Uuid,
        definition: &ProcessDefinition,
    ) -> Result<PlanOutcome, PlanningError> {
        let Some(spec) = &definition.planning else {
            return Ok(PlanOutcome {
                definition: definition.clone(),
                external_calls: 0,
            });
        };
        let proposer = self.proposer.clone().ok_or(PlanningError::NoProposer)?;
        let workers = self
            .directory
            .healthy_workers(&spec.proposer_capability)
            .await?;

        let mut calls = workers.len() as u32;
        let responses = gather(
            &proposer,
            &workers,
            PlanRequest {
                instance_id,
                goal: spec.goal.clone(),
                definition: definition.clone(),
                unit: None,
                depth: 0,
            },
        )
        .await;
        let proposals = usable(responses);
        if proposals.len() < spec.min_proposals {
            return Err(PlanningError::NotEnoughProposals {
                needed: spec.min_proposals,
                got: proposals.len(),
            });
        }

        let base = ProcessDefinition {
            planning: None,
            ..definition.clone()
        };
        let mut merged = synthesis::merge(&base, proposals);
        validate(&merged).map_err(PlanningError::Invalid)?;

        calls += self
            .decompose(&proposer, &workers, instance_id, spec, &mut merged)
            .await;

        info!(
            instance_id = %instance_id,
            steps = merged.steps.len(),
            "Plan synthesized"
        );
        self.cache
            .lock()
            .await
            .insert(fingerprint(definition), merged.clone());
        Ok(PlanOutcome {
            definition: merged,
            external_calls: calls,
        })
    }

    async fn decompose(
        &self,
        proposer: &Arc<dyn PlanProposer>,
        workers: &[String],
        instance_id: Uuid,
        spec: &PlanningSpec,
        root: &mut ProcessDefinition,
    ) -> u32 {
        let mut calls = 0;
        let mut queue: VecDeque<(Vec<String>, u32)> = action_ids(root)
            .into_iter()
            .map(|id| (vec![id], 1))
            .collect();

        while let Some((path, depth)) = queue.pop_front() {
            if depth > spec.max_depth {
                continue;
            }
            let Some(unit) = locate_mut(root, &path).map(|s| s.clone()) else {
                continue;
            };

            calls += workers.len() as u32;
            let responses = gather(
                proposer,
                workers,
                PlanRequest {
                    instance_id,
                    goal: spec.goal.clone(),
                    definition: root.clone(),
                    unit: Some(unit.clone()),
                    depth,
                },
            )
            .await;
            if responses.iter().any(|r| *r == PlanResponse::Atomic) {
                debug!(step_id = %unit.id, depth, "Unit is atomic");
                continue;
            }
            let proposals = usable(responses);
            if proposals.is_empty() {
                debug!(step_id = %unit.id, depth, "Decomposition declined");
                continue;
            }

            let replacement = decomposed(&unit, proposals);
            let body_ids = replacement
                .subprocess
                .as_deref()
                .map(action_ids)
                .unwrap_or_default();
            let Some(slot) = locate_mut(root, &path) else {
                continue;
            };
            let original = std::mem::replace(slot, replacement);

            if let Err(report) = validate(root) {
                warn!(
                    step_id = %unit.id,
                    issues = report.issues.len(),
                    "Discarding decomposition that does not validate"
                );
                if let Some(slot) = locate_mut(root, &path) {
                    *slot = original;
                }
                continue;
            }
            debug!(step_id = %unit.id, depth, steps = body_ids.len(), "Unit decomposed");
            for id in body_ids {
                let mut child = path.clone();
                child.push(id);
                queue.push_back((child, depth + 1));
            }
        }
        calls
    }
}

/// Ask every worker in parallel. Failures count as declines.
async fn gather(
    proposer: &Arc<dyn PlanProposer>,
    workers: &[String],
    request: PlanRequest,
) -> Vec<PlanResponse> {
    let request = Arc::new(request);
    let mut set = JoinSet::new();
    for worker in workers {
        let proposer = Arc::clone(proposer);
        let request = Arc::clone(&request);
        let worker = worker.clone();
        set.spawn(async move {
            let response = proposer.propose(&worker, &request).await;
            (worker, response)
        });
    }

    let mut responses = Vec::with_capacity(workers.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((worker, Ok(PlanResponse::Proposal(mut proposal)))) => {
                proposal.worker_id = worker;
                responses.push(PlanResponse::Proposal(proposal));
            }
            Ok((_, Ok(response))) => responses.push(response),
            Ok((worker, Err(e))) => {
                warn!(worker_id = %worker, error = %e, "Proposer failed");
                responses.push(PlanResponse::Decline);
            }
            Err(e) => {
                warn!(error = %e, "Proposer task failed");
                responses.push(PlanResponse::Decline);
            }
        }
    }
    responses
}

fn usable(responses: Vec<PlanResponse>) -> Vec<Proposal> {
    responses
        .into_iter()
        .filter_map(|r| match r {
            PlanResponse::Proposal(p) if !p.steps.is_empty() => Some(p),
            _ => None,
        })
        .collect()
}

fn action_ids(definition: &ProcessDefinition) -> Vec<String> {
    definition
        .steps
        .iter()
        .filter(|s| matches!(s.kind(), StepKind::Action { .. }))
        .map(|s| s.id.clone())
        .collect()
}

/// Follow a path of step ids through nested subprocess definitions.
fn locate_mut<'a>(
    mut definition: &'a mut ProcessDefinition,
    path: &[String],
) -> Option<&'a mut StepDefinition> {
    let (last, parents) = path.split_last()?;
    for id in parents {
        let step = definition.steps.iter_mut().find(|s| &s.id == id)?;
        definition = step.subprocess.as_deref_mut()?;
    }
    definition.steps.iter_mut().find(|s| &s.id == last)
}

/// Turn a decomposed unit into a subprocess step.
///
/// The body's inputs are the unit's parameter names. Its outputs expose
/// each declared output of the unit, taken from the last body step that
/// declares it, or from the last sink step when none does; a unit with no
/// declared outputs exposes the last sink's output as `result`.
fn decomposed(unit: &StepDefinition, proposals: Vec<Proposal>) -> StepDefinition {
    let inputs: Vec<String> = unit
        .params
        .as_object()
        .map(|p| p.keys().cloned().collect())
        .unwrap_or_default();
    let base = ProcessDefinition {
        name: unit.id.clone(),
        inputs,
        steps: Vec::new(),
        outputs: BTreeMap::new(),
        trivial: true,
        planning: None,
        budget: None,
    };
    let mut body = synthesis::merge(&base, proposals);

    let sink = body
        .steps
        .iter()
        .rev()
        .find(|s| !body.steps.iter().any(|o| o.depends_on.contains(&s.id)))
        .map(|s| s.id.clone());
    let mut outputs = BTreeMap::new();
    if let Some(sink) = &sink {
        if unit.outputs.is_empty() {
            outputs.insert("result".to_string(), format!("{{{{steps.{sink}.output}}}}"));
        }
        for name in &unit.outputs {
            let template = match body.steps.iter().rev().find(|s| s.outputs.contains(name)) {
                Some(s) => format!("{{{{steps.{}.{name}}}}}", s.id),
                None => format!("{{{{steps.{sink}.output}}}}"),
            };
            outputs.insert(name.clone(), template);
        }
    }
    body.outputs = outputs;

    StepDefinition {
        id: unit.id.clone(),
        action: None,
        capability: None,
        params: match &unit.params {
            Value::Object(_) => unit.params.clone(),
            _ => Value::Null,
        },
        depends_on: unit.depends_on.clone(),
        outputs: unit.outputs.clone(),
        timeout_ms: None,
        retry: None,
        quality: None,
        subprocess: Some(Box::new(body)),
        loop_spec: None,
    }
}
