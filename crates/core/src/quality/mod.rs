//! Quality evaluation loop.
//!
//! Scores a step's output against the weighted criteria of its
//! [`QualityPolicy`]. Rule criteria are scored in process; capability
//! criteria are sent to a healthy worker advertising the capability through
//! a [`CriterionJudge`]. The resulting [`QualityVerdict`] carries the
//! feedback the next attempt receives verbatim.

pub mod rules;

use crate::directory::CapabilityDirectory;
use async_trait::async_trait;
use pe_protocol::quality_models::{
    Criterion, CriterionScore, EvaluatorRef, QualityPolicy, QualityVerdict,
};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JudgeError {
    #[error("judge unavailable: {0}")]
    Unavailable(String),

    #[error("judge rejected the request: {0}")]
    Rejected(String),
}

/// A criterion handed to an external judge.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeRequest {
    pub instance_id: Uuid,
    pub step_id: String,
    pub capability: String,
    pub worker_id: String,
    pub criterion: Criterion,
    pub output: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JudgeScore {
    /// Score in [0, 1]; values outside are clamped.
    pub score: f64,
    pub issues: Vec<String>,
}

/// Scores capability-evaluated criteria through an external worker.
#[async_trait]
pub trait CriterionJudge: Send + Sync {
    async fn judge(&self, request: JudgeRequest) -> Result<JudgeScore, JudgeError>;
}

/// Number of external calls evaluating `policy` costs.
pub fn judged_calls(policy: &QualityPolicy) -> u32 {
    policy
        .criteria
        .iter()
        .filter(|c| matches!(c.evaluator, EvaluatorRef::Capability(_)))
        .count() as u32
}

/// Combine criterion scores into a verdict.
///
/// The score is the weight-normalized mean. A policy without weighted
/// criteria scores 1.0.
pub fn aggregate(policy: &QualityPolicy, criteria: Vec<CriterionScore>) -> QualityVerdict {
    let total_weight: f64 = criteria.iter().map(|c| c.weight.max(0.0)).sum();
    let score = if total_weight > 0.0 {
        criteria
            .iter()
            .map(|c| c.weight.max(0.0) * c.score)
            .sum::<f64>()
            / total_weight
    } else {
        1.0
    }
    .clamp(0.0, 1.0);

    let feedback = criteria
        .iter()
        .filter(|c| !c.passed)
        .map(|c| feedback_line(policy, c))
        .collect();

    QualityVerdict {
        score,
        verdict: policy.classify(score),
        criteria,
        feedback,
    }
}

fn feedback_line(policy: &QualityPolicy, c: &CriterionScore) -> String {
    let shortfall = (policy.pass_threshold - c.score).max(0.0);
    let head = format!(
        "criterion '{}' scored {:.2} (weight {:.1}, shortfall {:.2})",
        c.name, c.score, c.weight, shortfall
    );
    if c.issues.is_empty() {
        head
    } else {
        format!("{head}: {}", c.issues.join("; "))
    }
}

/// Evaluates step outputs against quality policies.
#[derive(Clone)]
pub struct QualityEvaluator {
    directory: Arc<dyn CapabilityDirectory>,
    judge: Option<Arc<dyn CriterionJudge>>,
}

impl QualityEvaluator {
    pub fn new(
        directory: Arc<dyn CapabilityDirectory>,
        judge: Option<Arc<dyn CriterionJudge>>,
    ) -> Self {
        Self { directory, judge }
    }

    /// Score `output` against every criterion of `policy`.
    ///
    /// Never fails: an unreachable judge scores its criterion 0 and says
    /// why in the feedback.
    pub async fn evaluate(
        &self,
        policy: &QualityPolicy,
        instance_id: Uuid,
        step_id: &str,
        output: &Value,
    ) -> QualityVerdict {
        let mut scores = Vec::with_capacity(policy.criteria.len());
        for criterion in &policy.criteria {
            let (score, issues) = match &criterion.evaluator {
                EvaluatorRef::Rule(rule) => rules::score_rule(rule, output),
                EvaluatorRef::Capability(capability) => {
                    self.judged(criterion, capability, instance_id, step_id, output)
                        .await
                }
            };
            debug!(
                instance_id = %instance_id,
                step_id = %step_id,
                criterion = %criterion.name,
                score,
                "Criterion scored"
            );
            scores.push(CriterionScore {
                name: criterion.name.clone(),
                weight: criterion.weight,
                score,
                passed: score >= policy.pass_threshold,
                issues,
            });
        }
        aggregate(policy, scores)
    }

    async fn judged(
        &self,
        criterion: &Criterion,
        capability: &str,
        instance_id: Uuid,
        step_id: &str,
        output: &Value,
    ) -> (f64, Vec<String>) {
        let Some(judge) = &self.judge else {
            return (
                0.0,
                vec![format!("no judge configured for capability '{capability}'")],
            );
        };
        let worker_id = match self.directory.healthy_workers(capability).await {
            Ok(workers) => match workers.into_iter().next() {
                Some(w) => w,
                None => {
                    return (
                        0.0,
                        vec![format!("no healthy worker for capability '{capability}'")],
                    )
                }
            },
            Err(e) => return (0.0, vec![e.to_string()]),
        };

        let request = JudgeRequest {
            instance_id,
            step_id: step_id.to_string(),
            capability: capability.to_string(),
            worker_id: worker_id.clone(),
            criterion: criterion.clone(),
            output: output.clone(),
        };
        match judge.judge(request).await {
            Ok(result) => (result.score.clamp(0.0, 1.0), result.issues),
            Err(e) => {
                warn!(
                    instance_id = %instance_id,
                    step_id = %step_id,
                    worker_id = %worker_id,
                    error = %e,
                    "Judge failed"
                );
                (0.0, vec![format!("judge {worker_id} failed: {e}")])
            }
        }
    }
}
