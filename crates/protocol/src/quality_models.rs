//! Quality policy and verdict models.

use serde::{Deserialize, Serialize};

/// Post-step gate scoring a step's output against weighted criteria.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QualityPolicy {
    pub criteria: Vec<Criterion>,

    /// Scores at or above this value pass.
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f64,

    /// Scores at or above this value (and below `pass_threshold`) are
    /// marginal; anything lower fails.
    #[serde(default = "default_marginal_threshold")]
    pub marginal_threshold: f64,

    /// Attempt ceiling for the accept/retry loop.
    #[serde(default = "default_quality_attempts")]
    pub max_attempts: u32,
}

fn default_pass_threshold() -> f64 {
    0.8
}

fn default_marginal_threshold() -> f64 {
    0.5
}

fn default_quality_attempts() -> u32 {
    3
}

impl QualityPolicy {
    pub fn new(criteria: Vec<Criterion>) -> Self {
        Self {
            criteria,
            pass_threshold: default_pass_threshold(),
            marginal_threshold: default_marginal_threshold(),
            max_attempts: default_quality_attempts(),
        }
    }

    pub fn with_thresholds(mut self, pass: f64, marginal: f64) -> Self {
        self.pass_threshold = pass;
        self.marginal_threshold = marginal;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Map a score onto the configured thresholds.
    pub fn classify(&self, score: f64) -> Verdict {
        if score >= self.pass_threshold {
            Verdict::Pass
        } else if score >= self.marginal_threshold {
            Verdict::Marginal
        } else {
            Verdict::Fail
        }
    }
}

/// A named, weighted criterion.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Criterion {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_weight")]
    pub weight: f64,

    pub evaluator: EvaluatorRef,
}

fn default_weight() -> f64 {
    1.0
}

impl Criterion {
    pub fn new(name: impl Into<String>, weight: f64, evaluator: EvaluatorRef) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            weight,
            evaluator,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Who scores a criterion: a deterministic in-process rule or an external
/// worker advertising a judging capability.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorRef {
    Rule(Rule),
    Capability(String),
}

/// Deterministic scoring rules.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rule {
    /// 1.0 unless the output is null, an empty string, array or object.
    NonEmpty,
    /// Fraction of the listed keys present in an object output.
    RequiredKeys { keys: Vec<String> },
    /// Ratio of the output's text length to `min_chars`, capped at 1.0.
    MinLength { min_chars: usize },
    /// 1.0 if the output text contains `text`.
    Contains { text: String },
    /// Reads a self-reported score in [0, 1] from an object field.
    ScoreField { field: String },
}

/// Pass / marginal / fail classification.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Marginal,
    Fail,
}

/// Score of one criterion.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CriterionScore {
    pub name: String,
    pub weight: f64,
    pub score: f64,
    pub passed: bool,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Result of evaluating a step's output against its quality policy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QualityVerdict {
    /// Weighted score in [0, 1].
    pub score: f64,
    pub verdict: Verdict,
    pub criteria: Vec<CriterionScore>,
    /// Actionable feedback attached verbatim to the next attempt.
    pub feedback: Vec<String>,
}

impl QualityVerdict {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_partitions_scores() {
        let policy = QualityPolicy::new(vec![]).with_thresholds(0.9, 0.6);
        assert_eq!(policy.classify(0.95), Verdict::Pass);
        assert_eq!(policy.classify(0.9), Verdict::Pass);
        assert_eq!(policy.classify(0.7), Verdict::Marginal);
        assert_eq!(policy.classify(0.2), Verdict::Fail);
    }

    #[test]
    fn test_evaluator_ref_yaml_shapes() {
        let rule: EvaluatorRef =
            serde_json::from_str(r#"{"rule":{"kind":"required_keys","keys":["a"]}}"#).unwrap();
        assert_eq!(
            rule,
            EvaluatorRef::Rule(Rule::RequiredKeys {
                keys: vec!["a".to_string()]
            })
        );

        let judge: EvaluatorRef = serde_json::from_str(r#"{"capability":"style-judge"}"#).unwrap();
        assert_eq!(judge, EvaluatorRef::Capability("style-judge".to_string()));
    }
}
