//! Integration tests for the post-step quality loop.

mod common;

use common::*;
use pe_core::dispatch::FEEDBACK_KEY;
use pe_protocol::definition_models::{RetryPolicy, StepDefinition};
use pe_protocol::instance_models::{Phase, TerminationReason};
use pe_protocol::quality_models::{Criterion, EvaluatorRef, QualityPolicy, Rule};
use pe_core::transport::{ArtifactStore, MemoryArtifactStore};
use pe_protocol::bus_models::WorkerReply;
use pe_protocol::definition_models::ProcessDefinition;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

fn cited_policy() -> QualityPolicy {
    QualityPolicy::new(vec![
        Criterion::new("cites", 2.0, EvaluatorRef::Rule(Rule::Contains {
            text: "[1]".to_string(),
        })),
        Criterion::new("non-empty", 1.0, EvaluatorRef::Rule(Rule::NonEmpty)),
    ])
    .with_thresholds(0.9, 0.5)
    .with_max_attempts(3)
}

fn write_step(policy: QualityPolicy) -> StepDefinition {
    StepDefinition::action("write", "write")
        .with_params(json!({ "topic": "rust" }))
        .with_quality(policy)
        .with_retry(RetryPolicy::attempts(5).with_backoff(10, 1.0, 10))
}

#[tokio::test]
async fn test_rejected_output_is_retried_with_feedback() {
    let mut h = harness(fast_settings());
    h.workers.script("write", |unit| {
        let text = if unit.params.get(FEEDBACK_KEY).is_some() {
            "Rust is fast [1]"
        } else {
            "Rust is fast"
        };
        Some(text_reply(unit, text))
    });

    let id = h
        .handle
        .submit(single_step("essay", write_step(cited_policy())), inputs(&[]))
        .await
        .expect("Should submit definition");
    let instance = h.wait_terminal(id).await;

    assert_eq!(instance.phase, Phase::Completed);
    assert_eq!(instance.outputs(), json!({ "result": { "text": "Rust is fast [1]" } }));

    let units = h.workers.published_for("write");
    assert_eq!(units.len(), 2);
    assert!(units[0].params.get(FEEDBACK_KEY).is_none());
    let feedback = units[1].params[FEEDBACK_KEY]
        .as_array()
        .expect("Feedback should be a list");
    assert!(
        feedback.iter().any(|f| f.as_str().is_some_and(|s| s.contains("[1]"))),
        "Feedback should name the failed criterion: {feedback:?}"
    );
    assert_eq!(units[1].params["topic"], json!("rust"));

    let state = instance.step("write").expect("Step should exist");
    assert_eq!(state.attempts, 2);
    assert!(state.last_score.is_some_and(|s| s >= 0.9));
    assert!(state.candidate.is_none(), "Accepted output leaves no candidate");

    let phases = phases_of(&h.drain_events(), id);
    assert!(phases.contains(&Phase::Evaluating));
}

#[tokio::test]
async fn test_quality_ceiling_escalates_with_last_score() {
    let h = harness(fast_settings());
    h.workers.script("write", |unit| Some(text_reply(unit, "no sources")));

    let id = h
        .handle
        .submit(single_step("essay", write_step(cited_policy())), inputs(&[]))
        .await
        .expect("Should submit definition");
    let instance = h.wait_terminal(id).await;

    assert_eq!(instance.phase, Phase::Escalated);
    match instance.outcome {
        Some(TerminationReason::QualityCeiling { step_id, score }) => {
            assert_eq!(step_id, "write");
            assert!((score - 1.0 / 3.0).abs() < 1e-9, "Weighted score, got {score}");
        }
        other => panic!("Expected quality ceiling, got {other:?}"),
    }
    assert_eq!(h.workers.published_for("write").len(), 3);
}

#[tokio::test]
async fn test_capability_judge_is_consulted_and_charged() {
    let judge = FixedJudge::new(0.95);
    let h = harness_with(fast_settings(), |deps| deps.with_judge(judge.clone()));
    let policy = QualityPolicy::new(vec![Criterion::new(
        "style",
        1.0,
        EvaluatorRef::Capability("style-judge".to_string()),
    )]);

    let id = h
        .handle
        .submit(single_step("styled", write_step(policy)), inputs(&[]))
        .await
        .expect("Should submit definition");
    let instance = h.wait_terminal(id).await;

    assert_eq!(instance.phase, Phase::Completed);
    assert_eq!(judge.calls(), 1);
    assert_eq!(instance.spent.iterations, 1);
    assert_eq!(
        instance.spent.external_calls, 2,
        "One dispatch plus one judge call"
    );
}

#[tokio::test]
async fn test_missing_judge_scores_zero() {
    let h = harness(fast_settings());
    let policy = QualityPolicy::new(vec![Criterion::new(
        "style",
        1.0,
        EvaluatorRef::Capability("style-judge".to_string()),
    )])
    .with_max_attempts(1);

    let id = h
        .handle
        .submit(single_step("unjudged", write_step(policy)), inputs(&[]))
        .await
        .expect("Should submit definition");
    let instance = h.wait_terminal(id).await;

    assert_eq!(instance.phase, Phase::Escalated);
    assert!(matches!(
        instance.outcome,
        Some(TerminationReason::QualityCeiling { score, .. }) if score == 0.0
    ));
}

fn improving_worker(h: &Harness) {
    h.workers.script("write", |unit| {
        let score = 0.45 + 0.25 * f64::from(unit.attempt - 1);
        Some(WorkerReply::success(
            unit.correlation_id,
            json!({ "text": "draft", "confidence": score }),
        ))
    });
}

fn self_scored(max_attempts: u32) -> QualityPolicy {
    QualityPolicy::new(vec![Criterion::new(
        "confidence",
        1.0,
        EvaluatorRef::Rule(Rule::ScoreField {
            field: "confidence".to_string(),
        }),
    )])
    .with_thresholds(0.9, 0.5)
    .with_max_attempts(max_attempts)
}

#[tokio::test]
async fn test_improving_worker_converges_once_threshold_is_crossed() {
    let h = harness(fast_settings());
    improving_worker(&h);

    let id = h
        .handle
        .submit(single_step("converge", write_step(self_scored(4))), inputs(&[]))
        .await
        .expect("Should submit definition");
    let instance = h.wait_terminal(id).await;

    assert_eq!(instance.phase, Phase::Completed);
    let state = instance.step("write").expect("Step should exist");
    assert_eq!(state.attempts, 3);
    assert!(state.last_score.is_some_and(|s| s >= 0.9));
}

#[tokio::test]
async fn test_improving_worker_escalates_when_ceiling_comes_first() {
    let h = harness(fast_settings());
    improving_worker(&h);

    let id = h
        .handle
        .submit(single_step("converge", write_step(self_scored(2))), inputs(&[]))
        .await
        .expect("Should submit definition");
    let instance = h.wait_terminal(id).await;

    assert_eq!(instance.phase, Phase::Escalated);
    match instance.outcome {
        Some(TerminationReason::QualityCeiling { score, .. }) => {
            assert!((score - 0.7).abs() < 1e-9, "Last score is reported, got {score}");
        }
        other => panic!("Expected quality ceiling, got {other:?}"),
    }
    assert_eq!(h.workers.published_for("write").len(), 2);
}

#[tokio::test]
async fn test_artifact_output_is_scored_and_bound_by_content() {
    let store = Arc::new(MemoryArtifactStore::new());
    let reference = store
        .put(br#"{"title":"t","body":"b"}"#.to_vec())
        .await
        .expect("Should store output");
    let h = harness_with(fast_settings(), |deps| deps.with_artifacts(store.clone()));
    h.workers.script("write", move |unit| {
        Some(WorkerReply::artifact(unit.correlation_id, reference.clone()))
    });

    let policy = QualityPolicy::new(vec![Criterion::new(
        "complete",
        1.0,
        EvaluatorRef::Rule(Rule::RequiredKeys {
            keys: vec!["title".to_string(), "body".to_string()],
        }),
    )])
    .with_thresholds(0.9, 0.5);
    let definition = ProcessDefinition {
        name: "large-essay".to_string(),
        inputs: vec![],
        steps: vec![write_step(policy).with_outputs(["title"])],
        outputs: [("headline".to_string(), "{{steps.write.title}}".to_string())].into(),
        trivial: false,
        planning: None,
        budget: None,
    };

    let id = h
        .handle
        .submit(definition, inputs(&[]))
        .await
        .expect("Should submit definition");
    let instance = h.wait_terminal(id).await;

    assert_eq!(instance.phase, Phase::Completed);
    assert_eq!(instance.outputs(), json!({ "headline": "t" }));
    let state = instance.step("write").expect("Step should exist");
    assert_eq!(state.attempts, 1);
    assert!(matches!(
        state.last_result,
        Some(pe_protocol::instance_models::ResultRef::Artifact(_))
    ));
}
