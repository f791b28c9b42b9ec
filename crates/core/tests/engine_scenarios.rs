//! Integration tests for the engine's main loop.
//!
//! These tests verify that the engine correctly:
//! - Executes dependent steps in order and binds outputs
//! - Retries failed attempts and escalates when retries run out
//! - Blocks steps with no eligible worker and escalates past the ceiling
//! - Surfaces budget exhaustion
//! - Honors pause, resume and cancel

mod common;

use common::*;
use pe_core::journal::TransitionLog;
use pe_core::EngineError;
use pe_protocol::bus_models::WorkerReply;
use pe_protocol::definition_models::{ErrorKind, ProcessDefinition, RetryPolicy, StepDefinition};
use pe_protocol::instance_models::{Budget, BudgetDimension, Phase, StepStatus, TerminationReason};
use pe_protocol::ipc::{ControlSignal, Event};
use pe_protocol::transition_models::Transition;
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test]
async fn test_linear_process_runs_steps_in_order() {
    let mut h = harness(fast_settings());

    let id = h
        .handle
        .submit(
            linear_definition(),
            inputs(&[("url", json!("https://example.com/a"))]),
        )
        .await
        .expect("Should submit definition");
    let instance = h.wait_terminal(id).await;

    assert_eq!(instance.phase, Phase::Completed);
    assert_eq!(instance.outcome, Some(TerminationReason::AllStepsSucceeded));
    assert_eq!(
        instance.outputs(),
        json!({ "translated": { "text": "https://example.com/a", "lang": "fr" } })
    );

    let order: Vec<String> = h.workers.published().into_iter().map(|u| u.step_id).collect();
    assert_eq!(order, vec!["fetch", "summarize", "translate"]);
    assert_eq!(
        h.workers.topics(),
        vec!["work.fetcher-1", "work.writer-1", "work.writer-1"]
    );
    assert_eq!(instance.spent.iterations, 3);
    assert_eq!(instance.spent.external_calls, 3);

    let events = h.drain_events();
    assert!(has_started(&events, id));
    assert!(has_completed(&events, id));
    assert_phase_sequence(&events, id, Phase::Completed);
    assert!(phases_of(&events, id).contains(&Phase::Finalizing));
}

#[tokio::test]
async fn test_every_transition_is_journaled_in_sequence() {
    let h = harness(fast_settings());
    let id = h
        .handle
        .submit(linear_definition(), inputs(&[("url", json!("u"))]))
        .await
        .expect("Should submit definition");
    let instance = h.wait_terminal(id).await;

    let records = h.journal.read(id).await.expect("Should read journal");
    assert_eq!(records.len() as u64, instance.last_seq + 1);
    assert!(matches!(records[0].transition, Transition::Created { .. }));

    let replayed = pe_core::state::replay(&records).expect("Journal should replay");
    assert_eq!(replayed, instance);
}

#[tokio::test]
async fn test_missing_input_is_rejected_before_anything_runs() {
    let h = harness(fast_settings());
    let result = h.handle.submit(linear_definition(), inputs(&[])).await;

    match result {
        Err(EngineError::Validation(report)) => {
            assert_eq!(report.issues.len(), 1);
            assert_eq!(report.issues[0].path, "inputs.url");
        }
        other => panic!("Expected validation error, got {other:?}"),
    }
    assert!(h.workers.published().is_empty());
}

#[tokio::test]
async fn test_submit_document_reports_every_issue() {
    let h = harness(fast_settings());
    let document = json!({
        "name": "broken",
        "steps": [
            { "id": "a", "action": "fetch", "depends_on": ["b"] },
            { "id": "b", "action": "fetch", "depends_on": ["a"] },
            { "id": "c", "action": "fetch", "depends_on": ["nope"] }
        ]
    });

    match h.handle.submit_document(&document, inputs(&[])).await {
        Err(EngineError::Validation(report)) => {
            assert_eq!(report.cycles().len(), 1);
            assert!(report.issues.len() >= 2, "Should collect all issues: {report}");
        }
        other => panic!("Expected validation error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_fails_twice_then_succeeds() {
    let h = harness(fast_settings());
    h.workers.script("fetch", |unit| {
        Some(if unit.attempt < 3 {
            WorkerReply::error(unit.correlation_id, ErrorKind::WorkerError, "flaky upstream")
        } else {
            WorkerReply::success(unit.correlation_id, json!("page"))
        })
    });
    let definition = single_step(
        "flaky",
        StepDefinition::action("fetch", "fetch")
            .with_retry(RetryPolicy::attempts(3).with_backoff(10, 2.0, 50)),
    );

    let output = h
        .handle
        .run_to_completion(definition, inputs(&[]))
        .await
        .expect("Third attempt should succeed");
    assert_eq!(output, json!({ "result": "page" }));

    let units = h.workers.published_for("fetch");
    let attempts: Vec<u32> = units.iter().map(|u| u.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    let keys: std::collections::HashSet<_> = units.iter().map(|u| &u.idempotency_key).collect();
    assert_eq!(keys.len(), 3, "Each attempt gets its own idempotency key");
}

#[tokio::test]
async fn test_retries_exhausted_escalates() {
    let mut h = harness(fast_settings());
    h.workers.script("fetch", |unit| {
        Some(WorkerReply::error(
            unit.correlation_id,
            ErrorKind::WorkerError,
            "always down",
        ))
    });
    let definition = single_step(
        "doomed",
        StepDefinition::action("fetch", "fetch")
            .with_retry(RetryPolicy::attempts(2).with_backoff(10, 1.0, 10)),
    );

    let id = h
        .handle
        .submit(definition, inputs(&[]))
        .await
        .expect("Should submit definition");
    let instance = h.wait_terminal(id).await;

    assert_eq!(instance.phase, Phase::Escalated);
    match &instance.outcome {
        Some(TerminationReason::StepEscalated { step_id, message }) => {
            assert_eq!(step_id, "fetch");
            assert!(message.contains("retries exhausted after 2 attempts"));
        }
        other => panic!("Expected step escalation, got {other:?}"),
    }
    assert_eq!(h.workers.published_for("fetch").len(), 2);
    assert!(has_escalated(&h.drain_events(), id));
}

#[tokio::test]
async fn test_non_retryable_error_escalates_immediately() {
    let h = harness(fast_settings());
    h.workers.script("fetch", |unit| {
        Some(WorkerReply::error(
            unit.correlation_id,
            ErrorKind::InvalidInput,
            "bad url",
        ))
    });
    let definition = single_step("strict", StepDefinition::action("fetch", "fetch"));

    let result = h.handle.run_to_completion(definition, inputs(&[])).await;
    assert!(
        matches!(result, Err(EngineError::Escalated { .. })),
        "Invalid input is not retried: {result:?}"
    );
    assert_eq!(h.workers.published_for("fetch").len(), 1);
}

#[tokio::test]
async fn test_timeout_counts_as_failed_attempt() {
    let h = harness(fast_settings());
    h.workers.script("fetch", |unit| {
        (unit.attempt > 1).then(|| WorkerReply::success(unit.correlation_id, json!("late but fine")))
    });
    let definition = single_step(
        "slow",
        StepDefinition::action("fetch", "fetch")
            .with_timeout_ms(50)
            .with_retry(RetryPolicy::attempts(2).with_backoff(10, 1.0, 10)),
    );

    let output = h
        .handle
        .run_to_completion(definition, inputs(&[]))
        .await
        .expect("Second attempt should succeed");
    assert_eq!(output, json!({ "result": "late but fine" }));
    assert_eq!(h.workers.published_for("fetch").len(), 2);
}

#[tokio::test]
async fn test_step_without_worker_blocks_then_escalates() {
    let settings = pe_protocol::config_models::EngineSettings {
        blocked_ceiling_ms: 150,
        ..fast_settings()
    };
    let mut h = harness(settings);
    let definition = single_step("orphan", StepDefinition::action("render", "render-video"));

    let id = h
        .handle
        .submit(definition, inputs(&[]))
        .await
        .expect("Should submit definition");
    let blocked = h.wait_step(id, "render", StepStatus::Blocked).await;
    let state = blocked.step("render").expect("Step should exist");
    assert!(state.blocked_reason.is_some());
    assert_eq!(state.attempts, 0, "A blocked dispatch is not an attempt");

    let instance = h.wait_terminal(id).await;
    assert_eq!(instance.phase, Phase::Escalated);
    assert_eq!(
        instance.outcome,
        Some(TerminationReason::BlockedTooLong {
            step_id: "render".to_string()
        })
    );
    assert!(h.workers.published().is_empty());
    assert!(has_escalated(&h.drain_events(), id));
}

#[tokio::test]
async fn test_blocked_step_dispatches_once_worker_recovers() {
    let h = harness(fast_settings());
    h.directory.mark_unhealthy("fetcher-1").await;
    let definition = single_step("waiting", StepDefinition::action("fetch", "fetch"));

    let id = h
        .handle
        .submit(definition, inputs(&[]))
        .await
        .expect("Should submit definition");
    h.wait_step(id, "fetch", StepStatus::Blocked).await;
    h.directory.mark_healthy("fetcher-1").await;

    let instance = h.wait_terminal(id).await;
    assert_eq!(instance.phase, Phase::Completed);
    assert_eq!(h.workers.published().len(), 1);
}

#[tokio::test]
async fn test_publish_failure_blocks_until_transport_returns() {
    let h = harness(fast_settings());
    h.workers.refuse_publishing(true);
    let definition = single_step("bus-down", StepDefinition::action("fetch", "fetch"));

    let id = h
        .handle
        .submit(definition, inputs(&[]))
        .await
        .expect("Should submit definition");
    h.wait_step(id, "fetch", StepStatus::Blocked).await;
    h.workers.refuse_publishing(false);

    let instance = h.wait_terminal(id).await;
    assert_eq!(instance.phase, Phase::Completed);
    assert_eq!(instance.step("fetch").map(|s| s.attempts), Some(1));
}

#[tokio::test]
async fn test_budget_exhaustion_is_surfaced() {
    let mut h = harness(fast_settings());
    let definition = ProcessDefinition {
        budget: Some(Budget {
            max_iterations: 2,
            ..Budget::default()
        }),
        ..linear_definition()
    };

    let id = h
        .handle
        .submit(definition, inputs(&[("url", json!("u"))]))
        .await
        .expect("Should submit definition");
    let instance = h.wait_terminal(id).await;

    assert_eq!(instance.phase, Phase::Failed);
    assert_eq!(
        instance.outcome,
        Some(TerminationReason::BudgetExhausted {
            dimension: BudgetDimension::Iterations
        })
    );
    assert_eq!(instance.spent.iterations, 2, "Spent never exceeds the budget");
    assert_eq!(h.workers.published().len(), 2);

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::BudgetExhausted { instance_id, dimension: BudgetDimension::Iterations }
            if *instance_id == id
    )));
    assert!(matches!(
        pe_core::engine::outcome(&instance),
        Err(EngineError::BudgetExhausted { .. })
    ));
}

#[tokio::test]
async fn test_reported_cost_is_charged_and_clamped() {
    let h = harness(fast_settings());
    h.workers.script("fetch", |unit| {
        Some(WorkerReply::success(unit.correlation_id, json!("pricey")).with_cost(7.5))
    });
    let definition = ProcessDefinition {
        budget: Some(Budget {
            max_spend: 5.0,
            ..Budget::default()
        }),
        ..single_step("spendy", StepDefinition::action("fetch", "fetch"))
    };

    let result = h.handle.run_to_completion(definition, inputs(&[])).await;
    match result {
        Err(EngineError::BudgetExhausted { dimension, .. }) => {
            assert_eq!(dimension, BudgetDimension::Spend)
        }
        other => panic!("Expected spend exhaustion, got {other:?}"),
    }
}

#[tokio::test]
async fn test_pause_holds_dispatch_until_resume() {
    let h = harness(fast_settings());
    h.workers.hold("fetch");

    let id = h
        .handle
        .submit(linear_definition(), inputs(&[("url", json!("u"))]))
        .await
        .expect("Should submit definition");
    h.wait_step(id, "fetch", StepStatus::AwaitingResult).await;

    h.handle
        .control(ControlSignal::pause(id))
        .await
        .expect("Should pause");
    let unit = h.workers.published_for("fetch").remove(0);
    h.workers
        .reply(WorkerReply::success(unit.correlation_id, json!({ "url": "u" })));

    let paused = h.wait_step(id, "fetch", StepStatus::Succeeded).await;
    assert!(paused.paused);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(
        h.workers.published().len(),
        1,
        "Nothing new is dispatched while paused"
    );

    h.handle
        .control(ControlSignal::resume(id))
        .await
        .expect("Should resume");
    let instance = h.wait_terminal(id).await;
    assert_eq!(instance.phase, Phase::Completed);
    assert_eq!(h.workers.published().len(), 3);
}

#[tokio::test]
async fn test_cancel_waits_for_in_flight_step_then_stops() {
    let mut h = harness(fast_settings());
    h.workers.hold("fetch");

    let id = h
        .handle
        .submit(linear_definition(), inputs(&[("url", json!("u"))]))
        .await
        .expect("Should submit definition");
    h.wait_step(id, "fetch", StepStatus::AwaitingResult).await;

    h.handle
        .control(ControlSignal::cancel(id))
        .await
        .expect("Should cancel");
    let pending = h.snapshot(id).await;
    assert!(pending.cancel_requested);
    assert!(!pending.is_terminal(), "In-flight work is drained first");

    let unit = h.workers.published_for("fetch").remove(0);
    h.workers
        .reply(WorkerReply::success(unit.correlation_id, json!({ "url": "u" })));

    let instance = h.wait_terminal(id).await;
    assert_eq!(instance.phase, Phase::Cancelled);
    assert_eq!(instance.outcome, Some(TerminationReason::Cancelled));
    assert_eq!(h.workers.published().len(), 1, "No step starts after cancel");
    assert!(has_cancelled(&h.drain_events(), id));

    let err = pe_core::engine::outcome(&instance).expect_err("Cancelled is not a success");
    assert!(matches!(err, EngineError::Cancelled(cancelled) if cancelled == id));
}

#[tokio::test]
async fn test_control_of_unknown_instance_fails() {
    let h = harness(fast_settings());
    let result = h
        .handle
        .control(ControlSignal::pause(uuid::Uuid::new_v4()))
        .await;
    assert!(matches!(result, Err(EngineError::InstanceNotFound(_))));
}

#[tokio::test]
async fn test_late_reply_after_completion_is_ignored() {
    let h = harness(fast_settings());
    let definition = single_step("once", StepDefinition::action("fetch", "fetch"));
    let id = h
        .handle
        .submit(definition, inputs(&[]))
        .await
        .expect("Should submit definition");
    let done = h.wait_terminal(id).await;

    let unit = h.workers.published_for("fetch").remove(0);
    h.workers
        .reply(WorkerReply::success(unit.correlation_id, json!("duplicate")));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let after = h.snapshot(id).await;
    assert_eq!(after.last_seq, done.last_seq);
    assert_eq!(after.outputs(), done.outputs());
}
