//! Integration tests for subprocess and loop steps.

mod common;

use common::*;
use pe_protocol::bus_models::WorkerReply;
use pe_protocol::config_models::EngineSettings;
use pe_protocol::definition_models::{ErrorKind, ProcessDefinition, StepDefinition};
use pe_protocol::instance_models::{Phase, StepStatus, TerminationReason};
use pe_protocol::ipc::ControlSignal;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::BTreeMap;

fn per_item_body() -> ProcessDefinition {
    ProcessDefinition {
        name: "per-item".to_string(),
        inputs: vec![],
        steps: vec![StepDefinition::action("translate", "translate")
            .with_params(json!({ "text": "{{loop.item}}", "position": "{{loop.index}}" }))],
        outputs: BTreeMap::from([(
            "translated".to_string(),
            "{{steps.translate.output.text}}".to_string(),
        )]),
        trivial: false,
        planning: None,
        budget: None,
    }
}

fn fan_out_definition() -> ProcessDefinition {
    ProcessDefinition {
        name: "fan-out".to_string(),
        inputs: vec![],
        steps: vec![
            StepDefinition::action("gather", "search").with_outputs(["items"]),
            StepDefinition::loop_over("each", "{{steps.gather.items}}", per_item_body())
                .with_depends_on(["gather"]),
        ],
        outputs: BTreeMap::from([("all".to_string(), "{{steps.each.output}}".to_string())]),
        trivial: false,
        planning: None,
        budget: None,
    }
}

fn script_items(h: &Harness, items: Value) {
    h.workers.script("search", move |unit| {
        Some(WorkerReply::success(
            unit.correlation_id,
            json!({ "items": items.clone() }),
        ))
    });
}

#[tokio::test]
async fn test_loop_spawns_one_child_per_item_and_collects_in_order() {
    let mut h = harness(fast_settings());
    script_items(&h, json!(["a", "b", "c", "d", "e"]));

    let id = h
        .handle
        .submit(fan_out_definition(), inputs(&[]))
        .await
        .expect("Should submit definition");
    let instance = h.wait_terminal(id).await;

    assert_eq!(instance.phase, Phase::Completed);
    assert_eq!(
        instance.outputs(),
        json!({ "all": [
            { "translated": "a" },
            { "translated": "b" },
            { "translated": "c" },
            { "translated": "d" },
            { "translated": "e" }
        ] })
    );

    let children = h
        .handle
        .descendants(id)
        .await
        .expect("Should list descendants");
    assert_eq!(children.len(), 5);

    let state = instance.step("each").expect("Loop step should exist");
    let mut indices: Vec<usize> = state.children.iter().map(|c| c.index).collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);

    for child_id in children {
        let child = h.snapshot(child_id).await;
        assert_eq!(child.phase, Phase::Completed);
        assert_eq!(child.depth, 1);
        assert_eq!(child.root_id, id);
        assert_eq!(child.path, vec![id]);
        assert_eq!(child.parent_id(), Some(id));
        assert!(
            child.budget.max_iterations < instance.budget.max_iterations,
            "Children run under a share of the parent budget"
        );
    }

    let events = h.drain_events();
    let started_children = events
        .iter()
        .filter(|e| matches!(
            e,
            pe_protocol::ipc::Event::InstanceStarted { parent_id: Some(p), .. } if *p == id
        ))
        .count();
    assert_eq!(started_children, 5);
}

#[tokio::test]
async fn test_loop_over_empty_list_succeeds_without_children() {
    let h = harness(fast_settings());
    script_items(&h, json!([]));

    let output = h
        .handle
        .run_to_completion(fan_out_definition(), inputs(&[]))
        .await
        .expect("Empty loop should succeed");
    assert_eq!(output, json!({ "all": [] }));
    assert_eq!(h.workers.published_for("translate").len(), 0);
}

#[tokio::test]
async fn test_loop_over_non_list_escalates() {
    let h = harness(fast_settings());
    script_items(&h, json!("not a list"));

    let id = h
        .handle
        .submit(fan_out_definition(), inputs(&[]))
        .await
        .expect("Should submit definition");
    let instance = h.wait_terminal(id).await;

    assert_eq!(instance.phase, Phase::Escalated);
    assert!(matches!(
        &instance.outcome,
        Some(TerminationReason::StepEscalated { step_id, .. }) if step_id == "each"
    ));
}

#[tokio::test]
async fn test_failed_child_fails_the_parent_step() {
    let h = harness(fast_settings());
    h.workers.script("fetch", |unit| {
        Some(WorkerReply::error(
            unit.correlation_id,
            ErrorKind::InvalidInput,
            "unreachable host",
        ))
    });
    let body = ProcessDefinition {
        name: "child".to_string(),
        inputs: vec!["host".to_string()],
        steps: vec![StepDefinition::action("fetch", "fetch")
            .with_params(json!({ "host": "{{inputs.host}}" }))],
        outputs: BTreeMap::new(),
        trivial: false,
        planning: None,
        budget: None,
    };
    let definition = single_step(
        "parent",
        StepDefinition::subprocess("nested", body).with_params(json!({ "host": "example.org" })),
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
            assert_eq!(step_id, "nested");
            assert!(message.contains("1 of 1 children did not complete"));
        }
        other => panic!("Expected step escalation, got {other:?}"),
    }

    let unit = h.workers.published_for("fetch").remove(0);
    assert_eq!(unit.params["host"], json!("example.org"));
    let children = h.handle.descendants(id).await.expect("Should list descendants");
    let child = h.snapshot(children[0]).await;
    assert_eq!(child.phase, Phase::Escalated);
}

#[tokio::test]
async fn test_nesting_beyond_max_depth_escalates() {
    let settings = EngineSettings {
        max_depth: 0,
        ..fast_settings()
    };
    let h = harness(settings);
    let body = single_step("inner", StepDefinition::action("fetch", "fetch"));
    let definition = single_step("outer", StepDefinition::subprocess("nested", body));

    let id = h
        .handle
        .submit(definition, inputs(&[]))
        .await
        .expect("Should submit definition");
    let instance = h.wait_terminal(id).await;

    assert_eq!(
        instance.outcome,
        Some(TerminationReason::DepthExceeded {
            step_id: "nested".to_string(),
            depth: 0
        })
    );
    assert!(h.workers.published().is_empty());
    assert!(h
        .handle
        .descendants(id)
        .await
        .expect("Should list descendants")
        .is_empty());
}

#[tokio::test]
async fn test_cancel_reaches_every_descendant() {
    let mut h = harness(fast_settings());
    script_items(&h, json!(["x", "y", "z"]));
    h.workers.hold("translate");

    let id = h
        .handle
        .submit(fan_out_definition(), inputs(&[]))
        .await
        .expect("Should submit definition");
    let workers = h.workers.clone();
    eventually(|| {
        let held = workers.published_for("translate").len();
        async move { (held == 3).then_some(()) }
    })
    .await;
    let children = h.handle.descendants(id).await.expect("Should list descendants");
    for child in &children {
        h.wait_step(*child, "translate", StepStatus::AwaitingResult).await;
    }

    h.handle
        .control(ControlSignal::cancel(id))
        .await
        .expect("Should cancel");
    for child in &children {
        assert!(h.snapshot(*child).await.cancel_requested);
    }

    for unit in h.workers.published_for("translate") {
        h.workers
            .reply(WorkerReply::success(unit.correlation_id, json!({ "text": "late" })));
    }

    let root = h.wait_terminal(id).await;
    assert_eq!(root.phase, Phase::Cancelled);
    for child in &children {
        let child = h.wait_terminal(*child).await;
        assert_eq!(child.phase, Phase::Cancelled);
    }

    let events = h.drain_events();
    assert!(has_cancelled(&events, id));
    for child in &children {
        assert!(has_cancelled(&events, *child));
    }
}

#[tokio::test]
async fn test_one_cancelled_child_fails_the_loop_step_while_siblings_finish() {
    let h = harness(fast_settings());
    script_items(&h, json!(["a", "b", "c", "d", "e"]));
    h.workers.hold("translate");

    let id = h
        .handle
        .submit(fan_out_definition(), inputs(&[]))
        .await
        .expect("Should submit definition");
    let workers = h.workers.clone();
    eventually(|| {
        let held = workers.published_for("translate").len();
        async move { (held == 5).then_some(()) }
    })
    .await;

    let parent = h.snapshot(id).await;
    let victim = parent
        .step("each")
        .and_then(|s| s.children.iter().find(|c| c.index == 2))
        .map(|c| c.child_id)
        .expect("Loop should have spawned index 2");
    h.wait_step(victim, "translate", StepStatus::AwaitingResult).await;
    h.handle
        .control(ControlSignal::cancel(victim))
        .await
        .expect("Should cancel child");

    for unit in h.workers.published_for("translate") {
        let text = unit.params["text"].clone();
        h.workers
            .reply(WorkerReply::success(unit.correlation_id, json!({ "text": text })));
    }

    let instance = h.wait_terminal(id).await;
    assert_eq!(instance.phase, Phase::Escalated);
    match &instance.outcome {
        Some(TerminationReason::StepEscalated { step_id, message }) => {
            assert_eq!(step_id, "each");
            assert!(message.contains("1 of 5 children did not complete"), "{message}");
        }
        other => panic!("Expected step escalation, got {other:?}"),
    }
    assert_eq!(
        instance.step("each").map(|s| s.status),
        Some(StepStatus::Failed)
    );

    let children = h.handle.descendants(id).await.expect("Should list descendants");
    assert_eq!(children.len(), 5);
    let mut phases = Vec::new();
    for child in children {
        phases.push((child == victim, h.wait_terminal(child).await.phase));
    }
    for (is_victim, phase) in phases {
        let expected = if is_victim { Phase::Cancelled } else { Phase::Completed };
        assert_eq!(phase, expected);
    }
}

fn two_stage_body() -> ProcessDefinition {
    ProcessDefinition {
        name: "per-item".to_string(),
        inputs: vec![],
        steps: vec![
            StepDefinition::action("translate", "translate")
                .with_params(json!({ "text": "{{loop.item}}" })),
            StepDefinition::action("polish", "summarize")
                .with_params(json!({ "text": "{{steps.translate.output.text}}" }))
                .with_depends_on(["translate"]),
        ],
        outputs: BTreeMap::from([(
            "polished".to_string(),
            "{{steps.polish.output.text}}".to_string(),
        )]),
        trivial: false,
        planning: None,
        budget: None,
    }
}

#[tokio::test]
async fn test_subtree_pause_holds_descendants_until_resume() {
    let h = harness(fast_settings());
    script_items(&h, json!(["x", "y"]));
    h.workers.hold("translate");
    let definition = ProcessDefinition {
        name: "fan-out".to_string(),
        inputs: vec![],
        steps: vec![
            StepDefinition::action("gather", "search").with_outputs(["items"]),
            StepDefinition::loop_over("each", "{{steps.gather.items}}", two_stage_body())
                .with_depends_on(["gather"]),
        ],
        outputs: BTreeMap::from([("all".to_string(), "{{steps.each.output}}".to_string())]),
        trivial: false,
        planning: None,
        budget: None,
    };

    let id = h
        .handle
        .submit(definition, inputs(&[]))
        .await
        .expect("Should submit definition");
    let workers = h.workers.clone();
    eventually(|| {
        let held = workers.published_for("translate").len();
        async move { (held == 2).then_some(()) }
    })
    .await;
    let children = h.handle.descendants(id).await.expect("Should list descendants");
    for child in &children {
        h.wait_step(*child, "translate", StepStatus::AwaitingResult).await;
    }

    h.handle
        .control(ControlSignal::pause(id).for_subtree())
        .await
        .expect("Should pause subtree");
    assert!(h.snapshot(id).await.paused);
    for child in &children {
        assert!(h.snapshot(*child).await.paused);
    }

    for unit in h.workers.published_for("translate") {
        let text = unit.params["text"].clone();
        h.workers
            .reply(WorkerReply::success(unit.correlation_id, json!({ "text": text })));
    }
    for child in &children {
        h.wait_step(*child, "translate", StepStatus::Succeeded).await;
    }
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(
        h.workers.published_for("polish").is_empty(),
        "Paused descendants dispatch nothing new"
    );
    for child in &children {
        let child = h.snapshot(*child).await;
        assert_eq!(child.step("polish").map(|s| s.status), Some(StepStatus::Pending));
    }

    h.handle
        .control(ControlSignal::resume(id).for_subtree())
        .await
        .expect("Should resume subtree");
    let instance = h.wait_terminal(id).await;

    assert_eq!(instance.phase, Phase::Completed);
    assert_eq!(
        instance.outputs(),
        json!({ "all": [{ "polished": "x" }, { "polished": "y" }] })
    );
    assert_eq!(h.workers.published_for("polish").len(), 2);
}

#[tokio::test]
async fn test_instance_pause_leaves_children_running() {
    let h = harness(fast_settings());
    script_items(&h, json!(["x"]));
    h.workers.hold("translate");

    let id = h
        .handle
        .submit(fan_out_definition(), inputs(&[]))
        .await
        .expect("Should submit definition");
    let workers = h.workers.clone();
    eventually(|| {
        let held = workers.published_for("translate").len();
        async move { (held == 1).then_some(()) }
    })
    .await;
    let children = h.handle.descendants(id).await.expect("Should list descendants");

    h.handle
        .control(ControlSignal::pause(id))
        .await
        .expect("Should pause instance");
    assert!(h.snapshot(id).await.paused);
    assert!(!h.snapshot(children[0]).await.paused);

    let unit = h.workers.published_for("translate").remove(0);
    h.workers
        .reply(WorkerReply::success(unit.correlation_id, json!({ "text": "x" })));
    let child = h.wait_terminal(children[0]).await;
    assert_eq!(child.phase, Phase::Completed);

    h.handle
        .control(ControlSignal::resume(id))
        .await
        .expect("Should resume instance");
    let instance = h.wait_terminal(id).await;
    assert_eq!(instance.outputs(), json!({ "all": [{ "translated": "x" }] }));
}
