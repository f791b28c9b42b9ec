//! Test fixtures: engines wired to scripted workers, and sample definitions.

use super::mock_workers::ScriptedWorkers;
use pe_core::directory::StaticDirectory;
use pe_core::journal::MemoryJournal;
use pe_core::{Engine, EngineDeps, EngineHandle};
use pe_protocol::config_models::EngineSettings;
use pe_protocol::definition_models::{ProcessDefinition, RetryPolicy, StepDefinition};
use pe_protocol::instance_models::{Phase, ProcessInstance, StepStatus};
use pe_protocol::ipc::Event;
use pe_protocol::worker_models::WorkerManifest;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A running engine and everything a test inspects around it.
#[allow(dead_code)]
pub struct Harness {
    pub handle: EngineHandle,
    pub workers: Arc<ScriptedWorkers>,
    pub journal: Arc<MemoryJournal>,
    pub directory: Arc<StaticDirectory>,
    pub events: mpsc::Receiver<Event>,
}

#[allow(dead_code)]
impl Harness {
    /// Everything emitted so far.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub async fn snapshot(&self, id: Uuid) -> ProcessInstance {
        self.handle
            .snapshot(id)
            .await
            .expect("Should snapshot instance")
    }

    pub async fn wait_terminal(&self, id: Uuid) -> ProcessInstance {
        tokio::time::timeout(Duration::from_secs(10), self.handle.wait_terminal(id))
            .await
            .expect("Instance should terminate in time")
            .expect("Should wait for instance")
    }

    /// Poll until `step_id` of `id` has `status`.
    pub async fn wait_step(&self, id: Uuid, step_id: &str, status: StepStatus) -> ProcessInstance {
        let handle = self.handle.clone();
        let step = step_id.to_string();
        eventually(|| {
            let handle = handle.clone();
            let step = step.clone();
            async move {
                let instance = handle.snapshot(id).await.ok()?;
                (instance.step(&step)?.status == status).then_some(instance)
            }
        })
        .await
    }
}

/// Settings with short intervals so time-based behavior shows up quickly.
#[allow(dead_code)]
pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        default_timeout_ms: 2_000,
        capacity_check_interval_ms: 20,
        blocked_ceiling_ms: 5_000,
        default_retry: RetryPolicy::attempts(3).with_backoff(10, 1.0, 10),
        ..EngineSettings::default()
    }
}

/// Workers advertising the capabilities the sample definitions use.
#[allow(dead_code)]
pub fn sample_workers() -> Vec<WorkerManifest> {
    vec![
        WorkerManifest::new("fetcher-1", ["fetch", "search"]),
        WorkerManifest::new("writer-1", ["summarize", "write", "translate"]),
        WorkerManifest::new("judge-1", ["style-judge"]),
        WorkerManifest::new("planner-1", ["plan"]),
        WorkerManifest::new("planner-2", ["plan"]),
    ]
}

/// Engine with scripted workers and an in-memory journal.
#[allow(dead_code)]
pub fn harness(settings: EngineSettings) -> Harness {
    harness_with(settings, |deps| deps)
}

/// Like [`harness`], with a chance to add a judge or proposer.
#[allow(dead_code)]
pub fn harness_with(
    settings: EngineSettings,
    configure: impl FnOnce(EngineDeps) -> EngineDeps,
) -> Harness {
    let workers = ScriptedWorkers::new();
    let journal = Arc::new(MemoryJournal::new());
    let directory = Arc::new(StaticDirectory::new(sample_workers()));
    let deps = configure(EngineDeps::new(
        directory.clone(),
        workers.clone(),
        journal.clone(),
    ));
    let (events_tx, events) = mpsc::channel(1_024);
    let handle = Engine::spawn(settings, deps, events_tx);
    workers.attach(handle.clone());
    Harness {
        handle,
        workers,
        journal,
        directory,
        events,
    }
}

/// Poll `check` every 10 ms until it yields a value, for at most 10 s.
#[allow(dead_code)]
pub async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let poll = async {
        loop {
            if let Some(value) = check().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .expect("Condition should hold in time")
}

#[allow(dead_code)]
pub fn inputs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// fetch -> summarize -> translate, with one declared output.
#[allow(dead_code)]
pub fn linear_definition() -> ProcessDefinition {
    ProcessDefinition {
        name: "digest".to_string(),
        inputs: vec!["url".to_string()],
        steps: vec![
            StepDefinition::action("fetch", "fetch").with_params(json!({ "url": "{{inputs.url}}" })),
            StepDefinition::action("summarize", "summarize")
                .with_depends_on(["fetch"])
                .with_params(json!({ "text": "{{steps.fetch.output.url}}" })),
            StepDefinition::action("translate", "translate")
                .with_depends_on(["summarize"])
                .with_params(json!({ "text": "{{steps.summarize.output.text}}", "lang": "fr" })),
        ],
        outputs: BTreeMap::from([(
            "translated".to_string(),
            "{{steps.translate.output}}".to_string(),
        )]),
        trivial: false,
        planning: None,
        budget: None,
    }
}

/// Single-step definition around `step`.
#[allow(dead_code)]
pub fn single_step(name: &str, step: StepDefinition) -> ProcessDefinition {
    let output = format!("{{{{steps.{}.output}}}}", step.id);
    ProcessDefinition {
        name: name.to_string(),
        inputs: vec![],
        steps: vec![step],
        outputs: BTreeMap::from([("result".to_string(), output)]),
        trivial: false,
        planning: None,
        budget: None,
    }
}

#[allow(dead_code)]
pub fn is_terminal_with(instance: &ProcessInstance, phase: Phase) -> bool {
    instance.phase == phase && instance.outcome.is_some()
}
