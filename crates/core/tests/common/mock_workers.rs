//! Scripted workers, judges and proposers for deterministic testing.

use async_trait::async_trait;
use pe_core::planning::{PlanProposer, PlanRequest, PlanResponse, PlanningError, Proposal};
use pe_core::quality::{CriterionJudge, JudgeError, JudgeRequest, JudgeScore};
use pe_core::transport::{TransportError, WorkerTransport};
use pe_core::EngineHandle;
use pe_protocol::bus_models::{DeliveryStatus, WorkUnit, WorkerReply};
use pe_protocol::definition_models::StepDefinition;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use uuid::Uuid;

/// Decides how a worker answers a unit. `None` keeps the unit in flight
/// with no reply.
pub type Responder = Arc<dyn Fn(&WorkUnit) -> Option<WorkerReply> + Send + Sync>;

/// In-process bus whose workers answer according to per-action scripts.
///
/// Actions without a script echo their parameters back. Every reply is
/// counted as one execution of the unit's idempotency key, which lets
/// tests check that nothing runs twice.
#[allow(dead_code)]
#[derive(Default)]
pub struct ScriptedWorkers {
    handle: OnceLock<EngineHandle>,
    responders: Mutex<HashMap<String, Responder>>,
    published: Mutex<Vec<(String, WorkUnit)>>,
    executions: Mutex<HashMap<String, u32>>,
    statuses: Mutex<HashMap<Uuid, DeliveryStatus>>,
    refuse_publish: Mutex<bool>,
}

#[allow(dead_code)]
impl ScriptedWorkers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replies go to this engine. Units published before attaching get no
    /// reply.
    pub fn attach(&self, handle: EngineHandle) {
        let _ = self.handle.set(handle);
    }

    pub fn script<F>(&self, action: &str, responder: F)
    where
        F: Fn(&WorkUnit) -> Option<WorkerReply> + Send + Sync + 'static,
    {
        self.responders
            .lock()
            .expect("Responder lock poisoned")
            .insert(action.to_string(), Arc::new(responder));
    }

    /// Units of `action` are accepted but never answered.
    pub fn hold(&self, action: &str) {
        self.script(action, |_| None);
    }

    /// Answer what `query_status` reports for a correlation id.
    pub fn set_status(&self, correlation_id: Uuid, status: DeliveryStatus) {
        self.statuses
            .lock()
            .expect("Status lock poisoned")
            .insert(correlation_id, status);
    }

    pub fn refuse_publishing(&self, refuse: bool) {
        *self.refuse_publish.lock().expect("Refuse lock poisoned") = refuse;
    }

    pub fn published(&self) -> Vec<WorkUnit> {
        self.published
            .lock()
            .expect("Published lock poisoned")
            .iter()
            .map(|(_, unit)| unit.clone())
            .collect()
    }

    pub fn topics(&self) -> Vec<String> {
        self.published
            .lock()
            .expect("Published lock poisoned")
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    pub fn published_for(&self, step_id: &str) -> Vec<WorkUnit> {
        self.published()
            .into_iter()
            .filter(|u| u.step_id == step_id)
            .collect()
    }

    /// How many times a worker acted on `key`.
    pub fn executions(&self, key: &str) -> u32 {
        self.executions
            .lock()
            .expect("Executions lock poisoned")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_executions(&self) -> u32 {
        self.executions
            .lock()
            .expect("Executions lock poisoned")
            .values()
            .sum()
    }

    /// Deliver a reply by hand, e.g. for a held unit.
    pub fn reply(&self, reply: WorkerReply) {
        if let Some(handle) = self.handle.get() {
            handle
                .deliver_reply(reply)
                .expect("Engine should accept replies");
        }
    }
}

#[async_trait]
impl WorkerTransport for ScriptedWorkers {
    async fn publish(&self, topic: &str, unit: &WorkUnit) -> Result<(), TransportError> {
        if *self.refuse_publish.lock().expect("Refuse lock poisoned") {
            return Err(TransportError::Unavailable("bus is down".to_string()));
        }
        self.published
            .lock()
            .expect("Published lock poisoned")
            .push((topic.to_string(), unit.clone()));

        let responder = self
            .responders
            .lock()
            .expect("Responder lock poisoned")
            .get(&unit.action)
            .cloned();
        let reply = match responder {
            Some(responder) => responder(unit),
            None => Some(WorkerReply::success(unit.correlation_id, unit.params.clone())),
        };
        if let Some(reply) = reply {
            *self
                .executions
                .lock()
                .expect("Executions lock poisoned")
                .entry(unit.idempotency_key.clone())
                .or_default() += 1;
            self.reply(reply.with_worker(unit.worker_id.clone()));
        }
        Ok(())
    }

    async fn query_status(&self, correlation_id: Uuid) -> Result<DeliveryStatus, TransportError> {
        Ok(self
            .statuses
            .lock()
            .expect("Status lock poisoned")
            .get(&correlation_id)
            .cloned()
            .unwrap_or(DeliveryStatus::Unsupported))
    }
}

/// Judge that always gives the same score and counts its calls.
#[allow(dead_code)]
pub struct FixedJudge {
    pub score: f64,
    pub calls: AtomicUsize,
}

#[allow(dead_code)]
impl FixedJudge {
    pub fn new(score: f64) -> Arc<Self> {
        Arc::new(Self {
            score,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CriterionJudge for FixedJudge {
    async fn judge(&self, request: JudgeRequest) -> Result<JudgeScore, JudgeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let issues = if self.score < 0.8 {
            vec![format!("{} is weak", request.criterion.name)]
        } else {
            vec![]
        };
        Ok(JudgeScore {
            score: self.score,
            issues,
        })
    }
}

/// Proposer that offers the same steps at the top level and declares
/// every unit atomic.
#[allow(dead_code)]
pub struct StaticProposer {
    pub confidence: f64,
    pub steps: Vec<StepDefinition>,
    pub requests: AtomicUsize,
}

#[allow(dead_code)]
impl StaticProposer {
    pub fn new(confidence: f64, steps: Vec<StepDefinition>) -> Arc<Self> {
        Arc::new(Self {
            confidence,
            steps,
            requests: AtomicUsize::new(0),
        })
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlanProposer for StaticProposer {
    async fn propose(
        &self,
        worker_id: &str,
        request: &PlanRequest,
    ) -> Result<PlanResponse, PlanningError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if request.unit.is_some() {
            return Ok(PlanResponse::Atomic);
        }
        Ok(PlanResponse::Proposal(Proposal {
            worker_id: worker_id.to_string(),
            confidence: self.confidence,
            steps: self.steps.clone(),
        }))
    }
}

/// Proposer that always declines.
#[allow(dead_code)]
pub struct DecliningProposer;

#[async_trait]
impl PlanProposer for DecliningProposer {
    async fn propose(
        &self,
        _worker_id: &str,
        _request: &PlanRequest,
    ) -> Result<PlanResponse, PlanningError> {
        Ok(PlanResponse::Decline)
    }
}

/// Worker reply carrying `{"text": text}`.
#[allow(dead_code)]
pub fn text_reply(unit: &WorkUnit, text: &str) -> WorkerReply {
    WorkerReply::success(unit.correlation_id, json!({ "text": text }))
}
