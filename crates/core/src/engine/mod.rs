//! Process execution engine.
//!
//! The [`Engine`] owns every live instance and runs as a single task. It
//! reacts to three sources of work:
//!
//! 1. Commands from an [`EngineHandle`] (submit, control, queries)
//! 2. Callbacks from the background tasks it starts (publishes, replies,
//!    timers, quality verdicts, plans, recovery status queries)
//! 3. A periodic tick that re-checks blocked steps and wall clocks
//!
//! Every state change goes through [`Engine::record`], which appends the
//! transition to the journal before the change becomes visible and before
//! any effect that depends on it is started.

pub mod continuation;
pub mod handle;

mod children;
mod control;
mod replies;
mod scheduler;

pub use crate::recovery::RecoveryReport;
pub use handle::{outcome, EngineHandle};

use crate::definition::{validator, IssueKind, ValidationReport};
use crate::directory::CapabilityDirectory;
use crate::dispatch::Dispatcher;
use crate::error::{EngineError, EngineResult};
use crate::graph::ExecutionGraph;
use crate::journal::TransitionLog;
use crate::planning::{PlanProposer, Planner};
use crate::quality::{CriterionJudge, QualityEvaluator};
use crate::state;
use crate::transport::{ArtifactStore, MemoryArtifactStore, WorkerTransport};
use chrono::Utc;
use continuation::{Callback, Continuations};
use handle::Command;
use pe_protocol::config_models::EngineSettings;
use pe_protocol::definition_models::ProcessDefinition;
use pe_protocol::instance_models::{Phase, ProcessInstance, TerminationReason};
use pe_protocol::ipc::Event;
use pe_protocol::transition_models::{Transition, TransitionRecord};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The collaborators an engine talks to.
#[derive(Clone)]
pub struct EngineDeps {
    pub directory: Arc<dyn CapabilityDirectory>,
    pub transport: Arc<dyn WorkerTransport>,
    pub journal: Arc<dyn TransitionLog>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub judge: Option<Arc<dyn CriterionJudge>>,
    pub proposer: Option<Arc<dyn PlanProposer>>,
}

impl EngineDeps {
    /// Defaults to an in-memory artifact store, no judge and no proposer.
    pub fn new(
        directory: Arc<dyn CapabilityDirectory>,
        transport: Arc<dyn WorkerTransport>,
        journal: Arc<dyn TransitionLog>,
    ) -> Self {
        Self {
            directory,
            transport,
            journal,
            artifacts: Arc::new(MemoryArtifactStore::new()),
            judge: None,
            proposer: None,
        }
    }

    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_judge(mut self, judge: Arc<dyn CriterionJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn with_proposer(mut self, proposer: Arc<dyn PlanProposer>) -> Self {
        self.proposer = Some(proposer);
        self
    }
}

/// One live instance and the bookkeeping that is not part of its log.
pub(crate) struct Runtime {
    pub(crate) instance: ProcessInstance,
    pub(crate) graph: ExecutionGraph,
    /// Retrying steps whose backoff has elapsed.
    pub(crate) ready_retries: BTreeSet<String>,
    /// Blocked steps get another dispatch attempt on the next advance.
    pub(crate) recheck_blocked: bool,
    /// Steps with a quality evaluation running.
    pub(crate) evaluating: HashSet<String>,
    /// Steps with an outcome query running.
    pub(crate) resolving: HashSet<String>,
}

impl Runtime {
    pub(crate) fn new(instance: ProcessInstance, graph: ExecutionGraph) -> Self {
        Self {
            instance,
            graph,
            ready_retries: BTreeSet::new(),
            recheck_blocked: false,
            evaluating: HashSet::new(),
            resolving: HashSet::new(),
        }
    }
}

pub struct Engine {
    pub(crate) settings: EngineSettings,
    pub(crate) journal: Arc<dyn TransitionLog>,
    pub(crate) transport: Arc<dyn WorkerTransport>,
    pub(crate) artifacts: Arc<dyn ArtifactStore>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) evaluator: QualityEvaluator,
    pub(crate) planner: Planner,
    pub(crate) runtimes: HashMap<Uuid, Runtime>,
    /// Children by parent, in spawn order.
    pub(crate) children: HashMap<Uuid, Vec<Uuid>>,
    pub(crate) quarantined: BTreeMap<Uuid, String>,
    pub(crate) continuations: Continuations,
    pub(crate) waiters: HashMap<Uuid, Vec<oneshot::Sender<EngineResult<ProcessInstance>>>>,
    /// Instances due for an advance.
    pub(crate) queue: VecDeque<Uuid>,
    /// Instances that just reached a terminal phase.
    pub(crate) finished: VecDeque<Uuid>,
    pub(crate) callbacks_tx: mpsc::UnboundedSender<Callback>,
    pub(crate) events_tx: mpsc::Sender<Event>,
}

impl Engine {
    pub(crate) fn new(
        settings: EngineSettings,
        deps: EngineDeps,
        events_tx: mpsc::Sender<Event>,
        callbacks_tx: mpsc::UnboundedSender<Callback>,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            &settings,
            Arc::clone(&deps.directory),
            Arc::clone(&deps.transport),
            Arc::clone(&deps.artifacts),
        );
        let evaluator = QualityEvaluator::new(Arc::clone(&deps.directory), deps.judge.clone());
        let planner = Planner::new(Arc::clone(&deps.directory), deps.proposer.clone());
        Self {
            settings,
            journal: deps.journal,
            transport: deps.transport,
            artifacts: deps.artifacts,
            dispatcher,
            evaluator,
            planner,
            runtimes: HashMap::new(),
            children: HashMap::new(),
            quarantined: BTreeMap::new(),
            continuations: Continuations::default(),
            waiters: HashMap::new(),
            queue: VecDeque::new(),
            finished: VecDeque::new(),
            callbacks_tx,
            events_tx,
        }
    }

    /// Start an engine with no prior state.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn spawn(
        settings: EngineSettings,
        deps: EngineDeps,
        events_tx: mpsc::Sender<Event>,
    ) -> EngineHandle {
        let (callbacks_tx, callbacks_rx) = mpsc::unbounded_channel();
        Self::new(settings, deps, events_tx, callbacks_tx).start(callbacks_rx)
    }

    pub(crate) fn start(self, callbacks_rx: mpsc::UnboundedReceiver<Callback>) -> EngineHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handle = EngineHandle::new(commands_tx, self.callbacks_tx.clone());
        tokio::spawn(self.run(commands_rx, callbacks_rx));
        handle
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut callbacks: mpsc::UnboundedReceiver<Callback>,
    ) {
        let period = Duration::from_millis(self.settings.capacity_check_interval_ms.max(1));
        let mut tick = tokio::time::interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(instances = self.runtimes.len(), "Engine started");

        self.drain().await;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.stop();
                        break;
                    }
                },
                Some(callback) = callbacks.recv() => self.handle_callback(callback).await,
                _ = tick.tick() => self.on_tick().await,
            }
            self.drain().await;
        }
        info!("Engine stopped");
    }

    fn stop(&mut self) {
        self.continuations.clear();
        // Dropping the senders wakes every waiter with EngineStopped.
        self.waiters.clear();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit {
                definition,
                inputs,
                reply,
            } => {
                let result = self.submit(definition, inputs).await;
                let _ = reply.send(result);
            }
            Command::Control { signal, reply } => {
                let result = self.control(signal).await;
                let _ = reply.send(result);
            }
            Command::Snapshot { instance_id, reply } => {
                let _ = reply.send(self.snapshot(instance_id));
            }
            Command::Descendants { instance_id, reply } => {
                let _ = reply.send(self.descendants(instance_id));
            }
            Command::WaitTerminal { instance_id, reply } => self.wait(instance_id, reply),
            Command::Quarantined { reply } => {
                let list = self
                    .quarantined
                    .iter()
                    .map(|(id, reason)| (*id, reason.clone()))
                    .collect();
                let _ = reply.send(list);
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn handle_callback(&mut self, callback: Callback) {
        match callback {
            Callback::Published { correlation_id } => {
                if let Some(id) = self.owner(&correlation_id) {
                    let result = self.on_published(correlation_id).await;
                    self.guard(id, result);
                }
            }
            Callback::PublishFailed {
                correlation_id,
                error,
            } => {
                if let Some(id) = self.owner(&correlation_id) {
                    let result = self.on_publish_failed(correlation_id, error).await;
                    self.guard(id, result);
                }
            }
            Callback::TimedOut { correlation_id } => {
                if let Some(id) = self.owner(&correlation_id) {
                    let result = self.on_timeout(correlation_id).await;
                    self.guard(id, result);
                }
            }
            Callback::Reply(reply) => self.on_reply(reply).await,
            Callback::RetryDue {
                instance_id,
                step_id,
            } => self.on_retry_due(instance_id, step_id),
            Callback::Verdict {
                instance_id,
                step_id,
                attempt,
                verdict,
            } => {
                let result = self.on_verdict(instance_id, &step_id, attempt, verdict).await;
                self.guard(instance_id, result);
            }
            Callback::PlanReady {
                instance_id,
                result,
            } => {
                let result = self.on_plan_ready(instance_id, result).await;
                self.guard(instance_id, result);
            }
            Callback::Resolved {
                instance_id,
                step_id,
                correlation_id,
                result,
            } => {
                let result = self
                    .on_resolved(instance_id, &step_id, correlation_id, result)
                    .await;
                self.guard(instance_id, result);
            }
        }
    }

    /// Advance queued instances and report finished ones until both queues
    /// are empty.
    pub(crate) async fn drain(&mut self) {
        loop {
            if let Some(id) = self.finished.pop_front() {
                self.on_terminal(id).await;
            } else if let Some(id) = self.queue.pop_front() {
                let result = self.advance(id).await;
                self.guard(id, result);
            } else {
                break;
            }
        }
    }

    fn owner(&self, correlation_id: &Uuid) -> Option<Uuid> {
        self.continuations.get(correlation_id).map(|c| c.instance_id)
    }

    /// Quarantine an instance whose handling failed.
    pub(crate) fn guard(&mut self, instance_id: Uuid, result: EngineResult<()>) {
        if let Err(e) = result {
            error!(
                instance_id = %instance_id,
                error = %e,
                "Instance handling failed; quarantining"
            );
            self.quarantine(instance_id, e.to_string());
        }
    }

    pub(crate) fn quarantine(&mut self, instance_id: Uuid, reason: String) {
        self.runtimes.remove(&instance_id);
        self.continuations.discard_instance(instance_id);
        self.queue.retain(|id| *id != instance_id);
        emit(
            &self.events_tx,
            Event::InstanceQuarantined {
                instance_id,
                error: reason.clone(),
            },
        );
        for waiter in self.waiters.remove(&instance_id).unwrap_or_default() {
            let _ = waiter.send(Err(EngineError::RecoveryInconsistency {
                instance_id,
                reason: reason.clone(),
            }));
        }
        self.quarantined.insert(instance_id, reason);
    }

    pub(crate) fn instance(&self, instance_id: Uuid) -> EngineResult<&ProcessInstance> {
        self.runtimes
            .get(&instance_id)
            .map(|r| &r.instance)
            .ok_or(EngineError::InstanceNotFound(instance_id))
    }

    /// Whether the instance exists and is not terminal.
    pub(crate) fn is_live(&self, instance_id: Uuid) -> bool {
        self.runtimes
            .get(&instance_id)
            .is_some_and(|r| !r.instance.is_terminal())
    }

    fn missing(&self, instance_id: Uuid) -> EngineError {
        match self.quarantined.get(&instance_id) {
            Some(reason) => EngineError::RecoveryInconsistency {
                instance_id,
                reason: reason.clone(),
            },
            None => EngineError::InstanceNotFound(instance_id),
        }
    }

    fn snapshot(&self, instance_id: Uuid) -> EngineResult<ProcessInstance> {
        self.runtimes
            .get(&instance_id)
            .map(|r| r.instance.clone())
            .ok_or_else(|| self.missing(instance_id))
    }

    fn descendants(&self, instance_id: Uuid) -> EngineResult<Vec<Uuid>> {
        if !self.runtimes.contains_key(&instance_id) {
            return Err(self.missing(instance_id));
        }
        let mut subtree = self.subtree(instance_id);
        subtree.remove(0);
        Ok(subtree)
    }

    /// The instance and all of its descendants, breadth first.
    pub(crate) fn subtree(&self, instance_id: Uuid) -> Vec<Uuid> {
        let mut found = vec![instance_id];
        let mut next = 0;
        while next < found.len() {
            if let Some(kids) = self.children.get(&found[next]) {
                found.extend(kids.iter().copied());
            }
            next += 1;
        }
        found
    }

    fn wait(
        &mut self,
        instance_id: Uuid,
        reply: oneshot::Sender<EngineResult<ProcessInstance>>,
    ) {
        match self.runtimes.get(&instance_id) {
            Some(r) if r.instance.is_terminal() => {
                let _ = reply.send(Ok(r.instance.clone()));
            }
            Some(_) => self.waiters.entry(instance_id).or_default().push(reply),
            None => {
                let _ = reply.send(Err(self.missing(instance_id)));
            }
        }
    }

    async fn submit(
        &mut self,
        definition: ProcessDefinition,
        inputs: BTreeMap<String, Value>,
    ) -> EngineResult<Uuid> {
        validator::validate(&definition)?;
        let mut report = ValidationReport::default();
        for input in &definition.inputs {
            if !inputs.contains_key(input) {
                report.push(
                    format!("inputs.{input}"),
                    IssueKind::Schema,
                    format!("input '{input}' is not bound"),
                );
            }
        }
        report.into_result()?;

        let id = Uuid::new_v4();
        let budget = definition
            .budget
            .clone()
            .unwrap_or_else(|| self.settings.default_budget.clone());
        let variables = inputs
            .into_iter()
            .map(|(name, value)| (format!("inputs.{name}"), value))
            .collect();
        self.create_instance(
            id,
            Transition::Created {
                definition,
                parent: None,
                root_id: id,
                depth: 0,
                path: vec![],
                budget,
                variables,
            },
        )
        .await?;
        Ok(id)
    }

    /// Journal the `Created` record of a new instance and start tracking it.
    pub(crate) async fn create_instance(
        &mut self,
        instance_id: Uuid,
        created: Transition,
    ) -> EngineResult<()> {
        let record = TransitionRecord {
            instance_id,
            seq: 0,
            at: Utc::now(),
            transition: created,
        };
        let instance = state::create(&record)?;
        let graph = ExecutionGraph::compile(&instance.definition)?;
        self.journal.append(&record).await?;

        info!(
            instance_id = %instance_id,
            root_id = %instance.root_id,
            depth = instance.depth,
            name = %instance.definition.name,
            "Instance created"
        );
        emit(
            &self.events_tx,
            Event::InstanceStarted {
                instance_id,
                root_id: instance.root_id,
                parent_id: instance.parent_id(),
                name: instance.definition.name.clone(),
            },
        );
        if let Some(parent) = instance.parent_id() {
            self.children.entry(parent).or_default().push(instance_id);
        }
        self.runtimes
            .insert(instance_id, Runtime::new(instance, graph));
        self.queue.push_back(instance_id);
        Ok(())
    }

    /// Journal one transition and apply it.
    ///
    /// The transition is applied to a copy first; nothing changes unless it
    /// is legal and durably appended.
    pub(crate) async fn record(&mut self, instance_id: Uuid, transition: Transition) -> EngineResult<()> {
        let runtime = self
            .runtimes
            .get_mut(&instance_id)
            .ok_or(EngineError::InstanceNotFound(instance_id))?;
        let record = TransitionRecord {
            instance_id,
            seq: runtime.instance.last_seq + 1,
            at: Utc::now(),
            transition,
        };
        let mut next = runtime.instance.clone();
        state::apply(&mut next, &record)?;
        let graph = match &record.transition {
            Transition::PlanSynthesized { .. } => Some(ExecutionGraph::compile(&next.definition)?),
            _ => None,
        };
        self.journal.append(&record).await?;

        if let Some(graph) = graph {
            runtime.graph = graph;
        }
        runtime.instance = next;
        debug!(
            instance_id = %instance_id,
            seq = record.seq,
            "Transition recorded"
        );
        for event in events_for(&record, &runtime.instance) {
            emit(&self.events_tx, event);
        }
        if runtime.instance.is_terminal() {
            self.finished.push_back(instance_id);
        }
        Ok(())
    }
}

/// Observer events for a recorded transition.
fn events_for(record: &TransitionRecord, instance: &ProcessInstance) -> Vec<Event> {
    let instance_id = record.instance_id;
    match &record.transition {
        Transition::PhaseChanged { to, reason } => {
            let mut events = vec![Event::PhaseChanged {
                instance_id,
                phase: *to,
            }];
            let text = reason
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| to.to_string());
            match to {
                Phase::Completed => events.push(Event::InstanceCompleted { instance_id }),
                Phase::Escalated => events.push(Event::InstanceEscalated {
                    instance_id,
                    reason: text,
                }),
                Phase::Failed => {
                    if let Some(TerminationReason::BudgetExhausted { dimension }) = reason {
                        events.push(Event::BudgetExhausted {
                            instance_id,
                            dimension: *dimension,
                        });
                    }
                    events.push(Event::InstanceFailed {
                        instance_id,
                        reason: text,
                    });
                }
                Phase::Cancelled => events.push(Event::InstanceCancelled { instance_id }),
                _ => {}
            }
            events
        }
        Transition::StepDispatched { step_id, .. }
        | Transition::StepRedispatched { step_id, .. }
        | Transition::StepAwaitingResult { step_id, .. }
        | Transition::StepBlocked { step_id, .. }
        | Transition::StepSucceeded { step_id, .. }
        | Transition::StepFailed { step_id, .. }
        | Transition::StepRetrying { step_id, .. }
        | Transition::StepOutcomeUnknown { step_id, .. } => instance
            .step(step_id)
            .map(|step| Event::StepStatusChanged {
                instance_id,
                step_id: step_id.clone(),
                status: step.status,
                attempt: step.attempts,
            })
            .into_iter()
            .collect(),
        _ => vec![],
    }
}

/// Best-effort delivery; a full observer buffer never stalls the engine.
pub(crate) fn emit(events: &mpsc::Sender<Event>, event: Event) {
    match events.try_send(event) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(event)) => {
            warn!(event = ?event, "Event buffer full; dropping event");
        }
    }
}
