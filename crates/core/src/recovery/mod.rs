//! Crash recovery.
//!
//! [`Engine::recover`] rebuilds every instance from its log and resumes the
//! ones that were still running:
//!
//! - Steps that were in flight become `UnknownOutcome` and are resolved by
//!   asking the transport what happened to their unit. A unit no worker saw
//!   is re-sent with its original correlation id and idempotency key; a
//!   unit that completed has its stored reply applied; nothing is executed
//!   twice.
//! - Planning that was interrupted starts again.
//! - Outputs awaiting a verdict are evaluated again.
//! - Children whose creation was interrupted are created, and children that
//!   finished unreported are reported.
//!
//! An instance whose log cannot be replayed is quarantined; the others are
//! unaffected.

use crate::dispatch::arm_timeout;
use crate::engine::continuation::{Callback, Continuation};
use crate::engine::{Engine, EngineDeps, EngineHandle, Runtime};
use crate::error::{EngineError, EngineResult};
use crate::graph::ExecutionGraph;
use crate::state;
use crate::transport::TransportError;
use pe_protocol::bus_models::DeliveryStatus;
use pe_protocol::config_models::EngineSettings;
use pe_protocol::definition_models::{ErrorKind, StepKind};
use pe_protocol::instance_models::{Budget, Phase, ResultRef, StepError, StepStatus};
use pe_protocol::ipc::Event;
use pe_protocol::transition_models::{Transition, TransitionRecord};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What recovery found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Instances rebuilt from their logs.
    pub recovered: usize,
    /// Non-terminal instances that were resumed.
    pub resumed: usize,
    pub quarantined: Vec<(Uuid, String)>,
    /// Steps whose outcome had to be resolved with the transport.
    pub unknown_outcomes: usize,
}

/// A child spawn journaled on the parent.
struct Spawned {
    child_id: Uuid,
    index: usize,
    budget: Budget,
    bindings: BTreeMap<String, Value>,
}

fn spawns(records: &[TransitionRecord], step_id: &str) -> Vec<Spawned> {
    records
        .iter()
        .filter_map(|r| match &r.transition {
            Transition::ChildSpawned {
                step_id: s,
                child_id,
                index,
                budget,
                bindings,
            } if s == step_id => Some(Spawned {
                child_id: *child_id,
                index: *index,
                budget: budget.clone(),
                bindings: bindings.clone(),
            }),
            _ => None,
        })
        .collect()
}

fn rebuild(instance_id: Uuid, records: &[TransitionRecord]) -> EngineResult<Runtime> {
    let instance = state::replay(records).map_err(|e| EngineError::RecoveryInconsistency {
        instance_id,
        reason: e.to_string(),
    })?;
    let graph = ExecutionGraph::compile(&instance.definition)?;
    Ok(Runtime::new(instance, graph))
}

impl Engine {
    /// Rebuild state from the journal and start the engine.
    ///
    /// # Errors
    ///
    /// Fails only when the journal cannot list its instances. Individual
    /// unreadable logs are quarantined and listed in the report.
    pub async fn recover(
        settings: EngineSettings,
        deps: EngineDeps,
        events_tx: mpsc::Sender<Event>,
    ) -> EngineResult<(EngineHandle, RecoveryReport)> {
        let (callbacks_tx, callbacks_rx) = mpsc::unbounded_channel();
        let mut engine = Engine::new(settings, deps, events_tx, callbacks_tx);
        let report = engine.restore().await?;
        info!(
            recovered = report.recovered,
            resumed = report.resumed,
            quarantined = report.quarantined.len(),
            unknown_outcomes = report.unknown_outcomes,
            "Recovery finished"
        );
        Ok((engine.start(callbacks_rx), report))
    }

    async fn restore(&mut self) -> EngineResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut logs: HashMap<Uuid, Vec<TransitionRecord>> = HashMap::new();
        for id in self.journal.instances().await? {
            let rebuilt = match self.journal.read(id).await {
                Ok(records) => rebuild(id, &records).map(|runtime| (runtime, records)),
                Err(e) => Err(e.into()),
            };
            match rebuilt {
                Ok((runtime, records)) => {
                    self.runtimes.insert(id, runtime);
                    logs.insert(id, records);
                    report.recovered += 1;
                }
                Err(e) => {
                    error!(instance_id = %id, error = %e, "Quarantining unreadable instance");
                    self.quarantine(id, e.to_string());
                }
            }
        }

        let mut linked: Vec<(Uuid, Uuid, usize)> = self
            .runtimes
            .values()
            .filter_map(|r| {
                r.instance
                    .parent
                    .as_ref()
                    .map(|p| (p.instance_id, r.instance.id, p.index))
            })
            .collect();
        linked.sort_by_key(|&(parent, _, index)| (parent, index));
        for (parent, child, _) in linked {
            self.children.entry(parent).or_default().push(child);
        }

        let mut live: Vec<(u32, Uuid)> = self
            .runtimes
            .values()
            .filter(|r| !r.instance.is_terminal())
            .map(|r| (r.instance.depth, r.instance.id))
            .collect();
        live.sort();
        for (_, id) in live {
            report.resumed += 1;
            let result = self.resume(id, &logs, &mut report).await;
            self.guard(id, result);
        }

        // Children that finished before their parent heard about it.
        let unreported: Vec<Uuid> = self
            .runtimes
            .values()
            .filter(|r| r.instance.is_terminal())
            .filter(|r| {
                r.instance.parent.as_ref().is_some_and(|link| {
                    self.runtimes.get(&link.instance_id).is_some_and(|p| {
                        !p.instance.is_terminal()
                            && p.instance.step(&link.step_id).is_some_and(|s| {
                                s.children
                                    .iter()
                                    .any(|c| c.child_id == r.instance.id && c.phase.is_none())
                            })
                    })
                })
            })
            .map(|r| r.instance.id)
            .collect();
        self.finished.extend(unreported);
        report.quarantined = self
            .quarantined
            .iter()
            .map(|(id, reason)| (*id, reason.clone()))
            .collect();
        Ok(report)
    }

    async fn resume(
        &mut self,
        id: Uuid,
        logs: &HashMap<Uuid, Vec<TransitionRecord>>,
        report: &mut RecoveryReport,
    ) -> EngineResult<()> {
        let instance = self.instance(id)?.clone();
        info!(
            instance_id = %id,
            phase = %instance.phase,
            "Resuming instance"
        );

        if let Some(parent_id) = instance.parent_id() {
            if !self.is_live(parent_id) {
                self.request_cancel(id).await?;
            }
        }

        for state in instance.steps.values() {
            if let (Some(ResultRef::Artifact(reference)), Some(correlation_id)) =
                (&state.last_result, state.correlation_id)
            {
                if let Err(message) = self
                    .register_output(id, &state.step_id, correlation_id, reference)
                    .await
                {
                    warn!(instance_id = %id, step_id = %state.step_id, error = %message, "Could not re-register output");
                }
            }
        }

        if instance.phase == Phase::Planning {
            self.spawn_planning(id)?;
            self.queue.push_back(id);
            return Ok(());
        }

        for state in instance.steps.values() {
            let Some(step) = instance.definition.step(&state.step_id) else {
                continue;
            };
            let action = matches!(step.kind(), StepKind::Action { .. });
            match state.status {
                StepStatus::Dispatched | StepStatus::AwaitingResult
                    if action && state.candidate.is_none() =>
                {
                    let Some(correlation_id) = state.correlation_id else {
                        continue;
                    };
                    self.record(
                        id,
                        Transition::StepOutcomeUnknown {
                            step_id: state.step_id.clone(),
                            correlation_id,
                        },
                    )
                    .await?;
                    report.unknown_outcomes += 1;
                    self.resolve_unknown(id, &state.step_id)?;
                }
                StepStatus::UnknownOutcome => {
                    report.unknown_outcomes += 1;
                    self.resolve_unknown(id, &state.step_id)?;
                }
                StepStatus::AwaitingResult if state.candidate.is_some() => {
                    self.begin_evaluation(id, &state.step_id).await?;
                }
                StepStatus::AwaitingResult => {
                    let records = logs.get(&id).map(Vec::as_slice).unwrap_or_default();
                    self.resume_children(id, &state.step_id, records).await?;
                }
                StepStatus::Retrying => {
                    if let Some(runtime) = self.runtimes.get_mut(&id) {
                        runtime.ready_retries.insert(state.step_id.clone());
                    }
                }
                _ => {}
            }
        }
        self.queue.push_back(id);
        Ok(())
    }

    async fn resume_children(
        &mut self,
        id: Uuid,
        step_id: &str,
        records: &[TransitionRecord],
    ) -> EngineResult<()> {
        let spawned = spawns(records, step_id);
        for child in &spawned {
            if self.runtimes.contains_key(&child.child_id) {
                continue;
            }
            if self.quarantined.contains_key(&child.child_id) {
                let (_, state) = self.step_parts(id, step_id)?;
                let reported = state
                    .children
                    .iter()
                    .any(|c| c.child_id == child.child_id && c.phase.is_some());
                if reported {
                    continue;
                }
                warn!(
                    instance_id = %id,
                    child_id = %child.child_id,
                    "Child is quarantined; counting it as failed"
                );
                self.record(
                    id,
                    Transition::ChildTerminated {
                        step_id: step_id.to_string(),
                        child_id: child.child_id,
                        phase: Phase::Failed,
                        output: None,
                    },
                )
                .await?;
                continue;
            }
            info!(instance_id = %id, child_id = %child.child_id, "Creating interrupted child");
            self.create_child(
                id,
                step_id,
                child.child_id,
                child.index,
                child.budget.clone(),
                child.bindings.clone(),
            )
            .await?;
        }

        let (step, _) = self.step_parts(id, step_id)?;
        if let (Some(expected), Some(first)) = (self.expected_children(id, &step), spawned.first()) {
            if spawned.len() < expected {
                let taken: BTreeSet<usize> = spawned.iter().map(|s| s.index).collect();
                self.spawn_missing(id, &step, expected, &taken, first.budget.clone())
                    .await?;
            }
        }
        self.aggregate(id, step_id).await
    }

    /// Ask the transport what became of a step's unit.
    pub(crate) fn resolve_unknown(&mut self, id: Uuid, step_id: &str) -> EngineResult<()> {
        let (_, state) = self.step_parts(id, step_id)?;
        let Some(correlation_id) = state.correlation_id else {
            return Ok(());
        };
        let Some(runtime) = self.runtimes.get_mut(&id) else {
            return Ok(());
        };
        if !runtime.resolving.insert(step_id.to_string()) {
            return Ok(());
        }
        let transport = self.transport.clone();
        let tx = self.callbacks_tx.clone();
        let key = state.idempotency_key.clone();
        let step_id = step_id.to_string();
        tokio::spawn(async move {
            let result = match transport.query_status(correlation_id).await {
                Ok(DeliveryStatus::Unsupported) => match &key {
                    Some(key) => transport.check_idempotency(key).await,
                    None => Ok(DeliveryStatus::Unsupported),
                },
                other => other,
            };
            let _ = tx.send(Callback::Resolved {
                instance_id: id,
                step_id,
                correlation_id,
                result,
            });
        });
        Ok(())
    }

    pub(crate) async fn on_resolved(
        &mut self,
        id: Uuid,
        step_id: &str,
        correlation_id: Uuid,
        result: Result<DeliveryStatus, TransportError>,
    ) -> EngineResult<()> {
        let Some(runtime) = self.runtimes.get_mut(&id) else {
            return Ok(());
        };
        runtime.resolving.remove(step_id);
        if runtime.instance.is_terminal() {
            return Ok(());
        }
        let (step, state) = self.step_parts(id, step_id)?;
        if state.status != StepStatus::UnknownOutcome || state.correlation_id != Some(correlation_id) {
            return Ok(());
        }
        let timeout_ms = step.timeout_ms.unwrap_or(self.settings.default_timeout_ms);

        match result {
            Ok(DeliveryStatus::Completed { mut reply }) => {
                info!(instance_id = %id, step_id = %step_id, "Unit already executed; applying its reply");
                reply.correlation_id = correlation_id;
                self.continuations.insert(
                    correlation_id,
                    Continuation::new(id, step_id, state.attempts, timeout_ms),
                );
                self.on_reply(reply).await;
                Ok(())
            }
            Ok(DeliveryStatus::InProgress) => {
                info!(instance_id = %id, step_id = %step_id, "Unit still running; waiting for its reply");
                self.record(
                    id,
                    Transition::StepAwaitingResult {
                        step_id: step_id.to_string(),
                        correlation_id,
                    },
                )
                .await?;
                let timer = arm_timeout(correlation_id, timeout_ms, self.callbacks_tx.clone());
                self.continuations.insert(
                    correlation_id,
                    Continuation::new(id, step_id, state.attempts, timeout_ms).with_timer(timer),
                );
                Ok(())
            }
            Ok(DeliveryStatus::NeverSeen) | Ok(DeliveryStatus::Unsupported)
                if self.instance(id)?.cancel_requested =>
            {
                info!(instance_id = %id, step_id = %step_id, "Cancelled before delivery; not sending the unit");
                self.record(
                    id,
                    Transition::StepFailed {
                        step_id: step_id.to_string(),
                        error: StepError {
                            kind: ErrorKind::Internal,
                            message: "cancelled before the unit was delivered".to_string(),
                            retryable: false,
                        },
                    },
                )
                .await?;
                self.queue.push_back(id);
                Ok(())
            }
            Ok(DeliveryStatus::NeverSeen) | Ok(DeliveryStatus::Unsupported) => {
                self.redispatch(id, step_id, timeout_ms).await
            }
            Err(e) => {
                warn!(
                    instance_id = %id,
                    step_id = %step_id,
                    error = %e,
                    "Outcome query failed; retrying on the next tick"
                );
                Ok(())
            }
        }
    }

    /// Send the same unit again: same attempt, correlation id, idempotency
    /// key and worker.
    async fn redispatch(&mut self, id: Uuid, step_id: &str, timeout_ms: u64) -> EngineResult<()> {
        let (step, state) = self.step_parts(id, step_id)?;
        let (Some(correlation_id), Some(key)) = (state.correlation_id, state.idempotency_key.clone()) else {
            return Ok(());
        };
        let prepared = {
            let instance = self.instance(id)?;
            self.dispatcher
                .prepare(instance, &step, state.attempts, correlation_id, state.worker_id.as_deref())
                .await
        };
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(
                    instance_id = %id,
                    step_id = %step_id,
                    error = %e,
                    "Re-dispatch not possible yet; retrying on the next tick"
                );
                return Ok(());
            }
        };
        self.record(
            id,
            Transition::StepRedispatched {
                step_id: step_id.to_string(),
                correlation_id,
            },
        )
        .await?;
        info!(
            instance_id = %id,
            step_id = %step_id,
            correlation_id = %correlation_id,
            worker_id = %prepared.worker_id,
            "Step re-dispatched"
        );
        let unit = self.dispatcher.work_unit(
            id,
            step_id,
            state.attempts,
            correlation_id,
            key,
            timeout_ms,
            prepared,
        );
        let timer = self.dispatcher.send(unit, &self.callbacks_tx);
        self.continuations.insert(
            correlation_id,
            Continuation::new(id, step_id, state.attempts, timeout_ms).with_timer(timer),
        );
        Ok(())
    }
}
