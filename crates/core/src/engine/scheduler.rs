//! Moving instances forward: phases, readiness, dispatch and the tick.

use super::continuation::{Callback, Continuation};
use super::Engine;
use crate::definition::template;
use crate::dispatch::idempotency_key;
use crate::error::{EngineError, EngineResult};
use crate::planning::skip_reason;
use crate::state::{budget, decide, terminal_phase, Charge, Decision, DecisionInput, TransitionError, Trigger};
use chrono::{DateTime, Utc};
use pe_protocol::definition_models::{ErrorKind, RetryPolicy, StepDefinition, StepKind};
use pe_protocol::instance_models::{
    BudgetDimension, Phase, StepError, StepState, StepStatus, TerminationReason,
};
use pe_protocol::transition_models::Transition;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub(crate) fn exhausted(dimension: BudgetDimension) -> TerminationReason {
    TerminationReason::BudgetExhausted { dimension }
}

impl Engine {
    /// Do whatever the instance is ready for.
    ///
    /// Safe to call at any time: an instance with nothing to do is left as
    /// it is.
    pub(crate) async fn advance(&mut self, id: Uuid) -> EngineResult<()> {
        let Some(runtime) = self.runtimes.get(&id) else {
            return Ok(());
        };
        let instance = &runtime.instance;
        if instance.is_terminal() {
            return Ok(());
        }
        if instance.cancel_requested {
            return self.finish_cancelled(id).await;
        }
        match instance.phase {
            Phase::Pending => return self.leave_pending(id).await,
            Phase::Planning => return Ok(()),
            _ => {}
        }
        if budget::wall_clock_exhausted(instance, Utc::now()) {
            return self.escalate(id, exhausted(BudgetDimension::WallClock)).await;
        }

        let phase = instance.phase;
        let paused = instance.paused;
        let evaluating = instance.steps.values().any(|s| s.candidate.is_some());
        let done = instance
            .steps
            .values()
            .all(|s| s.status == StepStatus::Succeeded);
        if done {
            return self.finalize(id).await;
        }
        match (phase, evaluating) {
            (Phase::Executing, true) => self.set_phase(id, Phase::Evaluating).await?,
            (Phase::Evaluating, false) => self.set_phase(id, Phase::Executing).await?,
            _ => {}
        }
        if paused {
            return Ok(());
        }

        for step_id in self.ready_steps(id) {
            let stop = self
                .runtimes
                .get(&id)
                .map_or(true, |r| r.instance.is_terminal() || r.instance.cancel_requested);
            if stop {
                break;
            }
            self.start_step(id, &step_id).await?;
        }
        Ok(())
    }

    /// Steps to start now: eligible pending steps, retries whose backoff has
    /// elapsed and, after a tick, blocked steps.
    fn ready_steps(&mut self, id: Uuid) -> Vec<String> {
        let Some(runtime) = self.runtimes.get_mut(&id) else {
            return vec![];
        };
        let instance = &runtime.instance;
        let mut ready: Vec<String> = runtime
            .graph
            .eligible(|s| instance.step(s).map(|st| st.status))
            .into_iter()
            .map(str::to_string)
            .collect();
        for (step_id, state) in &instance.steps {
            let due = match state.status {
                StepStatus::Retrying => runtime.ready_retries.contains(step_id),
                StepStatus::Blocked => runtime.recheck_blocked,
                _ => false,
            };
            if due {
                ready.push(step_id.clone());
            }
        }
        runtime.recheck_blocked = false;
        for step_id in &ready {
            runtime.ready_retries.remove(step_id);
        }
        ready
    }

    /// Leave `Pending`, through planning when the definition asks for it.
    async fn leave_pending(&mut self, id: Uuid) -> EngineResult<()> {
        let definition = self.instance(id)?.definition.clone();
        if definition.planning.is_some() {
            if let Some(skip) = skip_reason(&definition, self.settings.force_direct_execution) {
                info!(instance_id = %id, reason = %skip, "Skipping planning");
            } else if let Some(plan) = self.planner.cached(&definition).await {
                info!(instance_id = %id, "Reusing cached plan");
                self.set_phase(id, Phase::Planning).await?;
                if !self.is_live(id) {
                    return Ok(());
                }
                self.record(
                    id,
                    Transition::PlanSynthesized {
                        definition: plan,
                        cached: true,
                    },
                )
                .await?;
            } else {
                self.set_phase(id, Phase::Planning).await?;
                if self.is_live(id) {
                    self.spawn_planning(id)?;
                }
                return Ok(());
            }
        }
        self.set_phase(id, Phase::Executing).await?;
        self.queue.push_back(id);
        Ok(())
    }

    pub(crate) fn spawn_planning(&self, id: Uuid) -> EngineResult<()> {
        let definition = self.instance(id)?.definition.clone();
        let planner = self.planner.clone();
        let tx = self.callbacks_tx.clone();
        info!(instance_id = %id, "Planning started");
        tokio::spawn(async move {
            let result = planner.plan(id, &definition).await;
            let _ = tx.send(Callback::PlanReady {
                instance_id: id,
                result,
            });
        });
        Ok(())
    }

    /// Move to a non-terminal phase, unless the wall clock has run out.
    pub(crate) async fn set_phase(&mut self, id: Uuid, phase: Phase) -> EngineResult<()> {
        let instance = self.instance(id)?;
        if instance.phase == phase || instance.is_terminal() {
            return Ok(());
        }
        if !instance.cancel_requested && budget::wall_clock_exhausted(instance, Utc::now()) {
            return self.escalate(id, exhausted(BudgetDimension::WallClock)).await;
        }
        debug!(
            instance_id = %id,
            from = %instance.phase,
            to = %phase,
            "Phase changed"
        );
        self.record(id, Transition::PhaseChanged { to: phase, reason: None })
            .await
    }

    /// Stop the instance with `reason`.
    ///
    /// Once cancellation is requested it decides the outcome; any other
    /// reason only requeues the instance so cancellation can finish.
    pub(crate) async fn escalate(&mut self, id: Uuid, reason: TerminationReason) -> EngineResult<()> {
        let instance = self.instance(id)?;
        if instance.is_terminal() {
            return Ok(());
        }
        let cancelling = matches!(
            reason,
            TerminationReason::Cancelled | TerminationReason::ParentTerminated { .. }
        );
        if instance.cancel_requested && !cancelling {
            self.queue.push_back(id);
            return Ok(());
        }
        let phase = terminal_phase(&reason);
        warn!(
            instance_id = %id,
            phase = %phase,
            reason = %reason,
            "Instance stopped"
        );
        self.record(
            id,
            Transition::PhaseChanged {
                to: phase,
                reason: Some(reason),
            },
        )
        .await
    }

    /// Cancel once nothing is in flight.
    async fn finish_cancelled(&mut self, id: Uuid) -> EngineResult<()> {
        let instance = self.instance(id)?;
        if instance.in_flight_steps().next().is_some() {
            return Ok(());
        }
        let reason = match instance.parent_id() {
            Some(parent_id) if !self.is_live(parent_id) => {
                TerminationReason::ParentTerminated { parent_id }
            }
            _ => TerminationReason::Cancelled,
        };
        self.escalate(id, reason).await
    }

    async fn finalize(&mut self, id: Uuid) -> EngineResult<()> {
        self.set_phase(id, Phase::Finalizing).await?;
        if !self.is_live(id) {
            return Ok(());
        }
        let instance = self.instance(id)?;
        let rendered: Result<BTreeMap<String, _>, TerminationReason> = instance
            .definition
            .outputs
            .iter()
            .map(|(name, source)| {
                template::render_str(source, &instance.variables)
                    .map(|value| (name.clone(), value))
                    .map_err(|e| TerminationReason::StepEscalated {
                        step_id: format!("outputs.{name}"),
                        message: e.to_string(),
                    })
            })
            .collect();
        let outputs = match rendered {
            Ok(outputs) => outputs,
            Err(reason) => return self.escalate(id, reason).await,
        };
        if !outputs.is_empty() {
            self.record(id, Transition::OutputsBound { outputs }).await?;
        }
        info!(instance_id = %id, "Instance completed");
        self.record(
            id,
            Transition::PhaseChanged {
                to: Phase::Completed,
                reason: Some(TerminationReason::AllStepsSucceeded),
            },
        )
        .await
    }

    pub(crate) fn step_parts(&self, id: Uuid, step_id: &str) -> EngineResult<(StepDefinition, StepState)> {
        let instance = self.instance(id)?;
        let unknown = || EngineError::Transition(TransitionError::UnknownStep(step_id.to_string()));
        let definition = instance.definition.step(step_id).cloned().ok_or_else(unknown)?;
        let state = instance.step(step_id).cloned().ok_or_else(unknown)?;
        Ok((definition, state))
    }

    pub(crate) fn retry_policy(&self, step: &StepDefinition) -> RetryPolicy {
        step.retry
            .clone()
            .unwrap_or_else(|| self.settings.default_retry.clone())
    }

    async fn start_step(&mut self, id: Uuid, step_id: &str) -> EngineResult<()> {
        let (step, state) = self.step_parts(id, step_id)?;
        let instance = self.instance(id)?;
        let items = match super::children::loop_items(instance, &step) {
            Ok(items) => items,
            Err(message) => {
                let error = StepError {
                    kind: ErrorKind::InvalidInput,
                    message,
                    retryable: false,
                };
                return self.fail_and_decide(id, step_id, error).await;
            }
        };
        let charge = match step.kind() {
            StepKind::Action { .. } => Charge::dispatch(),
            _ => Charge::default(),
        };
        let retry = self.retry_policy(&step);
        let decision = decide(DecisionInput {
            step: &step,
            state: &state,
            retry: &retry,
            budget: budget::check(instance, &charge, Utc::now()),
            trigger: Trigger::Ready {
                items: items.as_ref().map(Vec::len),
            },
        });
        match decision {
            Decision::Proceed => self.dispatch(id, &step, &state).await,
            Decision::SpawnChildren { count } => self.spawn_children(id, &step, count, items).await,
            Decision::Escalate { reason } => self.escalate(id, reason).await,
            Decision::Retry { .. } => Ok(()),
        }
    }

    /// Send the next attempt of an action step.
    async fn dispatch(&mut self, id: Uuid, step: &StepDefinition, state: &StepState) -> EngineResult<()> {
        let attempt = state.attempts + 1;
        let correlation_id = Uuid::new_v4();
        let prepared = {
            let instance = self.instance(id)?;
            self.dispatcher
                .prepare(instance, step, attempt, correlation_id, None)
                .await
        };
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) if e.blocks() => return self.block(id, &step.id, e.to_string()).await,
            Err(e) => {
                let error = StepError {
                    kind: ErrorKind::InvalidInput,
                    message: e.to_string(),
                    retryable: false,
                };
                return self.fail_and_decide(id, &step.id, error).await;
            }
        };
        if !self.charge(id, Charge::dispatch()).await? {
            return Ok(());
        }

        let idempotency_key = idempotency_key(id, &step.id, attempt);
        let timeout_ms = step.timeout_ms.unwrap_or(self.settings.default_timeout_ms);
        self.record(
            id,
            Transition::StepDispatched {
                step_id: step.id.clone(),
                correlation_id,
                idempotency_key: idempotency_key.clone(),
                worker_id: prepared.worker_id.clone(),
                attempt,
            },
        )
        .await?;
        info!(
            instance_id = %id,
            step_id = %step.id,
            correlation_id = %correlation_id,
            worker_id = %prepared.worker_id,
            attempt,
            "Step dispatched"
        );

        let unit = self.dispatcher.work_unit(
            id,
            &step.id,
            attempt,
            correlation_id,
            idempotency_key,
            timeout_ms,
            prepared,
        );
        let timer = self.dispatcher.send(unit, &self.callbacks_tx);
        self.continuations.insert(
            correlation_id,
            Continuation::new(id, &step.id, attempt, timeout_ms).with_timer(timer),
        );
        Ok(())
    }

    pub(crate) async fn block(&mut self, id: Uuid, step_id: &str, reason: String) -> EngineResult<()> {
        let (_, state) = self.step_parts(id, step_id)?;
        if state.status == StepStatus::Blocked {
            debug!(instance_id = %id, step_id = %step_id, reason = %reason, "Step still blocked");
            return Ok(());
        }
        warn!(instance_id = %id, step_id = %step_id, reason = %reason, "Step blocked");
        self.record(
            id,
            Transition::StepBlocked {
                step_id: step_id.to_string(),
                reason,
            },
        )
        .await
    }

    /// Charge an action that has not happened yet.
    ///
    /// Returns false, and stops the instance, when it does not fit.
    pub(crate) async fn charge(&mut self, id: Uuid, charge: Charge) -> EngineResult<bool> {
        let instance = self.instance(id)?;
        match budget::check(instance, &charge, Utc::now()) {
            Ok(()) => {
                if !charge.is_empty() {
                    self.record(id, charged(&charge)).await?;
                }
                Ok(true)
            }
            Err(dimension) => {
                self.escalate(id, exhausted(dimension)).await?;
                Ok(false)
            }
        }
    }

    /// Charge work that already happened, up to what is left.
    ///
    /// Returns false, and stops the instance, when the work overran.
    pub(crate) async fn charge_incurred(&mut self, id: Uuid, charge: Charge) -> EngineResult<bool> {
        let instance = self.instance(id)?;
        let fits = budget::clamp(instance, &charge);
        let overrun = budget::check(instance, &charge, Utc::now()).err();
        if !fits.is_empty() {
            self.record(id, charged(&fits)).await?;
        }
        match overrun {
            Some(dimension) => {
                self.escalate(id, exhausted(dimension)).await?;
                Ok(false)
            }
            None => Ok(true),
        }
    }

    pub(crate) async fn on_tick(&mut self) {
        let now = Utc::now();
        let live: Vec<Uuid> = self
            .runtimes
            .iter()
            .filter(|(_, r)| !r.instance.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in live {
            let result = self.tick_instance(id, now).await;
            self.guard(id, result);
        }
    }

    async fn tick_instance(&mut self, id: Uuid, now: DateTime<Utc>) -> EngineResult<()> {
        let instance = self.instance(id)?;
        if instance.is_terminal() {
            return Ok(());
        }
        if !instance.cancel_requested && budget::wall_clock_exhausted(instance, now) {
            return self.escalate(id, exhausted(BudgetDimension::WallClock)).await;
        }

        let ceiling = i64::try_from(self.settings.blocked_ceiling_ms).unwrap_or(i64::MAX);
        let stuck = instance
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Blocked)
            .find(|s| {
                s.blocked_since
                    .is_some_and(|since| (now - since).num_milliseconds() >= ceiling)
            })
            .map(|s| s.step_id.clone());
        if let Some(step_id) = stuck {
            return self
                .escalate(id, TerminationReason::BlockedTooLong { step_id })
                .await;
        }

        let blocked = instance
            .steps
            .values()
            .any(|s| s.status == StepStatus::Blocked);
        let unknown: Vec<String> = instance
            .steps
            .values()
            .filter(|s| s.status == StepStatus::UnknownOutcome)
            .map(|s| s.step_id.clone())
            .collect();
        if blocked {
            if let Some(runtime) = self.runtimes.get_mut(&id) {
                runtime.recheck_blocked = true;
            }
            self.queue.push_back(id);
        }
        for step_id in unknown {
            self.resolve_unknown(id, &step_id)?;
        }
        Ok(())
    }
}

fn charged(charge: &Charge) -> Transition {
    Transition::BudgetCharged {
        iterations: charge.iterations,
        external_calls: charge.external_calls,
        spend: charge.spend,
    }
}
