//! Completions of work the engine started: publishes, replies, timeouts,
//! quality verdicts and plans.

use super::continuation::{Callback, Continuation};
use super::scheduler::exhausted;
use super::Engine;
use crate::dispatch::verify;
use crate::error::{EngineError, EngineResult};
use crate::planning::{PlanOutcome, PlanningError};
use crate::quality::judged_calls;
use crate::state::{budget, decide, Charge, Decision, DecisionInput, TransitionError, Trigger};
use crate::transport::TransportError;
use chrono::Utc;
use pe_protocol::bus_models::{ArtifactManifest, ArtifactRef, OutputPayload, ReplyOutcome, WorkerReply};
use pe_protocol::definition_models::ErrorKind;
use pe_protocol::instance_models::{BudgetDimension, Phase, ResultRef, StepError, StepStatus, TerminationReason};
use pe_protocol::quality_models::QualityVerdict;
use pe_protocol::transition_models::Transition;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl Engine {
    pub(crate) async fn on_published(&mut self, correlation_id: Uuid) -> EngineResult<()> {
        let Some(continuation) = self.continuations.get(&correlation_id) else {
            return Ok(());
        };
        let (id, step_id) = (continuation.instance_id, continuation.step_id.clone());
        if !self.is_live(id) {
            return Ok(());
        }
        let (_, state) = self.step_parts(id, &step_id)?;
        if state.status != StepStatus::Dispatched || state.correlation_id != Some(correlation_id) {
            return Ok(());
        }
        self.record(
            id,
            Transition::StepAwaitingResult {
                step_id,
                correlation_id,
            },
        )
        .await
    }

    /// The unit never reached a worker; block the step until the next tick.
    pub(crate) async fn on_publish_failed(
        &mut self,
        correlation_id: Uuid,
        error: TransportError,
    ) -> EngineResult<()> {
        let Some(continuation) = self.continuations.take(&correlation_id) else {
            return Ok(());
        };
        let id = continuation.instance_id;
        if !self.is_live(id) {
            return Ok(());
        }
        let (_, state) = self.step_parts(id, &continuation.step_id)?;
        if state.status != StepStatus::Dispatched || state.correlation_id != Some(correlation_id) {
            return Ok(());
        }
        self.block(id, &continuation.step_id, error.to_string()).await?;
        self.queue.push_back(id);
        Ok(())
    }

    pub(crate) async fn on_timeout(&mut self, correlation_id: Uuid) -> EngineResult<()> {
        let Some(continuation) = self.continuations.take(&correlation_id) else {
            return Ok(());
        };
        let id = continuation.instance_id;
        if !self.is_live(id) {
            return Ok(());
        }
        let (_, state) = self.step_parts(id, &continuation.step_id)?;
        if !state.status.is_in_flight() || state.correlation_id != Some(correlation_id) {
            return Ok(());
        }
        warn!(
            instance_id = %id,
            step_id = %continuation.step_id,
            correlation_id = %correlation_id,
            timeout_ms = continuation.timeout_ms,
            "Step timed out"
        );
        let error = StepError {
            kind: ErrorKind::Timeout,
            message: format!("no reply within {} ms", continuation.timeout_ms),
            retryable: true,
        };
        self.fail_and_decide(id, &continuation.step_id, error).await
    }

    /// Match a reply to its continuation. Late and duplicate replies find
    /// none and are dropped.
    pub(crate) async fn on_reply(&mut self, reply: WorkerReply) {
        let Some(continuation) = self.continuations.take(&reply.correlation_id) else {
            debug!(
                correlation_id = %reply.correlation_id,
                worker_id = %reply.worker_id,
                "Ignoring reply without a pending dispatch"
            );
            return;
        };
        let id = continuation.instance_id;
        let result = self.apply_reply(continuation, reply).await;
        self.guard(id, result);
    }

    async fn apply_reply(&mut self, continuation: Continuation, reply: WorkerReply) -> EngineResult<()> {
        let id = continuation.instance_id;
        let step_id = continuation.step_id.as_str();
        let correlation_id = reply.correlation_id;
        if !self.is_live(id) {
            return Ok(());
        }
        let (step, state) = self.step_parts(id, step_id)?;
        if !state.status.is_in_flight()
            || state.correlation_id != Some(correlation_id)
            || state.candidate.is_some()
        {
            debug!(instance_id = %id, step_id = %step_id, "Ignoring stale reply");
            return Ok(());
        }

        match reply.outcome {
            ReplyOutcome::Success { output, metrics } => {
                info!(
                    instance_id = %id,
                    step_id = %step_id,
                    worker_id = %reply.worker_id,
                    duration_ms = metrics.duration_ms,
                    "Step replied"
                );
                if metrics.cost > 0.0 {
                    let (amount, overrun) = budget::clamp_spend(self.instance(id)?, metrics.cost);
                    if amount > 0.0 {
                        self.record(
                            id,
                            Transition::BudgetCharged {
                                iterations: 0,
                                external_calls: 0,
                                spend: amount,
                            },
                        )
                        .await?;
                    }
                    if overrun {
                        return self
                            .escalate(id, exhausted(BudgetDimension::Spend))
                            .await;
                    }
                }

                let (result, value) = match output {
                    OutputPayload::Inline(value) => (
                        ResultRef::Inline {
                            correlation_id,
                            size: value.to_string().len() as u64,
                        },
                        value,
                    ),
                    OutputPayload::Artifact(reference) => {
                        if let Err(message) = self
                            .register_output(id, step_id, correlation_id, &reference)
                            .await
                        {
                            let error = StepError {
                                kind: ErrorKind::ResourceUnavailable,
                                message,
                                retryable: true,
                            };
                            return self.fail_and_decide(id, step_id, error).await;
                        }
                        let value = match self.load_output(&reference).await {
                            Ok(value) => value,
                            Err(message) => {
                                let error = StepError {
                                    kind: ErrorKind::ResourceUnavailable,
                                    message,
                                    retryable: true,
                                };
                                return self.fail_and_decide(id, step_id, error).await;
                            }
                        };
                        (ResultRef::Artifact(reference), value)
                    }
                };

                if step.quality.is_some() {
                    self.record(
                        id,
                        Transition::StepOutputReceived {
                            step_id: step_id.to_string(),
                            result,
                            output: value,
                        },
                    )
                    .await?;
                    self.begin_evaluation(id, step_id).await
                } else {
                    self.record(
                        id,
                        Transition::StepSucceeded {
                            step_id: step_id.to_string(),
                            result,
                            output: value,
                        },
                    )
                    .await?;
                    self.queue.push_back(id);
                    Ok(())
                }
            }
            ReplyOutcome::Error {
                kind,
                message,
                retryable,
            } => {
                warn!(
                    instance_id = %id,
                    step_id = %step_id,
                    worker_id = %reply.worker_id,
                    kind = %kind,
                    message = %message,
                    "Step failed"
                );
                let error = StepError {
                    kind,
                    message,
                    retryable,
                };
                self.fail_and_decide(id, step_id, error).await
            }
        }
    }

    /// Record the manifest of an output the worker left in the artifact
    /// store. The manifest id is the correlation id, so registering twice is
    /// harmless.
    pub(crate) async fn register_output(
        &self,
        id: Uuid,
        step_id: &str,
        correlation_id: Uuid,
        reference: &ArtifactRef,
    ) -> Result<(), String> {
        let exists = self
            .artifacts
            .exists(correlation_id)
            .await
            .map_err(|e| e.to_string())?;
        if exists {
            return Ok(());
        }
        let manifest = ArtifactManifest {
            id: correlation_id,
            instance_id: id,
            step_id: step_id.to_string(),
            reference: reference.clone(),
            metadata: BTreeMap::from([("kind".to_string(), "output".to_string())]),
        };
        self.artifacts
            .register(manifest)
            .await
            .map_err(|e| e.to_string())
    }

    /// Content of an artifact output, checked against its checksum and
    /// decoded as JSON. Text that is not JSON becomes a string value.
    pub(crate) async fn load_output(&self, reference: &ArtifactRef) -> Result<Value, String> {
        let content = self
            .artifacts
            .fetch(reference)
            .await
            .map_err(|e| e.to_string())?;
        if !verify(&content, &reference.checksum) {
            return Err(format!("checksum mismatch for {}", reference.location));
        }
        match serde_json::from_slice(&content) {
            Ok(value) => Ok(value),
            Err(_) => String::from_utf8(content)
                .map(Value::String)
                .map_err(|_| format!("artifact {} is neither JSON nor text", reference.location)),
        }
    }

    /// Record a failure and act on the retry decision.
    pub(crate) async fn fail_and_decide(
        &mut self,
        id: Uuid,
        step_id: &str,
        error: StepError,
    ) -> EngineResult<()> {
        self.record(
            id,
            Transition::StepFailed {
                step_id: step_id.to_string(),
                error: error.clone(),
            },
        )
        .await?;
        let instance = self.instance(id)?;
        if instance.cancel_requested {
            self.queue.push_back(id);
            return Ok(());
        }
        let (step, state) = self.step_parts(id, step_id)?;
        let retry = self.retry_policy(&step);
        let decision = decide(DecisionInput {
            step: &step,
            state: &state,
            retry: &retry,
            budget: budget::check(instance, &Charge::dispatch(), Utc::now()),
            trigger: Trigger::Replied(Err(&error)),
        });
        self.apply_decision(id, step_id, decision).await
    }

    async fn apply_decision(&mut self, id: Uuid, step_id: &str, decision: Decision) -> EngineResult<()> {
        match decision {
            Decision::Retry { feedback, delay_ms } => {
                info!(
                    instance_id = %id,
                    step_id = %step_id,
                    delay_ms,
                    "Step will be retried"
                );
                self.record(
                    id,
                    Transition::StepRetrying {
                        step_id: step_id.to_string(),
                        feedback,
                        delay_ms,
                    },
                )
                .await?;
                self.schedule_retry(id, step_id, delay_ms);
                Ok(())
            }
            Decision::Escalate { reason } => self.escalate(id, reason).await,
            Decision::Proceed | Decision::SpawnChildren { .. } => {
                self.queue.push_back(id);
                Ok(())
            }
        }
    }

    fn schedule_retry(&mut self, id: Uuid, step_id: &str, delay_ms: u64) {
        if delay_ms == 0 {
            self.on_retry_due(id, step_id.to_string());
            return;
        }
        let tx = self.callbacks_tx.clone();
        let step_id = step_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let _ = tx.send(Callback::RetryDue {
                instance_id: id,
                step_id,
            });
        });
    }

    pub(crate) fn on_retry_due(&mut self, id: Uuid, step_id: String) {
        let Some(runtime) = self.runtimes.get_mut(&id) else {
            return;
        };
        let waiting = runtime
            .instance
            .step(&step_id)
            .is_some_and(|s| s.status == StepStatus::Retrying);
        if waiting && !runtime.instance.is_terminal() {
            runtime.ready_retries.insert(step_id);
            self.queue.push_back(id);
        }
    }

    /// Score the step's candidate output in the background.
    pub(crate) async fn begin_evaluation(&mut self, id: Uuid, step_id: &str) -> EngineResult<()> {
        let (step, state) = self.step_parts(id, step_id)?;
        let (Some(policy), Some(output)) = (step.quality.clone(), state.candidate.clone()) else {
            return Ok(());
        };
        let busy = self
            .runtimes
            .get(&id)
            .is_some_and(|r| r.evaluating.contains(step_id));
        if busy {
            return Ok(());
        }
        let calls = judged_calls(&policy);
        if calls > 0 && !self.charge(id, Charge::external_calls(calls)).await? {
            return Ok(());
        }
        if self.instance(id)?.phase == Phase::Executing {
            self.set_phase(id, Phase::Evaluating).await?;
        }
        let Some(runtime) = self.runtimes.get_mut(&id) else {
            return Ok(());
        };
        if runtime.instance.is_terminal() {
            return Ok(());
        }
        runtime.evaluating.insert(step_id.to_string());

        let evaluator = self.evaluator.clone();
        let tx = self.callbacks_tx.clone();
        let step_id = step_id.to_string();
        let attempt = state.attempts;
        tokio::spawn(async move {
            let verdict = evaluator.evaluate(&policy, id, &step_id, &output).await;
            let _ = tx.send(Callback::Verdict {
                instance_id: id,
                step_id,
                attempt,
                verdict,
            });
        });
        Ok(())
    }

    pub(crate) async fn on_verdict(
        &mut self,
        id: Uuid,
        step_id: &str,
        attempt: u32,
        verdict: QualityVerdict,
    ) -> EngineResult<()> {
        let Some(runtime) = self.runtimes.get_mut(&id) else {
            return Ok(());
        };
        runtime.evaluating.remove(step_id);
        if runtime.instance.is_terminal() {
            return Ok(());
        }
        let (step, state) = self.step_parts(id, step_id)?;
        if state.status != StepStatus::AwaitingResult
            || state.candidate.is_none()
            || state.attempts != attempt
        {
            return Ok(());
        }
        info!(
            instance_id = %id,
            step_id = %step_id,
            attempt,
            score = verdict.score,
            verdict = ?verdict.verdict,
            "Step evaluated"
        );
        self.record(
            id,
            Transition::StepEvaluated {
                step_id: step_id.to_string(),
                verdict: verdict.clone(),
            },
        )
        .await?;
        self.queue.push_back(id);

        let instance = self.instance(id)?;
        let retry = self.retry_policy(&step);
        let decision = decide(DecisionInput {
            step: &step,
            state: &state,
            retry: &retry,
            budget: budget::check(instance, &Charge::dispatch(), Utc::now()),
            trigger: Trigger::Verdict(&verdict),
        });
        if decision == Decision::Proceed {
            let result = state.last_result.clone().ok_or_else(|| {
                EngineError::Transition(TransitionError::Inconsistent(format!(
                    "step '{step_id}' holds an output without a result"
                )))
            })?;
            let output = state.candidate.clone().unwrap_or_default();
            return self
                .record(
                    id,
                    Transition::StepSucceeded {
                        step_id: step_id.to_string(),
                        result,
                        output,
                    },
                )
                .await;
        }

        let threshold = step.quality.as_ref().map_or(0.0, |q| q.pass_threshold);
        let error = StepError {
            kind: ErrorKind::QualityRejected,
            message: format!(
                "quality score {:.2} below pass threshold {:.2}",
                verdict.score, threshold
            ),
            retryable: true,
        };
        self.record(
            id,
            Transition::StepFailed {
                step_id: step_id.to_string(),
                error,
            },
        )
        .await?;
        if self.instance(id)?.cancel_requested {
            return Ok(());
        }
        self.apply_decision(id, step_id, decision).await
    }

    pub(crate) async fn on_plan_ready(
        &mut self,
        id: Uuid,
        result: Result<PlanOutcome, PlanningError>,
    ) -> EngineResult<()> {
        let Some(runtime) = self.runtimes.get(&id) else {
            return Ok(());
        };
        if runtime.instance.phase != Phase::Planning {
            debug!(instance_id = %id, "Ignoring plan for an instance no longer planning");
            return Ok(());
        }
        match result {
            Ok(outcome) => {
                if outcome.external_calls > 0
                    && !self
                        .charge_incurred(id, Charge::external_calls(outcome.external_calls))
                        .await?
                {
                    return Ok(());
                }
                info!(
                    instance_id = %id,
                    steps = outcome.definition.steps.len(),
                    "Plan accepted"
                );
                self.record(
                    id,
                    Transition::PlanSynthesized {
                        definition: outcome.definition,
                        cached: false,
                    },
                )
                .await?;
                self.set_phase(id, Phase::Executing).await?;
                self.queue.push_back(id);
                Ok(())
            }
            Err(e) => {
                warn!(instance_id = %id, error = %e, "Planning failed");
                self.escalate(
                    id,
                    TerminationReason::PlanningFailed {
                        message: e.to_string(),
                    },
                )
                .await
            }
        }
    }
}
