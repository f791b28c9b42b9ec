//! Subprocess and loop steps.
//!
//! A nested step spawns child instances that run under their own budget
//! share. The step waits until every child has reported a terminal phase,
//! then succeeds only if all of them completed.

use super::Engine;
use crate::definition::template;
use crate::error::{EngineError, EngineResult};
use crate::state::{budget, TransitionError};
use chrono::Utc;
use pe_protocol::definition_models::{ErrorKind, StepDefinition, StepKind};
use pe_protocol::instance_models::{
    Budget, ParentLink, Phase, ProcessInstance, ResultRef, StepError, StepStatus,
    TerminationReason,
};
use pe_protocol::transition_models::Transition;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};
use uuid::Uuid;

/// The list a loop step iterates over; `None` for other steps.
pub(crate) fn loop_items(
    instance: &ProcessInstance,
    step: &StepDefinition,
) -> Result<Option<Vec<Value>>, String> {
    let StepKind::Loop(spec) = step.kind() else {
        return Ok(None);
    };
    match template::render_str(&spec.over, &instance.variables) {
        Ok(Value::Array(items)) => Ok(Some(items)),
        Ok(other) => Err(format!(
            "loop source '{}' is not a list: {other}",
            spec.over
        )),
        Err(e) => Err(e.to_string()),
    }
}

/// Bindings a child sees on top of its parent's variables.
fn child_bindings(params: &Value, items: Option<&[Value]>, index: usize) -> BTreeMap<String, Value> {
    let mut bindings = BTreeMap::new();
    if let Value::Object(map) = params {
        for (name, value) in map {
            bindings.insert(format!("inputs.{name}"), value.clone());
        }
    }
    if let Some(item) = items.and_then(|items| items.get(index)) {
        bindings.insert("loop.item".to_string(), item.clone());
        bindings.insert("loop.index".to_string(), json!(index));
    }
    bindings
}

impl Engine {
    pub(crate) async fn spawn_children(
        &mut self,
        id: Uuid,
        step: &StepDefinition,
        count: usize,
        items: Option<Vec<Value>>,
    ) -> EngineResult<()> {
        if count == 0 {
            info!(instance_id = %id, step_id = %step.id, "Loop over an empty list");
            self.record(
                id,
                Transition::StepSucceeded {
                    step_id: step.id.clone(),
                    result: ResultRef::Children { count: 0 },
                    output: json!([]),
                },
            )
            .await?;
            self.queue.push_back(id);
            return Ok(());
        }

        let instance = self.instance(id)?;
        if instance.depth + 1 > self.settings.max_depth {
            let reason = TerminationReason::DepthExceeded {
                step_id: step.id.clone(),
                depth: self.settings.max_depth,
            };
            return self.escalate(id, reason).await;
        }
        let params = match template::render_value(&step.params, &instance.variables) {
            Ok(params) => params,
            Err(e) => {
                let error = StepError {
                    kind: ErrorKind::InvalidInput,
                    message: e.to_string(),
                    retryable: false,
                };
                return self.fail_and_decide(id, &step.id, error).await;
            }
        };
        let share = budget::child_share(
            instance,
            count,
            self.settings.child_reserve_fraction,
            Utc::now(),
        );
        info!(
            instance_id = %id,
            step_id = %step.id,
            count,
            "Spawning children"
        );
        for index in 0..count {
            let bindings = child_bindings(&params, items.as_deref(), index);
            self.spawn_child(id, &step.id, index, share.clone(), bindings)
                .await?;
        }
        Ok(())
    }

    /// Spawn the indices of a nested step an interrupted spawn left out.
    pub(crate) async fn spawn_missing(
        &mut self,
        id: Uuid,
        step: &StepDefinition,
        expected: usize,
        taken: &BTreeSet<usize>,
        share: Budget,
    ) -> EngineResult<()> {
        let instance = self.instance(id)?;
        let items = loop_items(instance, step).map_err(|message| {
            EngineError::Transition(TransitionError::Inconsistent(message))
        })?;
        let params = template::render_value(&step.params, &instance.variables)?;
        for index in (0..expected).filter(|i| !taken.contains(i)) {
            info!(instance_id = %id, step_id = %step.id, index, "Spawning interrupted child");
            let bindings = child_bindings(&params, items.as_deref(), index);
            self.spawn_child(id, &step.id, index, share.clone(), bindings)
                .await?;
        }
        Ok(())
    }

    /// Journal the spawn on the parent, then create the child.
    pub(crate) async fn spawn_child(
        &mut self,
        parent_id: Uuid,
        step_id: &str,
        index: usize,
        share: Budget,
        bindings: BTreeMap<String, Value>,
    ) -> EngineResult<()> {
        let child_id = Uuid::new_v4();
        self.record(
            parent_id,
            Transition::ChildSpawned {
                step_id: step_id.to_string(),
                child_id,
                index,
                budget: share.clone(),
                bindings: bindings.clone(),
            },
        )
        .await?;
        self.create_child(parent_id, step_id, child_id, index, share, bindings)
            .await
    }

    /// Create a child whose spawn the parent has already journaled.
    pub(crate) async fn create_child(
        &mut self,
        parent_id: Uuid,
        step_id: &str,
        child_id: Uuid,
        index: usize,
        share: Budget,
        bindings: BTreeMap<String, Value>,
    ) -> EngineResult<()> {
        let parent = self.instance(parent_id)?;
        let body = parent
            .definition
            .step(step_id)
            .and_then(StepDefinition::nested_definition)
            .cloned()
            .ok_or_else(|| {
                EngineError::Transition(TransitionError::Inconsistent(format!(
                    "step '{step_id}' has no nested definition"
                )))
            })?;
        let mut variables = parent.variables.clone();
        variables.extend(bindings);
        let mut path = parent.path.clone();
        path.push(parent_id);
        let created = Transition::Created {
            definition: body,
            parent: Some(ParentLink {
                instance_id: parent_id,
                step_id: step_id.to_string(),
                index,
            }),
            root_id: parent.root_id,
            depth: parent.depth + 1,
            path,
            budget: share,
            variables,
        };
        self.create_instance(child_id, created).await
    }

    /// Number of children a nested step runs, when it can be known.
    pub(crate) fn expected_children(&self, id: Uuid, step: &StepDefinition) -> Option<usize> {
        let instance = self.instance(id).ok()?;
        match step.kind() {
            StepKind::Subprocess(_) => Some(1),
            StepKind::Loop(_) => loop_items(instance, step).ok().flatten().map(|i| i.len()),
            StepKind::Action { .. } => None,
        }
    }

    /// Bookkeeping once an instance is terminal: wake waiters, stop its
    /// children and tell its parent.
    pub(crate) async fn on_terminal(&mut self, id: Uuid) {
        self.continuations.discard_instance(id);
        let Some(runtime) = self.runtimes.get(&id) else {
            return;
        };
        let instance = runtime.instance.clone();
        info!(
            instance_id = %id,
            phase = %instance.phase,
            outcome = ?instance.outcome,
            "Instance finished"
        );
        for waiter in self.waiters.remove(&id).unwrap_or_default() {
            let _ = waiter.send(Ok(instance.clone()));
        }

        for child in self.children.get(&id).cloned().unwrap_or_default() {
            let result = self.request_cancel(child).await;
            self.guard(child, result);
        }

        if let Some(link) = &instance.parent {
            let result = self.report_child(link, &instance).await;
            self.guard(link.instance_id, result);
        }
    }

    pub(crate) async fn report_child(
        &mut self,
        link: &ParentLink,
        child: &ProcessInstance,
    ) -> EngineResult<()> {
        let parent_id = link.instance_id;
        if !self.is_live(parent_id) {
            return Ok(());
        }
        let (_, state) = self.step_parts(parent_id, &link.step_id)?;
        let reported = state
            .children
            .iter()
            .find(|c| c.child_id == child.id)
            .map_or(true, |c| c.phase.is_some());
        if reported {
            return Ok(());
        }
        let output = (child.phase == Phase::Completed).then(|| child.outputs());
        self.record(
            parent_id,
            Transition::ChildTerminated {
                step_id: link.step_id.clone(),
                child_id: child.id,
                phase: child.phase,
                output,
            },
        )
        .await?;
        self.aggregate(parent_id, &link.step_id).await
    }

    /// Settle a nested step once every child has reported.
    pub(crate) async fn aggregate(&mut self, id: Uuid, step_id: &str) -> EngineResult<()> {
        let (step, state) = self.step_parts(id, step_id)?;
        if state.status != StepStatus::AwaitingResult || state.children.is_empty() {
            return Ok(());
        }
        if state.children.iter().any(|c| c.phase.is_none()) {
            return Ok(());
        }
        let count = state.children.len();
        if self
            .expected_children(id, &step)
            .is_some_and(|expected| count < expected)
        {
            return Ok(());
        }

        let failed = state
            .children
            .iter()
            .filter(|c| c.phase != Some(Phase::Completed))
            .count();
        if failed > 0 {
            warn!(
                instance_id = %id,
                step_id = %step_id,
                failed,
                count,
                "Children did not complete"
            );
            let error = StepError {
                kind: ErrorKind::ChildFailed,
                message: format!("{failed} of {count} children did not complete"),
                retryable: false,
            };
            return self.fail_and_decide(id, step_id, error).await;
        }

        let mut children = state.children.clone();
        children.sort_by_key(|c| c.index);
        let output = match step.kind() {
            StepKind::Loop(_) => Value::Array(
                children
                    .into_iter()
                    .map(|c| c.output.unwrap_or(Value::Null))
                    .collect(),
            ),
            _ => children
                .into_iter()
                .next()
                .and_then(|c| c.output)
                .unwrap_or(Value::Null),
        };
        self.record(
            id,
            Transition::StepSucceeded {
                step_id: step_id.to_string(),
                result: ResultRef::Children { count },
                output,
            },
        )
        .await?;
        self.queue.push_back(id);
        Ok(())
    }
}
