//! Pause, resume and cancel.

use super::Engine;
use crate::error::EngineResult;
use pe_protocol::ipc::{ControlAction, ControlScope, ControlSignal};
use pe_protocol::transition_models::Transition;
use tracing::info;
use uuid::Uuid;

impl Engine {
    /// Apply a control signal.
    ///
    /// Cancel always covers the whole subtree. Pause and resume cover it
    /// only when the signal is scoped to the subtree. Terminal instances
    /// are left alone.
    pub(crate) async fn control(&mut self, signal: ControlSignal) -> EngineResult<()> {
        if !self.runtimes.contains_key(&signal.target) {
            return Err(self.missing(signal.target));
        }
        let targets = match (signal.action, signal.scope) {
            (ControlAction::Cancel, _) | (_, ControlScope::Subtree) => self.subtree(signal.target),
            _ => vec![signal.target],
        };
        info!(
            target = %signal.target,
            action = ?signal.action,
            scope = ?signal.scope,
            instances = targets.len(),
            "Control signal"
        );
        for id in targets {
            let result = self.apply_control(id, signal.action).await;
            self.guard(id, result);
        }
        Ok(())
    }

    async fn apply_control(&mut self, id: Uuid, action: ControlAction) -> EngineResult<()> {
        let Some(runtime) = self.runtimes.get(&id) else {
            return Ok(());
        };
        let instance = &runtime.instance;
        if instance.is_terminal() {
            return Ok(());
        }
        let needed = match action {
            ControlAction::Pause => !instance.paused,
            ControlAction::Resume => instance.paused,
            ControlAction::Cancel => !instance.cancel_requested,
        };
        if needed {
            self.record(id, Transition::Control { action }).await?;
        }
        self.queue.push_back(id);
        Ok(())
    }

    /// Request cancellation of one instance.
    pub(crate) async fn request_cancel(&mut self, id: Uuid) -> EngineResult<()> {
        self.apply_control(id, ControlAction::Cancel).await
    }
}
