//! Continuations keyed by correlation id.
//!
//! Nothing in the engine waits on a worker. A dispatch leaves behind a
//! [`Continuation`] saying which step the reply belongs to, and every
//! asynchronous completion (publish result, reply, timer, verdict, plan,
//! recovery status query) comes back to the engine loop as a [`Callback`].

use crate::planning::{PlanOutcome, PlanningError};
use crate::transport::TransportError;
use pe_protocol::bus_models::{DeliveryStatus, WorkerReply};
use pe_protocol::quality_models::QualityVerdict;
use std::collections::HashMap;
use tokio::task::AbortHandle;
use uuid::Uuid;

#[derive(Debug)]
pub enum Callback {
    /// The transport accepted a unit.
    Published { correlation_id: Uuid },
    /// The transport refused a unit; it never reached a worker.
    PublishFailed {
        correlation_id: Uuid,
        error: TransportError,
    },
    TimedOut { correlation_id: Uuid },
    Reply(WorkerReply),
    RetryDue { instance_id: Uuid, step_id: String },
    Verdict {
        instance_id: Uuid,
        step_id: String,
        attempt: u32,
        verdict: QualityVerdict,
    },
    PlanReady {
        instance_id: Uuid,
        result: Result<PlanOutcome, PlanningError>,
    },
    /// Outcome of probing the transport for a unit of unknown outcome.
    Resolved {
        instance_id: Uuid,
        step_id: String,
        correlation_id: Uuid,
        result: Result<DeliveryStatus, TransportError>,
    },
}

#[derive(Debug)]
pub struct Continuation {
    pub instance_id: Uuid,
    pub step_id: String,
    pub attempt: u32,
    pub timeout_ms: u64,
    timer: Option<AbortHandle>,
}

impl Continuation {
    pub fn new(instance_id: Uuid, step_id: impl Into<String>, attempt: u32, timeout_ms: u64) -> Self {
        Self {
            instance_id,
            step_id: step_id.into(),
            attempt,
            timeout_ms,
            timer: None,
        }
    }

    pub fn with_timer(mut self, timer: AbortHandle) -> Self {
        self.timer = Some(timer);
        self
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// In-flight dispatches by correlation id.
#[derive(Debug, Default)]
pub struct Continuations {
    pending: HashMap<Uuid, Continuation>,
}

impl Continuations {
    pub fn insert(&mut self, correlation_id: Uuid, continuation: Continuation) {
        if let Some(mut old) = self.pending.insert(correlation_id, continuation) {
            old.disarm();
        }
    }

    pub fn get(&self, correlation_id: &Uuid) -> Option<&Continuation> {
        self.pending.get(correlation_id)
    }

    /// Remove a continuation and cancel its timeout.
    pub fn take(&mut self, correlation_id: &Uuid) -> Option<Continuation> {
        let mut continuation = self.pending.remove(correlation_id)?;
        continuation.disarm();
        Some(continuation)
    }

    /// Drop every continuation of one instance.
    pub fn discard_instance(&mut self, instance_id: Uuid) -> usize {
        let ids: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, c)| c.instance_id == instance_id)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.take(id);
        }
        ids.len()
    }

    pub fn clear(&mut self) {
        for (_, mut continuation) in self.pending.drain() {
            continuation.disarm();
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_take_disarms_the_timer() {
        let timer = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        let abort = timer.abort_handle();

        let mut continuations = Continuations::default();
        let corr = Uuid::new_v4();
        continuations.insert(corr, Continuation::new(Uuid::nil(), "a", 1, 60_000).with_timer(abort));
        assert_eq!(continuations.len(), 1);

        let taken = continuations.take(&corr).expect("continuation present");
        assert_eq!(taken.step_id, "a");
        assert!(timer.await.unwrap_err().is_cancelled());
        assert!(continuations.take(&corr).is_none());
    }

    #[test]
    fn test_discard_instance_only_touches_that_instance() {
        let mut continuations = Continuations::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        continuations.insert(Uuid::new_v4(), Continuation::new(a, "x", 1, 10));
        continuations.insert(Uuid::new_v4(), Continuation::new(a, "y", 1, 10));
        continuations.insert(Uuid::new_v4(), Continuation::new(b, "x", 1, 10));

        assert_eq!(continuations.discard_instance(a), 2);
        assert_eq!(continuations.len(), 1);
    }
}
