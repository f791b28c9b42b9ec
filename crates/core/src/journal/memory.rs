//! In-memory transition log for tests and embedding.

use super::{check_sequence, JournalResult, TransitionLog};
use async_trait::async_trait;
use pe_protocol::transition_models::TransitionRecord;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryJournal {
    segments: Mutex<HashMap<Uuid, Vec<TransitionRecord>>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held for one instance.
    pub async fn len(&self, instance_id: Uuid) -> usize {
        self.segments
            .lock()
            .await
            .get(&instance_id)
            .map_or(0, Vec::len)
    }

    /// Replace a segment wholesale, bypassing every check.
    pub async fn overwrite(&self, instance_id: Uuid, records: Vec<TransitionRecord>) {
        self.segments.lock().await.insert(instance_id, records);
    }
}

#[async_trait]
impl TransitionLog for MemoryJournal {
    async fn append(&self, record: &TransitionRecord) -> JournalResult<()> {
        self.segments
            .lock()
            .await
            .entry(record.instance_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn read(&self, instance_id: Uuid) -> JournalResult<Vec<TransitionRecord>> {
        let records = self
            .segments
            .lock()
            .await
            .get(&instance_id)
            .cloned()
            .unwrap_or_default();
        check_sequence(instance_id, &records)?;
        Ok(records)
    }

    async fn instances(&self) -> JournalResult<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self.segments.lock().await.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalError;
    use chrono::Utc;
    use pe_protocol::ipc::ControlAction;
    use pe_protocol::transition_models::Transition;

    fn record(instance_id: Uuid, seq: u64) -> TransitionRecord {
        TransitionRecord {
            instance_id,
            seq,
            at: Utc::now(),
            transition: Transition::Control {
                action: ControlAction::Pause,
            },
        }
    }

    #[tokio::test]
    async fn test_segments_are_per_instance() {
        let journal = MemoryJournal::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        journal.append(&record(a, 0)).await.unwrap();
        journal.append(&record(a, 1)).await.unwrap();
        journal.append(&record(b, 0)).await.unwrap();

        assert_eq!(journal.read(a).await.unwrap().len(), 2);
        assert_eq!(journal.read(b).await.unwrap().len(), 1);
        assert_eq!(journal.instances().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sequence_gap_is_detected() {
        let journal = MemoryJournal::new();
        let id = Uuid::new_v4();
        journal.overwrite(id, vec![record(id, 0), record(id, 2)]).await;

        let err = journal.read(id).await.unwrap_err();
        assert!(matches!(
            err,
            JournalError::SequenceGap {
                expected: 1,
                found: 2,
                ..
            }
        ));
    }
}
