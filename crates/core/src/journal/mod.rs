//! Append-only transition log.
//!
//! Each instance owns one log segment keyed by its id, so instances never
//! contend on the same segment. Records carry a contiguous sequence number
//! starting at 0; reading a segment verifies the sequence.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use pe_protocol::transition_models::TransitionRecord;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

pub use file::FileJournal;
pub use memory::MemoryJournal;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("journal I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to encode transition record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("corrupt record {line} in log of {instance_id}: {reason}")]
    Corrupt {
        instance_id: Uuid,
        line: usize,
        reason: String,
    },

    #[error("sequence gap in log of {instance_id}: expected {expected}, found {found}")]
    SequenceGap {
        instance_id: Uuid,
        expected: u64,
        found: u64,
    },
}

pub type JournalResult<T> = Result<T, JournalError>;

/// Durable, per-instance, append-only record of transitions.
#[async_trait]
pub trait TransitionLog: Send + Sync {
    /// Append one record. Returns only once the record is durable.
    async fn append(&self, record: &TransitionRecord) -> JournalResult<()>;

    /// All records of one instance, in order.
    async fn read(&self, instance_id: Uuid) -> JournalResult<Vec<TransitionRecord>>;

    /// Ids of every instance with a log segment.
    async fn instances(&self) -> JournalResult<Vec<Uuid>>;
}

/// Verify records belong to `instance_id` and are numbered 0, 1, 2, ...
pub(crate) fn check_sequence(instance_id: Uuid, records: &[TransitionRecord]) -> JournalResult<()> {
    for (i, record) in records.iter().enumerate() {
        if record.instance_id != instance_id {
            return Err(JournalError::Corrupt {
                instance_id,
                line: i + 1,
                reason: format!("record belongs to {}", record.instance_id),
            });
        }
        if record.seq != i as u64 {
            return Err(JournalError::SequenceGap {
                instance_id,
                expected: i as u64,
                found: record.seq,
            });
        }
    }
    Ok(())
}
