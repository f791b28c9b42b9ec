//! File-backed transition log: one JSON-lines segment per instance.
//!
//! Layout: `<dir>/<instance_id>.jsonl`, one [`TransitionRecord`] per line.
//! Every append is fsynced before it returns. A crash mid-append can leave a
//! torn final line; reading drops it and cuts the file back to the last
//! complete record so later appends start on a fresh line. Anything
//! undecodable before the last line is corruption.

use super::{check_sequence, JournalError, JournalResult, TransitionLog};
use async_trait::async_trait;
use pe_protocol::transition_models::TransitionRecord;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

const SEGMENT_EXT: &str = "jsonl";

pub struct FileJournal {
    dir: PathBuf,
    // One lock per segment; instances never wait on each other.
    segments: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl FileJournal {
    /// Open (creating if needed) a journal directory.
    ///
    /// # Errors
    ///
    /// Returns `JournalError::Io` if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> JournalResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| JournalError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            segments: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segment_path(&self, instance_id: Uuid) -> PathBuf {
        self.dir.join(format!("{instance_id}.{SEGMENT_EXT}"))
    }

    async fn segment_lock(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        Arc::clone(self.segments.lock().await.entry(instance_id).or_default())
    }
}

/// A decoded segment and the byte length of its complete records.
pub(crate) struct Segment {
    pub records: Vec<TransitionRecord>,
    pub valid_len: usize,
}

/// Decode a segment's text, tolerating a torn last line.
pub(crate) fn decode_segment(instance_id: Uuid, content: &str) -> JournalResult<Segment> {
    let lines: Vec<&str> = content.lines().collect();
    let complete = content.ends_with('\n');
    let mut records = Vec::with_capacity(lines.len());
    let mut valid_len = content.len();

    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TransitionRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) if i + 1 == lines.len() && !complete => {
                warn!(
                    instance_id = %instance_id,
                    line = i + 1,
                    error = %e,
                    "Ignoring torn final record"
                );
                valid_len = content.rfind('\n').map_or(0, |end| end + 1);
            }
            Err(e) => {
                return Err(JournalError::Corrupt {
                    instance_id,
                    line: i + 1,
                    reason: e.to_string(),
                })
            }
        }
    }

    check_sequence(instance_id, &records)?;
    Ok(Segment { records, valid_len })
}

#[async_trait]
impl TransitionLog for FileJournal {
    async fn append(&self, record: &TransitionRecord) -> JournalResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let path = self.segment_path(record.instance_id);
        let io_err = |source| JournalError::Io {
            path: path.clone(),
            source,
        };

        let lock = self.segment_lock(record.instance_id).await;
        let _guard = lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err)?;
        file.write_all(&line).await.map_err(io_err)?;
        file.sync_data().await.map_err(io_err)?;
        Ok(())
    }

    async fn read(&self, instance_id: Uuid) -> JournalResult<Vec<TransitionRecord>> {
        let path = self.segment_path(instance_id);
        let lock = self.segment_lock(instance_id).await;
        let _guard = lock.lock().await;

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(JournalError::Io { path, source }),
        };
        let segment = decode_segment(instance_id, &content)?;

        if segment.valid_len < content.len() {
            let io_err = |source| JournalError::Io {
                path: path.clone(),
                source,
            };
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(io_err)?;
            file.set_len(segment.valid_len as u64).await.map_err(io_err)?;
            file.sync_data().await.map_err(io_err)?;
            warn!(
                instance_id = %instance_id,
                kept_bytes = segment.valid_len,
                dropped_bytes = content.len() - segment.valid_len,
                "Truncated torn tail of segment"
            );
        }
        Ok(segment.records)
    }

    async fn instances(&self) -> JournalResult<Vec<Uuid>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|source| JournalError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let mut ids = Vec::new();
        loop {
            let entry = entries.next_entry().await.map_err(|source| JournalError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let Some(entry) = entry else { break };
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(SEGMENT_EXT) {
                continue;
            }
            match path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                Some(id) => ids.push(id),
                None => warn!(path = %path.display(), "Skipping unrecognized journal file"),
            }
        }
        ids.sort();
        Ok(ids)
    }
}
