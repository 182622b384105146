//! File-backed offset store for broadcast mode.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{update_offset_table, OffsetStore, ReadOffsetType};
use crate::error::Result;
use crate::message::MessageQueue;

const OFFSET_FILE_NAME: &str = "offsets.json";

/// On-disk snapshot format. Self-describing so a file written for one group
/// is never silently applied to another.
#[derive(Debug, Serialize, Deserialize)]
struct OffsetSnapshot {
    group: String,
    #[serde(rename = "offsetTable")]
    offset_table: HashMap<String, i64>,
    updated_at: DateTime<Utc>,
}

/// Broadcast-mode offset store: one JSON file per `{client_id}/{group}`.
///
/// Writes go to a temp file in the same directory, are fsynced, and replace
/// the live file with an atomic rename; a crash mid-write leaves the previous
/// snapshot intact (the cost is duplicate delivery, never lost progress).
pub struct LocalFileOffsetStore {
    group: String,
    path: PathBuf,
    offset_table: Mutex<HashMap<MessageQueue, i64>>,
}

impl LocalFileOffsetStore {
    pub fn new(store_dir: PathBuf, client_id: &str, group: &str) -> Self {
        Self {
            group: group.to_string(),
            path: store_dir.join(client_id).join(group).join(OFFSET_FILE_NAME),
            offset_table: Mutex::new(HashMap::new()),
        }
    }

    /// Path of the live snapshot file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn read_from_memory(&self, mq: &MessageQueue) -> i64 {
        self.offset_table.lock().get(mq).copied().unwrap_or(-1)
    }

    async fn reload(&self) {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no offset snapshot yet");
                return;
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "offset snapshot unreadable");
                return;
            }
        };

        let snapshot: OffsetSnapshot = match serde_json::from_slice(&data) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "offset snapshot corrupt, ignoring");
                return;
            }
        };
        if snapshot.group != self.group {
            warn!(
                path = %self.path.display(),
                file_group = %snapshot.group,
                group = %self.group,
                "offset snapshot belongs to another group, ignoring"
            );
            return;
        }

        let mut table = self.offset_table.lock();
        for (key, offset) in snapshot.offset_table {
            match key.parse::<MessageQueue>() {
                Ok(mq) => {
                    table.insert(mq, offset);
                }
                Err(err) => warn!(key = %key, error = %err, "skipping malformed queue key"),
            }
        }
    }

    async fn write_snapshot(&self) -> Result<()> {
        let snapshot = OffsetSnapshot {
            group: self.group.clone(),
            offset_table: self
                .offset_table
                .lock()
                .iter()
                .map(|(mq, offset)| (mq.to_string(), *offset))
                .collect(),
            updated_at: Utc::now(),
        };
        let data = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Temp file in the same directory so the rename stays on one filesystem.
        let tmp_path = self.path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl OffsetStore for LocalFileOffsetStore {
    async fn load(&self) -> Result<()> {
        self.reload().await;
        Ok(())
    }

    fn update_offset(&self, mq: &MessageQueue, offset: i64, increase_only: bool) {
        update_offset_table(&mut self.offset_table.lock(), mq, offset, increase_only);
    }

    async fn read_offset(&self, mq: &MessageQueue, read_type: ReadOffsetType) -> i64 {
        match read_type {
            ReadOffsetType::ReadFromMemory => self.read_from_memory(mq),
            ReadOffsetType::ReadFromStore => {
                self.reload().await;
                self.read_from_memory(mq)
            }
            ReadOffsetType::MemoryFirstThenStore => {
                let offset = self.read_from_memory(mq);
                if offset >= 0 {
                    return offset;
                }
                self.reload().await;
                self.read_from_memory(mq)
            }
        }
    }

    async fn persist(&self, _mq: &MessageQueue) -> Result<()> {
        // The snapshot always carries the whole table.
        self.write_snapshot().await
    }

    async fn persist_all(&self, mqs: &[MessageQueue]) {
        if mqs.is_empty() {
            return;
        }
        if let Err(err) = self.write_snapshot().await {
            warn!(path = %self.path.display(), error = %err, "offset snapshot write failed");
        }
    }

    fn remove_offset(&self, _mq: &MessageQueue) {
        // Broadcast offsets outlive queue ownership; a re-acquired queue
        // resumes from its last local offset.
    }
}
