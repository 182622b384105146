//! Broker-backed offset store for cluster mode.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{update_offset_table, OffsetStore, ReadOffsetType};
use crate::client::MQClient;
use crate::error::{Error, Result};
use crate::message::MessageQueue;

/// Cluster-mode offset store. The broker owns the truth; the memory table is
/// a write-through cache flushed by `persist`/`persist_all` via the offset
/// update RPC.
pub struct RemoteBrokerOffsetStore {
    group: String,
    client: Arc<dyn MQClient>,
    offset_table: Mutex<HashMap<MessageQueue, i64>>,
}

impl RemoteBrokerOffsetStore {
    pub fn new(group: &str, client: Arc<dyn MQClient>) -> Self {
        Self {
            group: group.to_string(),
            client,
            offset_table: Mutex::new(HashMap::new()),
        }
    }

    fn read_from_memory(&self, mq: &MessageQueue) -> i64 {
        self.offset_table.lock().get(mq).copied().unwrap_or(-1)
    }

    async fn read_from_broker(&self, mq: &MessageQueue) -> i64 {
        match self.client.query_consumer_offset(mq, &self.group).await {
            Ok(offset) => {
                if offset >= 0 {
                    self.update_offset(mq, offset, false);
                }
                offset
            }
            Err(err) => {
                warn!(
                    consumer_group = %self.group,
                    message_queue = %mq,
                    error = %err,
                    "query consumer offset from broker failed"
                );
                -1
            }
        }
    }
}

#[async_trait]
impl OffsetStore for RemoteBrokerOffsetStore {
    async fn load(&self) -> Result<()> {
        // Nothing to preload; offsets are fetched per queue on first use.
        Ok(())
    }

    fn update_offset(&self, mq: &MessageQueue, offset: i64, increase_only: bool) {
        update_offset_table(&mut self.offset_table.lock(), mq, offset, increase_only);
    }

    async fn read_offset(&self, mq: &MessageQueue, read_type: ReadOffsetType) -> i64 {
        match read_type {
            ReadOffsetType::ReadFromMemory => self.read_from_memory(mq),
            ReadOffsetType::ReadFromStore => self.read_from_broker(mq).await,
            ReadOffsetType::MemoryFirstThenStore => {
                let offset = self.read_from_memory(mq);
                if offset >= 0 {
                    return offset;
                }
                self.read_from_broker(mq).await
            }
        }
    }

    async fn persist(&self, mq: &MessageQueue) -> Result<()> {
        let offset = self.read_from_memory(mq);
        if offset < 0 {
            return Ok(());
        }
        self.client
            .update_consumer_offset(mq, &self.group, offset)
            .await
            .map_err(|cause| Error::OffsetPersist {
                message_queue: mq.clone(),
                cause,
            })
    }

    async fn persist_all(&self, mqs: &[MessageQueue]) {
        for mq in mqs {
            if let Err(err) = self.persist(mq).await {
                warn!(consumer_group = %self.group, error = %err, "offset flush failed");
            }
        }
    }

    fn remove_offset(&self, mq: &MessageQueue) {
        if self.offset_table.lock().remove(mq).is_some() {
            debug!(
                consumer_group = %self.group,
                message_queue = %mq,
                "removed message queue from offset table"
            );
        }
    }
}
