//! Consumed-offset bookkeeping.
//!
//! One store per consumer, keyed by message queue. Broadcast mode keeps
//! offsets in a local file; cluster mode treats the broker as the
//! authoritative store with a write-through memory cache. Either way the
//! in-memory table is what pull workers read and advance; persistence runs
//! on a timer and at the rebalance/shutdown edges.

mod local_file;
mod remote_broker;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::MessageQueue;

pub use local_file::LocalFileOffsetStore;
pub use remote_broker::RemoteBrokerOffsetStore;

/// Which layer a [`OffsetStore::read_offset`] call consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOffsetType {
    ReadFromMemory,
    ReadFromStore,
    MemoryFirstThenStore,
}

/// Authoritative consumed-offset table for one consumer group.
///
/// Reads return `-1` when no offset is known; read failures also surface as
/// `-1` (the caller skips the queue and retries later). Write failures from
/// `persist_all` are logged and retried on the next flush cycle.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Initialize from stable storage. Failures leave all offsets unknown.
    async fn load(&self) -> Result<()>;

    /// Set the in-memory offset. With `increase_only`, only replace a smaller
    /// value; concurrent writers can then never move an offset backwards.
    fn update_offset(&self, mq: &MessageQueue, offset: i64, increase_only: bool);

    async fn read_offset(&self, mq: &MessageQueue, read_type: ReadOffsetType) -> i64;

    /// Flush one queue's offset to stable storage.
    async fn persist(&self, mq: &MessageQueue) -> Result<()>;

    /// Batch flush. Per-queue failures are logged, not returned; the next
    /// cycle retries them.
    async fn persist_all(&self, mqs: &[MessageQueue]);

    /// Drop the in-memory record for `mq`.
    fn remove_offset(&self, mq: &MessageQueue);
}

pub(crate) fn update_offset_table(
    table: &mut HashMap<MessageQueue, i64>,
    mq: &MessageQueue,
    offset: i64,
    increase_only: bool,
) {
    table
        .entry(mq.clone())
        .and_modify(|current| {
            if !increase_only || *current < offset {
                *current = offset;
            }
        })
        .or_insert(offset);
}
