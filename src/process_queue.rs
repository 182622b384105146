//! Per-queue runtime control block.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use chrono::Utc;

/// A pull worker that has not pulled for this long is considered stalled and
/// gets evicted by the next rebalance pass.
pub const PULL_MAX_IDLE_TIME_MS: i64 = 120_000;

/// Mutable per-queue flags shared between the pull worker (writes the pull
/// timestamp and in-flight count) and the rebalancer (flips `dropped`).
///
/// `dropped` is write-once: once a queue is dropped it never comes back under
/// the same control block; re-acquiring the queue creates a fresh one seeded
/// from the offset store.
#[derive(Debug)]
pub struct ProcessQueue {
    last_pull_timestamp_ms: AtomicI64,
    dropped: AtomicBool,
    inflight_msg_count: AtomicU64,
}

impl Default for ProcessQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessQueue {
    pub fn new() -> Self {
        Self {
            last_pull_timestamp_ms: AtomicI64::new(now_millis()),
            dropped: AtomicBool::new(false),
            inflight_msg_count: AtomicU64::new(0),
        }
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    pub fn mark_dropped(&self) {
        self.dropped.store(true, Ordering::Release);
    }

    pub fn touch_last_pull(&self) {
        self.last_pull_timestamp_ms
            .store(now_millis(), Ordering::Relaxed);
    }

    pub fn last_pull_timestamp_ms(&self) -> i64 {
        self.last_pull_timestamp_ms.load(Ordering::Relaxed)
    }

    pub fn is_pull_expired(&self) -> bool {
        now_millis() - self.last_pull_timestamp_ms() > PULL_MAX_IDLE_TIME_MS
    }

    /// Messages delivered to the user and not yet acknowledged.
    pub fn inflight_count(&self) -> u64 {
        self.inflight_msg_count.load(Ordering::Relaxed)
    }

    pub(crate) fn begin_delivery(&self, count: usize) {
        self.inflight_msg_count
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn end_delivery(&self, count: usize) {
        self.inflight_msg_count
            .fetch_sub(count as u64, Ordering::Relaxed);
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
