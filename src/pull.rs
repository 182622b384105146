//! Per-queue pull workers.
//!
//! One task per owned queue long-polls the broker, re-filters by tag,
//! delivers matched batches to the registered listener and advances the
//! consumed offset once the batch is acknowledged. A worker owns its table
//! row exclusively; the rebalancer only inserts rows and flips the drop flag.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::MessageModel;
use crate::consumer::{AckHandle, ConsumerInner};
use crate::error::{Error, Result};
use crate::message::{
    sys_flag, MessageExt, MessageQueue, PullMessageRequestHeader, PullStatus, MASTER_BROKER_ID,
};
use crate::offset::ReadOffsetType;
use crate::process_queue::ProcessQueue;

/// Throttle delay while the per-queue unacked ceiling is exceeded.
const PULL_TIME_DELAY_FLOW_CONTROL_MS: u64 = 50;

/// Back-off before releasing a queue the broker rejected the offset for.
const OFFSET_ILLEGAL_BACKOFF_MS: u64 = 10_000;

/// A row in the process-queue table: queue identity, runtime flags and the
/// broker offset to request next. The worker is the only writer of
/// `next_offset`, so within one row's lifetime the offset only moves forward.
pub(crate) struct PullRequest {
    pub(crate) message_queue: MessageQueue,
    pub(crate) process_queue: ProcessQueue,
    next_offset: AtomicI64,
}

impl PullRequest {
    pub(crate) fn new(message_queue: MessageQueue, next_offset: i64) -> Self {
        Self {
            message_queue,
            process_queue: ProcessQueue::new(),
            next_offset: AtomicI64::new(next_offset),
        }
    }

    pub(crate) fn next_offset(&self) -> i64 {
        self.next_offset.load(Ordering::Acquire)
    }

    fn set_next_offset(&self, offset: i64) {
        self.next_offset.store(offset, Ordering::Release);
    }
}

enum PullOutcome {
    /// Messages were delivered and acknowledged.
    Delivered,
    /// Nothing to deliver this round.
    Idle,
    /// The queue was dropped; the worker must exit.
    QueueDropped,
}

pub(crate) fn spawn_pull_worker(inner: Arc<ConsumerInner>, request: Arc<PullRequest>) {
    tokio::spawn(pull_message_loop(inner, request));
}

async fn pull_message_loop(inner: Arc<ConsumerInner>, request: Arc<PullRequest>) {
    let mq = request.message_queue.clone();
    debug!(message_queue = %mq, "pull worker started");
    loop {
        if !inner.is_running() {
            break;
        }
        // The row may have been removed, or replaced by a re-acquisition of
        // the same queue with a fresh seed; either way this worker is done.
        let owned = inner
            .process_queue_table
            .get(&mq)
            .map(|entry| Arc::ptr_eq(entry.value(), &request))
            .unwrap_or(false);
        if !owned {
            debug!(message_queue = %mq, "queue no longer owned by this worker");
            break;
        }
        if request.process_queue.is_dropped() {
            break;
        }

        match pull_once(&inner, &request).await {
            Ok(PullOutcome::QueueDropped) => break,
            Ok(_) => {
                let interval = inner.config.pull_interval_ms;
                if interval > 0 {
                    sleep(Duration::from_millis(interval)).await;
                } else {
                    tokio::task::yield_now().await;
                }
            }
            Err(err) => {
                if !inner.is_running() {
                    break;
                }
                warn!(message_queue = %mq, error = %err, "MQConsumerPullMessageError");
                let delay = inner.config.pull_time_delay_when_exception_ms;
                inner.emit_error(err);
                sleep(Duration::from_millis(delay)).await;
            }
        }
    }
    debug!(message_queue = %mq, "pull worker stopped");
}

async fn pull_once(inner: &Arc<ConsumerInner>, request: &Arc<PullRequest>) -> Result<PullOutcome> {
    let mq = &request.message_queue;
    let pq = &request.process_queue;
    pq.touch_last_pull();

    let inflight = pq.inflight_count();
    if inflight > u64::from(inner.config.pull_threshold_for_queue) {
        debug!(message_queue = %mq, inflight, "flow control engaged, delaying pull");
        sleep(Duration::from_millis(PULL_TIME_DELAY_FLOW_CONTROL_MS)).await;
        return Ok(PullOutcome::Idle);
    }

    let Some(subscription) = inner.subscription(&mq.topic) else {
        warn!(topic = %mq.topic, "subscription data missing, delaying pull");
        sleep(Duration::from_millis(
            inner.config.pull_time_delay_when_exception_ms,
        ))
        .await;
        return Ok(PullOutcome::Idle);
    };

    let commit_offset = match inner.config.message_model() {
        MessageModel::Clustering => inner
            .offset_store
            .read_offset(mq, ReadOffsetType::ReadFromMemory)
            .await
            .max(0),
        MessageModel::Broadcasting => 0,
    };

    let mut flags = sys_flag::build(
        commit_offset > 0,
        true,
        inner.config.post_subscription_when_pull && !subscription.class_filter_mode,
        false,
    );

    let broker_id = inner
        .pull_from_which_node
        .get(mq)
        .map(|entry| *entry.value())
        .unwrap_or(MASTER_BROKER_ID);
    let broker = match inner
        .client
        .find_broker_address_in_subscribe(&mq.broker_name, broker_id, false)
        .await?
    {
        Some(found) => found,
        None => {
            // Unknown broker: refresh the route once and retry the lookup.
            inner
                .client
                .update_topic_route_info_from_name_server(&mq.topic)
                .await?;
            inner
                .client
                .find_broker_address_in_subscribe(&mq.broker_name, broker_id, false)
                .await?
                .ok_or_else(|| Error::BrokerNotFound {
                    broker_name: mq.broker_name.clone(),
                    broker_id,
                })?
        }
    };
    if broker.slave {
        flags = sys_flag::clear_commit_offset(flags);
    }

    let header = PullMessageRequestHeader {
        consumer_group: inner.config.consumer_group.clone(),
        topic: mq.topic.clone(),
        queue_id: mq.queue_id,
        queue_offset: request.next_offset(),
        max_msg_nums: inner.config.pull_batch_size,
        sys_flag: flags,
        commit_offset,
        suspend_timeout_millis: inner.config.broker_suspend_max_time_ms,
        subscription: ((flags & sys_flag::SUBSCRIPTION) != 0)
            .then(|| subscription.expression.clone()),
        sub_version: subscription.sub_version,
    };
    let rpc_timeout = Duration::from_millis(inner.config.consumer_timeout_when_suspend_ms);
    let result = inner
        .client
        .pull_message(&broker.broker_addr, header, rpc_timeout)
        .await?;

    inner
        .pull_from_which_node
        .insert(mq.clone(), result.suggest_which_broker_id);
    request.set_next_offset(result.next_begin_offset);

    if pq.is_dropped() {
        debug!(message_queue = %mq, "queue dropped mid-pull, discarding result");
        return Ok(PullOutcome::QueueDropped);
    }

    match result.pull_status {
        PullStatus::Found => {
            let matched: Vec<MessageExt> = result
                .msg_found_list
                .into_iter()
                .filter(|msg| subscription.matches_tag(msg.tags.as_deref()))
                .collect();
            if matched.is_empty() {
                // Everything filtered out; still record progress past the range.
                inner
                    .offset_store
                    .update_offset(mq, result.next_begin_offset, true);
                return Ok(PullOutcome::Idle);
            }
            deliver_matched(inner, request, matched).await?;
            Ok(PullOutcome::Delivered)
        }
        PullStatus::NoNewMsg | PullStatus::NoMatchedMsg => {
            inner
                .offset_store
                .update_offset(mq, result.next_begin_offset, true);
            Ok(PullOutcome::Idle)
        }
        PullStatus::OffsetIllegal => {
            warn!(
                message_queue = %mq,
                next_begin_offset = result.next_begin_offset,
                "broker reported illegal offset, dropping queue"
            );
            pq.mark_dropped();
            sleep(Duration::from_millis(OFFSET_ILLEGAL_BACKOFF_MS)).await;

            inner
                .offset_store
                .update_offset(mq, request.next_offset(), false);
            if let Err(err) = inner.offset_store.persist(mq).await {
                warn!(message_queue = %mq, error = %err, "offset persist after illegal offset failed");
                inner.emit_error(err);
            }
            inner.offset_store.remove_offset(mq);
            inner
                .process_queue_table
                .remove_if(mq, |_, current| Arc::ptr_eq(current, request));
            inner.pull_from_which_node.remove(mq);
            Ok(PullOutcome::QueueDropped)
        }
    }
}

/// Hand the matched messages to the listener in batches of
/// `consume_message_batch_max_size`, advancing the offset after each
/// acknowledged batch. An unacknowledged batch fails the whole pull; nothing
/// past the last ack is committed, so the remainder is redelivered.
async fn deliver_matched(
    inner: &Arc<ConsumerInner>,
    request: &Arc<PullRequest>,
    messages: Vec<MessageExt>,
) -> Result<()> {
    let mq = &request.message_queue;
    let listener = inner.listener().ok_or_else(|| Error::Delivery {
        message_queue: mq.clone(),
        count: messages.len(),
        reason: "no message listener registered".to_string(),
    })?;
    let batch_size = inner.config.consume_message_batch_max_size.max(1) as usize;
    let timeout_ms = inner.config.consume_timeout_ms;

    for chunk in messages.chunks(batch_size) {
        if request.process_queue.is_dropped() {
            debug!(message_queue = %mq, "queue dropped mid-delivery, discarding remainder");
            return Ok(());
        }
        let Some(last) = chunk.last() else {
            continue;
        };
        let committed_next = last.queue_offset + 1;
        let batch = chunk.to_vec();
        let count = batch.len();

        let (ack, done) = AckHandle::new();
        request.process_queue.begin_delivery(count);
        let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), async {
            listener.consume(mq.clone(), batch, ack).await;
            done.await
        })
        .await;
        request.process_queue.end_delivery(count);

        match outcome {
            Ok(Ok(())) => {
                if request.process_queue.is_dropped() {
                    return Ok(());
                }
                inner.offset_store.update_offset(mq, committed_next, false);
            }
            Ok(Err(_)) => {
                return Err(Error::Delivery {
                    message_queue: mq.clone(),
                    count,
                    reason: "acknowledgement handle dropped without ack".to_string(),
                });
            }
            Err(_) => {
                return Err(Error::DeliveryTimeout {
                    message_queue: mq.clone(),
                    count,
                    timeout_ms,
                });
            }
        }
    }
    Ok(())
}
