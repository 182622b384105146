//! Queue ownership reconciliation.
//!
//! A rebalance pass walks every subscribed topic, asks the client for the
//! topic's queues and the group's live members, runs the allocation strategy
//! and reconciles the process-queue table against the result: released
//! queues are persisted and dropped, newly owned queues are seeded from the
//! offset store and get a pull worker spawned.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{ConsumeFromWhere, MessageModel};
use crate::consumer::{ConsumerEvent, ConsumerInner};
use crate::error::Result;
use crate::message::{is_retry_topic, MessageQueue};
use crate::offset::ReadOffsetType;
use crate::pull::{self, PullRequest};

/// Run one rebalance pass over all subscribed topics.
///
/// Passes are serialized per consumer; a pass that finds another one running
/// simply yields (the periodic timer will come back around).
pub(crate) async fn do_rebalance(inner: &Arc<ConsumerInner>) {
    let Ok(_guard) = inner.rebalance_lock.try_lock() else {
        debug!("rebalance already in progress, skipping pass");
        return;
    };
    for topic in inner.subscribed_topics() {
        if let Err(err) = rebalance_by_topic(inner, &topic).await {
            warn!(topic = %topic, error = %err, "rebalance failed for topic");
            inner.emit_error(err);
        }
    }
}

async fn rebalance_by_topic(inner: &Arc<ConsumerInner>, topic: &str) -> Result<()> {
    let mq_set = inner.client.topic_subscribe_info(topic).await?;
    if mq_set.is_empty() {
        warn!(topic = %topic, "no route info for topic, skipping rebalance");
        return Ok(());
    }

    let assigned = match inner.config.message_model() {
        MessageModel::Broadcasting => {
            let mut all = mq_set;
            all.sort();
            all
        }
        MessageModel::Clustering => {
            let group = &inner.config.consumer_group;
            let cid_all = inner.client.find_consumer_id_list(topic, group).await?;
            if cid_all.is_empty() {
                warn!(topic = %topic, consumer_group = %group, "no live consumer ids, skipping rebalance");
                return Ok(());
            }
            let mut mq_all = mq_set;
            mq_all.sort();
            let mut cids = cid_all;
            cids.sort();

            inner.allocate_strategy.allocate(
                group,
                &inner.client.client_id(),
                &mq_all,
                &cids,
            )
        }
    };

    let changed = update_process_queue_table(inner, topic, &assigned).await;
    if changed {
        info!(
            topic = %topic,
            owned = assigned.len(),
            strategy = inner.allocate_strategy.name(),
            "message queue ownership changed"
        );
        inner.emit_event(ConsumerEvent::MessageQueueChanged {
            topic: topic.to_string(),
            message_queues: assigned,
        });
    }
    Ok(())
}

/// Reconcile the table for one topic. Returns whether anything changed.
async fn update_process_queue_table(
    inner: &Arc<ConsumerInner>,
    topic: &str,
    assigned: &[MessageQueue],
) -> bool {
    let assigned_set: HashSet<&MessageQueue> = assigned.iter().collect();
    let mut changed = false;

    // Pass 1: release queues of this topic that are no longer assigned, and
    // evict stalled workers so the next pass can restart them.
    let current: Vec<(MessageQueue, Arc<PullRequest>)> = inner
        .process_queue_table
        .iter()
        .filter(|entry| entry.key().topic == topic)
        .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
        .collect();
    for (mq, request) in current {
        let unassigned = !assigned_set.contains(&mq);
        let expired = request.process_queue.is_pull_expired();
        if !unassigned && !expired {
            continue;
        }
        if !unassigned {
            warn!(message_queue = %mq, "pull expired, evicting stalled queue");
        }
        // Release only once the offset is safely out; on failure the queue
        // stays owned until the next pass retries.
        if !release_message_queue(inner, &mq).await {
            continue;
        }
        request.process_queue.mark_dropped();
        inner
            .process_queue_table
            .remove_if(&mq, |_, entry| Arc::ptr_eq(entry, &request));
        changed = true;
    }

    // Pass 2: acquire newly assigned queues.
    for mq in assigned {
        if inner.process_queue_table.contains_key(mq) {
            continue;
        }
        let next_offset = match compute_pull_from_where(inner, mq).await {
            Ok(offset) if offset >= 0 => offset,
            Ok(offset) => {
                warn!(message_queue = %mq, offset, "no usable start offset, skipping queue this cycle");
                continue;
            }
            Err(err) => {
                warn!(message_queue = %mq, error = %err, "start offset computation failed, skipping queue this cycle");
                continue;
            }
        };

        match inner.process_queue_table.entry(mq.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => continue,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let request = Arc::new(PullRequest::new(mq.clone(), next_offset));
                vacant.insert(Arc::clone(&request));
                info!(message_queue = %mq, next_offset, "message queue acquired");
                pull::spawn_pull_worker(Arc::clone(inner), request);
                changed = true;
            }
        }
    }

    changed
}

/// Persist and forget a queue's offset before giving the queue up. Returns
/// false when the persist failed and the queue must be kept for now.
async fn release_message_queue(inner: &Arc<ConsumerInner>, mq: &MessageQueue) -> bool {
    if let Err(err) = inner.offset_store.persist(mq).await {
        warn!(message_queue = %mq, error = %err, "offset persist before release failed, keeping queue");
        inner.emit_error(err);
        return false;
    }
    inner.offset_store.remove_offset(mq);
    true
}

/// Seed offset for a freshly acquired queue, from the store when it has one
/// and from the configured policy otherwise.
async fn compute_pull_from_where(inner: &Arc<ConsumerInner>, mq: &MessageQueue) -> Result<i64> {
    let last_offset = inner
        .offset_store
        .read_offset(mq, ReadOffsetType::ReadFromStore)
        .await;
    if last_offset >= 0 {
        return Ok(last_offset);
    }

    match inner.config.consume_from_where {
        ConsumeFromWhere::LastOffset => {
            if is_retry_topic(&mq.topic) {
                Ok(0)
            } else {
                Ok(inner.client.max_offset(mq).await?)
            }
        }
        ConsumeFromWhere::FirstOffset => Ok(0),
        ConsumeFromWhere::Timestamp => {
            if is_retry_topic(&mq.topic) {
                Ok(inner.client.max_offset(mq).await?)
            } else {
                let timestamp = inner.config.consume_timestamp_millis()?;
                Ok(inner.client.search_offset(mq, timestamp).await?)
            }
        }
    }
}
