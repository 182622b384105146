//! Queue allocation strategies for cluster-mode rebalancing.

use tracing::warn;

use crate::message::MessageQueue;

/// Deterministic split of a queue set across the members of a consumer group.
///
/// Every member runs the same strategy over identically sorted inputs, so the
/// union of all members' slices must equal the full queue set and the slices
/// must be pairwise disjoint. Inputs are pre-sorted by the rebalancer: queues
/// by `(topic, broker, queue id)`, client ids in ASCII order.
pub trait AllocateMessageQueueStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn allocate(
        &self,
        consumer_group: &str,
        current_cid: &str,
        mq_all: &[MessageQueue],
        cid_all: &[String],
    ) -> Vec<MessageQueue>;
}

/// The averaged strategy: contiguous slices, with the first `N mod M` members
/// taking one extra queue each.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocateMessageQueueAveragely;

impl AllocateMessageQueueStrategy for AllocateMessageQueueAveragely {
    fn name(&self) -> &str {
        "AVG"
    }

    fn allocate(
        &self,
        consumer_group: &str,
        current_cid: &str,
        mq_all: &[MessageQueue],
        cid_all: &[String],
    ) -> Vec<MessageQueue> {
        if current_cid.is_empty() || mq_all.is_empty() || cid_all.is_empty() {
            return Vec::new();
        }
        let Some(index) = cid_all.iter().position(|cid| cid == current_cid) else {
            warn!(
                consumer_group,
                client_id = current_cid,
                "client id not in consumer id list, allocating nothing"
            );
            return Vec::new();
        };

        let queues = mq_all.len();
        let members = cid_all.len();
        let remainder = queues % members;
        let average = queues / members;
        let size = average + usize::from(index < remainder);
        let start = index * average + index.min(remainder);

        mq_all[start..start + size].to_vec()
    }
}
