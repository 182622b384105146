//! Message and queue identities plus the pull wire contract.
//!
//! `MessageQueue` is the partition identity everything in the consumer is
//! keyed by. `PullResult` and `PullMessageRequestHeader` mirror the broker
//! wire contract for the long-poll pull RPC.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Broker id of the master replica.
pub const MASTER_BROKER_ID: i64 = 0;

/// Prefix of broker-managed retry topics (`%RETRY%<group>`).
pub const RETRY_GROUP_TOPIC_PREFIX: &str = "%RETRY%";

/// Retry topic name for a consumer group.
pub fn retry_topic(consumer_group: &str) -> String {
    format!("{RETRY_GROUP_TOPIC_PREFIX}{consumer_group}")
}

/// Whether a topic is a broker-managed retry topic.
pub fn is_retry_topic(topic: &str) -> bool {
    topic.starts_with(RETRY_GROUP_TOPIC_PREFIX)
}

/// Identity of a single partition: `(topic, broker, queue id)`.
///
/// Ordering is `(topic, broker_name, queue_id)` with a numeric tie-break on
/// the queue id, which is the order the allocation strategies require their
/// input sorted in. The canonical string key is `"topic@broker@id"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageQueue {
    pub topic: String,
    pub broker_name: String,
    pub queue_id: i32,
}

impl MessageQueue {
    pub fn new(topic: impl Into<String>, broker_name: impl Into<String>, queue_id: i32) -> Self {
        Self {
            topic: topic.into(),
            broker_name: broker_name.into(),
            queue_id,
        }
    }
}

impl fmt::Display for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}@{}", self.topic, self.broker_name, self.queue_id)
    }
}

impl FromStr for MessageQueue {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // The queue id and broker name cannot contain '@'; the topic is
        // whatever remains on the left.
        let mut parts = s.rsplitn(3, '@');
        let queue_id = parts
            .next()
            .and_then(|id| id.parse::<i32>().ok())
            .ok_or_else(|| Error::MalformedQueueKey(s.to_string()))?;
        let broker_name = parts
            .next()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| Error::MalformedQueueKey(s.to_string()))?;
        let topic = parts
            .next()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::MalformedQueueKey(s.to_string()))?;
        Ok(Self::new(topic, broker_name, queue_id))
    }
}

/// A decoded message as handed to the consumer by the transport.
///
/// Wire decoding happens on the `MQClient` side; the core only looks at the
/// tag (for client-side re-filtering) and the queue offset (for commit
/// bookkeeping).
#[derive(Debug, Clone, Default)]
pub struct MessageExt {
    pub topic: String,
    pub tags: Option<String>,
    pub keys: Option<String>,
    pub msg_id: String,
    pub queue_id: i32,
    pub queue_offset: i64,
    pub body: Bytes,
    pub properties: HashMap<String, String>,
}

/// Broker reply tag on a pull response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullStatus {
    Found,
    NoNewMsg,
    NoMatchedMsg,
    OffsetIllegal,
}

/// Decoded result of one pull RPC.
#[derive(Debug, Clone)]
pub struct PullResult {
    pub pull_status: PullStatus,
    pub next_begin_offset: i64,
    pub min_offset: i64,
    pub max_offset: i64,
    /// Replica the broker suggests reading from next (master = 0).
    pub suggest_which_broker_id: i64,
    pub msg_found_list: Vec<MessageExt>,
}

/// Request header of the pull RPC. Field names follow the broker wire
/// contract, hence the camelCase serialization.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullMessageRequestHeader {
    pub consumer_group: String,
    pub topic: String,
    pub queue_id: i32,
    pub queue_offset: i64,
    pub max_msg_nums: u32,
    pub sys_flag: i32,
    pub commit_offset: i64,
    pub suspend_timeout_millis: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    pub sub_version: i64,
}

/// Bit layout of the pull request `sysFlag` field.
pub mod sys_flag {
    /// The client has a committable consumed offset.
    pub const COMMIT_OFFSET: i32 = 1;
    /// The broker may hold the request open (long poll).
    pub const SUSPEND: i32 = 1 << 1;
    /// The request carries the subscription expression.
    pub const SUBSCRIPTION: i32 = 1 << 2;
    /// The subscription is a class filter.
    pub const CLASS_FILTER: i32 = 1 << 3;

    pub fn build(commit_offset: bool, suspend: bool, subscription: bool, class_filter: bool) -> i32 {
        let mut flag = 0;
        if commit_offset {
            flag |= COMMIT_OFFSET;
        }
        if suspend {
            flag |= SUSPEND;
        }
        if subscription {
            flag |= SUBSCRIPTION;
        }
        if class_filter {
            flag |= CLASS_FILTER;
        }
        flag
    }

    /// Slaves cannot accept offset commits.
    pub fn clear_commit_offset(flag: i32) -> i32 {
        flag & !COMMIT_OFFSET
    }
}
