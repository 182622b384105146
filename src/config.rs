//! Consumer configuration.

use std::fmt;
use std::path::PathBuf;

use chrono::{NaiveDateTime, Utc};
use clap::{ArgAction, Parser, ValueEnum};

use crate::error::{Error, Result};

/// Format of [`ConsumerConfig::consume_timestamp`].
pub const CONSUME_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Where a freshly acquired queue starts when the offset store has no record
/// for it. Once an offset has been committed, every policy resumes from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ConsumeFromWhere {
    /// Start at the queue tail (retry topics start at 0).
    #[default]
    LastOffset,
    /// Start at offset 0.
    FirstOffset,
    /// Start at the offset closest to `consume_timestamp`.
    Timestamp,
}

impl fmt::Display for ConsumeFromWhere {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Matches the clap value names.
        let name = match self {
            ConsumeFromWhere::LastOffset => "last-offset",
            ConsumeFromWhere::FirstOffset => "first-offset",
            ConsumeFromWhere::Timestamp => "timestamp",
        };
        write!(f, "{name}")
    }
}

/// How queues are shared within the consumer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageModel {
    /// Every group member consumes every queue; offsets are kept locally.
    Broadcasting,
    /// Queues are partitioned across group members; offsets live on the broker.
    Clustering,
}

impl fmt::Display for MessageModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageModel::Broadcasting => write!(f, "BROADCASTING"),
            MessageModel::Clustering => write!(f, "CLUSTERING"),
        }
    }
}

/// Configuration for the push consumer.
#[derive(Debug, Clone, Parser)]
pub struct ConsumerConfig {
    /// Consumer group name, the cooperative identity within the cluster
    #[clap(long, env = "ROCKETMQ_CONSUMER_GROUP")]
    pub consumer_group: String,

    /// Broadcast mode: every group member consumes every queue
    #[clap(long)]
    pub broadcast: bool,

    /// Instance name; rewritten to the process id in cluster mode so that
    /// multiple instances on one host do not collide
    #[clap(long, default_value = "DEFAULT")]
    pub instance_name: String,

    /// Offset seeding policy for queues without a stored offset
    #[clap(long, value_enum, default_value_t = ConsumeFromWhere::LastOffset)]
    pub consume_from_where: ConsumeFromWhere,

    /// Seed timestamp for the timestamp policy, `yyyyMMddHHmmss`
    /// (defaults to half an hour ago)
    #[clap(long)]
    pub consume_timestamp: Option<String>,

    /// Messages requested per pull
    #[clap(long, default_value_t = 32)]
    pub pull_batch_size: u32,

    /// Idle gap between pulls per queue, in milliseconds
    #[clap(long, default_value_t = 0)]
    pub pull_interval_ms: u64,

    /// Soft ceiling on unacknowledged messages per queue before pulls throttle
    #[clap(long, default_value_t = 1000)]
    pub pull_threshold_for_queue: u32,

    /// How long the broker may hold a long poll open, in milliseconds
    #[clap(long, default_value_t = 15_000)]
    pub broker_suspend_max_time_ms: u64,

    /// Overall pull RPC timeout; must strictly exceed the broker suspend time
    #[clap(long, default_value_t = 30_000)]
    pub consumer_timeout_when_suspend_ms: u64,

    /// Back-off after a pull error, in milliseconds
    #[clap(long, default_value_t = 3_000)]
    pub pull_time_delay_when_exception_ms: u64,

    /// Re-send the subscription expression on every pull
    #[clap(long, default_value_t = true, action = ArgAction::Set)]
    pub post_subscription_when_pull: bool,

    /// Maximum messages handed to the listener per delivery batch
    #[clap(long, default_value_t = 1)]
    pub consume_message_batch_max_size: u32,

    /// How long a delivered batch may stay unacknowledged before the pull
    /// fails and the batch is scheduled for redelivery, in milliseconds
    #[clap(long, default_value_t = 3_000)]
    pub consume_timeout_ms: u64,

    /// Interval of the periodic heartbeat + rebalance pass, in milliseconds
    #[clap(long, default_value_t = 20_000)]
    pub rebalance_interval_ms: u64,

    /// Interval of the periodic offset flush, in milliseconds
    #[clap(long, default_value_t = 5_000)]
    pub persist_offset_interval_ms: u64,

    /// Directory of the local offset store used in broadcast mode
    #[clap(long, env = "ROCKETMQ_OFFSET_STORE_DIR")]
    pub offset_store_dir: Option<PathBuf>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_group: String::new(),
            broadcast: false,
            instance_name: "DEFAULT".to_string(),
            consume_from_where: ConsumeFromWhere::LastOffset,
            consume_timestamp: None,
            pull_batch_size: 32,
            pull_interval_ms: 0,
            pull_threshold_for_queue: 1000,
            broker_suspend_max_time_ms: 15_000,
            consumer_timeout_when_suspend_ms: 30_000,
            pull_time_delay_when_exception_ms: 3_000,
            post_subscription_when_pull: true,
            consume_message_batch_max_size: 1,
            consume_timeout_ms: 3_000,
            rebalance_interval_ms: 20_000,
            persist_offset_interval_ms: 5_000,
            offset_store_dir: None,
        }
    }
}

impl ConsumerConfig {
    pub fn message_model(&self) -> MessageModel {
        if self.broadcast {
            MessageModel::Broadcasting
        } else {
            MessageModel::Clustering
        }
    }

    /// Fatal-at-construction validation.
    pub fn validate(&self) -> Result<()> {
        if self.consumer_group.trim().is_empty() {
            return Err(Error::Config("consumer_group must not be empty".into()));
        }
        if self.pull_batch_size == 0 {
            return Err(Error::Config("pull_batch_size must be at least 1".into()));
        }
        if self.consume_message_batch_max_size == 0 {
            return Err(Error::Config(
                "consume_message_batch_max_size must be at least 1".into(),
            ));
        }
        if self.consumer_timeout_when_suspend_ms <= self.broker_suspend_max_time_ms {
            return Err(Error::Config(format!(
                "consumer_timeout_when_suspend_ms ({}) must exceed broker_suspend_max_time_ms ({})",
                self.consumer_timeout_when_suspend_ms, self.broker_suspend_max_time_ms
            )));
        }
        if let Some(ts) = &self.consume_timestamp {
            parse_consume_timestamp(ts)?;
        }
        Ok(())
    }

    /// Seed timestamp for [`ConsumeFromWhere::Timestamp`], in epoch millis.
    pub fn consume_timestamp_millis(&self) -> Result<i64> {
        match &self.consume_timestamp {
            Some(ts) => parse_consume_timestamp(ts),
            None => Ok((Utc::now() - chrono::Duration::minutes(30)).timestamp_millis()),
        }
    }

    /// In cluster mode several instances of one group may share a host; the
    /// process id keeps their client identities apart.
    pub fn change_instance_name_to_pid(&mut self) {
        if self.instance_name == "DEFAULT" {
            self.instance_name = std::process::id().to_string();
        }
    }

    pub(crate) fn offset_store_path(&self) -> PathBuf {
        self.offset_store_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(".rocketmq_offsets"))
    }
}

fn parse_consume_timestamp(ts: &str) -> Result<i64> {
    let parsed = NaiveDateTime::parse_from_str(ts, CONSUME_TIMESTAMP_FORMAT).map_err(|err| {
        Error::Config(format!(
            "consume_timestamp {ts:?} is not in yyyyMMddHHmmss format: {err}"
        ))
    })?;
    Ok(parsed.and_utc().timestamp_millis())
}
