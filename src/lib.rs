//! Push consumer client core for RocketMQ-compatible message queue brokers.
//!
//! This crate provides:
//! - Consumer group rebalancing with pluggable queue allocation
//! - One long-poll pull worker per owned queue with tag filtering
//! - At-least-once delivery with an explicit batch ack contract
//! - Offset checkpointing against a local file (broadcast mode) or the
//!   broker (cluster mode)
//!
//! The transport itself is behind the [`MQClient`] trait: name-server
//! lookups, route caching, heartbeat and the raw RPCs belong to the client
//! implementation, not to this crate.

pub mod allocate;
pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod message;
pub mod offset;
pub mod process_queue;
pub mod subscription;

mod pull;
mod rebalance;

pub use allocate::{AllocateMessageQueueAveragely, AllocateMessageQueueStrategy};
pub use client::{shared_client, FindBrokerResult, MQClient};
pub use config::{ConsumeFromWhere, ConsumerConfig, MessageModel};
pub use consumer::{AckHandle, ConsumerEvent, MessageListener, PushConsumer};
pub use error::{Error, Result};
pub use message::{
    is_retry_topic, retry_topic, MessageExt, MessageQueue, PullMessageRequestHeader, PullResult,
    PullStatus,
};
pub use offset::{LocalFileOffsetStore, OffsetStore, ReadOffsetType, RemoteBrokerOffsetStore};
pub use process_queue::ProcessQueue;
pub use subscription::{java_string_hash, SubscriptionData};
