//! Error types for the consumer core.

use crate::message::MessageQueue;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the consumer core.
///
/// Configuration and subscription errors are fatal at construction or
/// `subscribe()` time. Everything else is a runtime error that the consumer
/// funnels to the `error` event stream and recovers from with back-off.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid consumer configuration: {0}")]
    Config(String),

    #[error("consumer state error: {0}")]
    State(String),

    #[error("invalid subscription expression {expression:?} for topic {topic}: {reason}")]
    Subscription {
        topic: String,
        expression: String,
        reason: String,
    },

    #[error("malformed message queue key {0:?}")]
    MalformedQueueKey(String),

    #[error("broker address not found for {broker_name} (broker id {broker_id})")]
    BrokerNotFound { broker_name: String, broker_id: i64 },

    #[error("delivery of {count} message(s) from {message_queue} failed: {reason}")]
    Delivery {
        message_queue: MessageQueue,
        count: usize,
        reason: String,
    },

    #[error(
        "delivery of {count} message(s) from {message_queue} not acknowledged within {timeout_ms}ms"
    )]
    DeliveryTimeout {
        message_queue: MessageQueue,
        count: usize,
        timeout_ms: u64,
    },

    #[error("offset persistence failed for {message_queue}: {cause}")]
    OffsetPersist {
        message_queue: MessageQueue,
        cause: anyhow::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Transport-level failure bubbled up from the `MQClient` seam.
    #[error(transparent)]
    Client(#[from] anyhow::Error),
}
