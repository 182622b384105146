//! The transport seam.
//!
//! The consumer core does not speak the remoting protocol itself; it drives
//! an [`MQClient`] that owns name-server lookups, route caching, heartbeat
//! and the raw RPCs. Implementations may fail on any call; the core treats
//! those failures as transport errors and retries through rebalance/back-off.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::message::{MessageQueue, PullMessageRequestHeader, PullResult};

/// Broker lookup result for a subscription-side read.
#[derive(Debug, Clone)]
pub struct FindBrokerResult {
    pub broker_addr: String,
    /// True when the resolved replica is a slave; slaves reject offset commits.
    pub slave: bool,
}

/// Client-side transport handle shared by every consumer registered on it.
#[async_trait]
pub trait MQClient: Send + Sync {
    /// Unique identifier of this client instance within its group.
    fn client_id(&self) -> String;

    async fn register_consumer(&self, group: &str) -> anyhow::Result<()>;

    async fn unregister_consumer(&self, group: &str) -> anyhow::Result<()>;

    /// Resolves once the client is connected and its route tables are usable.
    async fn ready(&self) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;

    async fn update_all_topic_router_info(&self) -> anyhow::Result<()>;

    async fn update_topic_route_info_from_name_server(&self, topic: &str) -> anyhow::Result<()>;

    async fn send_heartbeat_to_all_broker(&self) -> anyhow::Result<()>;

    /// Message queues of `topic` from the cached route table.
    async fn topic_subscribe_info(&self, topic: &str) -> anyhow::Result<Vec<MessageQueue>>;

    /// Client ids of every live member of `group` subscribed to `topic`.
    async fn find_consumer_id_list(&self, topic: &str, group: &str)
        -> anyhow::Result<Vec<String>>;

    /// Address of a specific replica of `broker_name`. With
    /// `only_this_broker` unset the client may substitute another replica.
    async fn find_broker_address_in_subscribe(
        &self,
        broker_name: &str,
        broker_id: i64,
        only_this_broker: bool,
    ) -> anyhow::Result<Option<FindBrokerResult>>;

    /// The long-poll pull RPC. `timeout` bounds the whole round trip and must
    /// exceed the suspend time carried in the header.
    async fn pull_message(
        &self,
        broker_addr: &str,
        header: PullMessageRequestHeader,
        timeout: Duration,
    ) -> anyhow::Result<PullResult>;

    async fn max_offset(&self, mq: &MessageQueue) -> anyhow::Result<i64>;

    async fn search_offset(&self, mq: &MessageQueue, timestamp_ms: i64) -> anyhow::Result<i64>;

    /// Consumed offset of `(group, mq)` as known to the broker, `-1` if none.
    async fn query_consumer_offset(&self, mq: &MessageQueue, group: &str) -> anyhow::Result<i64>;

    async fn update_consumer_offset(
        &self,
        mq: &MessageQueue,
        group: &str,
        offset: i64,
    ) -> anyhow::Result<()>;
}

static CLIENTS: Lazy<Mutex<HashMap<String, Weak<dyn MQClient>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Process-wide client registry.
///
/// Consumers in one process that share a client key (typically the client
/// config identity) share one transport handle and therefore one connection
/// pool. The registry holds weak references, so a client is torn down when
/// the last consumer drops its handle, and `create` runs again on next use.
pub fn shared_client<F>(client_key: &str, create: F) -> Arc<dyn MQClient>
where
    F: FnOnce() -> Arc<dyn MQClient>,
{
    let mut table = CLIENTS.lock();
    if let Some(existing) = table.get(client_key).and_then(Weak::upgrade) {
        return existing;
    }
    let fresh = create();
    table.insert(client_key.to_string(), Arc::downgrade(&fresh));
    fresh
}
