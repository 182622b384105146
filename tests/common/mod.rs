//! Shared test fixtures: a scriptable in-memory `MQClient` and listeners.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use rocketmq_consumer::{
    AckHandle, FindBrokerResult, MQClient, MessageExt, MessageListener, MessageQueue,
    PullMessageRequestHeader, PullResult, PullStatus,
};

/// In-memory transport double. Pull results are scripted per queue; a pull
/// with no scripted result long-polls until one is pushed.
pub struct MockMQClient {
    client_id: String,
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    routes: HashMap<String, Vec<MessageQueue>>,
    consumer_ids: Vec<String>,
    broker_addrs: HashMap<String, FindBrokerResult>,
    pull_scripts: HashMap<MessageQueue, VecDeque<PullResult>>,
    max_offsets: HashMap<MessageQueue, i64>,
    search_offsets: HashMap<MessageQueue, i64>,
    broker_offsets: HashMap<MessageQueue, i64>,
    pull_headers: Vec<PullMessageRequestHeader>,
    calls: Vec<String>,
}

impl MockMQClient {
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Register a topic route; broker addresses for the involved brokers are
    /// registered along the way.
    pub fn set_route(&self, topic: &str, queues: Vec<MessageQueue>) {
        let mut state = self.state.lock();
        for mq in &queues {
            state
                .broker_addrs
                .entry(mq.broker_name.clone())
                .or_insert_with(|| FindBrokerResult {
                    broker_addr: format!("127.0.0.1:10911/{}", mq.broker_name),
                    slave: false,
                });
        }
        state.routes.insert(topic.to_string(), queues);
    }

    pub fn set_consumer_ids(&self, cids: &[&str]) {
        self.state.lock().consumer_ids = cids.iter().map(|c| c.to_string()).collect();
    }

    pub fn set_max_offset(&self, mq: &MessageQueue, offset: i64) {
        self.state.lock().max_offsets.insert(mq.clone(), offset);
    }

    pub fn set_search_offset(&self, mq: &MessageQueue, offset: i64) {
        self.state.lock().search_offsets.insert(mq.clone(), offset);
    }

    pub fn set_broker_offset(&self, mq: &MessageQueue, offset: i64) {
        self.state.lock().broker_offsets.insert(mq.clone(), offset);
    }

    /// Script the next pull result for a queue.
    pub fn push_pull_result(&self, mq: &MessageQueue, result: PullResult) {
        self.state
            .lock()
            .pull_scripts
            .entry(mq.clone())
            .or_default()
            .push_back(result);
    }

    /// Offset last committed to the "broker" for this queue.
    pub fn committed_offset(&self, mq: &MessageQueue) -> Option<i64> {
        self.state.lock().broker_offsets.get(mq).copied()
    }

    pub fn pull_headers(&self) -> Vec<PullMessageRequestHeader> {
        self.state.lock().pull_headers.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.state.lock().calls.push(call.into());
    }
}

#[async_trait]
impl MQClient for MockMQClient {
    fn client_id(&self) -> String {
        self.client_id.clone()
    }

    async fn register_consumer(&self, group: &str) -> anyhow::Result<()> {
        self.record(format!("register_consumer:{group}"));
        Ok(())
    }

    async fn unregister_consumer(&self, group: &str) -> anyhow::Result<()> {
        self.record(format!("unregister_consumer:{group}"));
        Ok(())
    }

    async fn ready(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.record("close");
        Ok(())
    }

    async fn update_all_topic_router_info(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn update_topic_route_info_from_name_server(&self, topic: &str) -> anyhow::Result<()> {
        self.record(format!("route_refresh:{topic}"));
        Ok(())
    }

    async fn send_heartbeat_to_all_broker(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn topic_subscribe_info(&self, topic: &str) -> anyhow::Result<Vec<MessageQueue>> {
        Ok(self
            .state
            .lock()
            .routes
            .get(topic)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_consumer_id_list(
        &self,
        _topic: &str,
        _group: &str,
    ) -> anyhow::Result<Vec<String>> {
        Ok(self.state.lock().consumer_ids.clone())
    }

    async fn find_broker_address_in_subscribe(
        &self,
        broker_name: &str,
        _broker_id: i64,
        _only_this_broker: bool,
    ) -> anyhow::Result<Option<FindBrokerResult>> {
        Ok(self.state.lock().broker_addrs.get(broker_name).cloned())
    }

    async fn pull_message(
        &self,
        _broker_addr: &str,
        header: PullMessageRequestHeader,
        _timeout: Duration,
    ) -> anyhow::Result<PullResult> {
        loop {
            {
                let mut state = self.state.lock();
                let key = state
                    .pull_scripts
                    .iter()
                    .find(|(mq, script)| {
                        mq.topic == header.topic
                            && mq.queue_id == header.queue_id
                            && !script.is_empty()
                    })
                    .map(|(mq, _)| mq.clone());
                if let Some(mq) = key {
                    if let Some(result) = state
                        .pull_scripts
                        .get_mut(&mq)
                        .and_then(|script| script.pop_front())
                    {
                        state.pull_headers.push(header.clone());
                        return Ok(result);
                    }
                }
            }
            // Long poll: wait for a result to be scripted.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn max_offset(&self, mq: &MessageQueue) -> anyhow::Result<i64> {
        Ok(self.state.lock().max_offsets.get(mq).copied().unwrap_or(0))
    }

    async fn search_offset(&self, mq: &MessageQueue, _timestamp_ms: i64) -> anyhow::Result<i64> {
        Ok(self
            .state
            .lock()
            .search_offsets
            .get(mq)
            .copied()
            .unwrap_or(0))
    }

    async fn query_consumer_offset(&self, mq: &MessageQueue, _group: &str) -> anyhow::Result<i64> {
        Ok(self
            .state
            .lock()
            .broker_offsets
            .get(mq)
            .copied()
            .unwrap_or(-1))
    }

    async fn update_consumer_offset(
        &self,
        mq: &MessageQueue,
        group: &str,
        offset: i64,
    ) -> anyhow::Result<()> {
        self.record(format!("update_consumer_offset:{group}:{mq}:{offset}"));
        self.state.lock().broker_offsets.insert(mq.clone(), offset);
        Ok(())
    }
}

/// Listener that records every batch and acks immediately.
#[derive(Default)]
pub struct CollectingListener {
    pub received: Mutex<Vec<(MessageQueue, Vec<MessageExt>)>>,
}

impl CollectingListener {
    pub fn batches(&self) -> usize {
        self.received.lock().len()
    }

    pub fn delivered_tags(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .flat_map(|(_, msgs)| msgs.iter().filter_map(|m| m.tags.clone()))
            .collect()
    }
}

#[async_trait]
impl MessageListener for CollectingListener {
    async fn consume(&self, message_queue: MessageQueue, messages: Vec<MessageExt>, ack: AckHandle) {
        self.received.lock().push((message_queue, messages));
        ack.ack();
    }
}

/// Listener that holds on to the ack handle forever, simulating user code
/// that never completes a batch.
#[derive(Default)]
pub struct HoldingListener {
    pub held: Mutex<Vec<AckHandle>>,
}

#[async_trait]
impl MessageListener for HoldingListener {
    async fn consume(
        &self,
        _message_queue: MessageQueue,
        _messages: Vec<MessageExt>,
        ack: AckHandle,
    ) {
        self.held.lock().push(ack);
    }
}

pub fn message(topic: &str, queue_id: i32, queue_offset: i64, tag: Option<&str>) -> MessageExt {
    MessageExt {
        topic: topic.to_string(),
        tags: tag.map(|t| t.to_string()),
        msg_id: format!("{topic}-{queue_id}-{queue_offset}"),
        queue_id,
        queue_offset,
        body: Bytes::from_static(b"payload"),
        ..Default::default()
    }
}

pub fn found(next_begin_offset: i64, msgs: Vec<MessageExt>) -> PullResult {
    PullResult {
        pull_status: PullStatus::Found,
        next_begin_offset,
        min_offset: 0,
        max_offset: next_begin_offset,
        suggest_which_broker_id: 0,
        msg_found_list: msgs,
    }
}

pub fn no_new_msg(next_begin_offset: i64) -> PullResult {
    PullResult {
        pull_status: PullStatus::NoNewMsg,
        next_begin_offset,
        min_offset: 0,
        max_offset: next_begin_offset,
        suggest_which_broker_id: 0,
        msg_found_list: Vec::new(),
    }
}

pub fn offset_illegal(next_begin_offset: i64) -> PullResult {
    PullResult {
        pull_status: PullStatus::OffsetIllegal,
        next_begin_offset,
        min_offset: 0,
        max_offset: next_begin_offset,
        suggest_which_broker_id: 0,
        msg_found_list: Vec::new(),
    }
}

/// Poll until `condition` holds, failing the test after a (virtual) deadline.
pub async fn wait_until<F: Fn() -> bool>(condition: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
