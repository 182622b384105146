//! The push consumer façade.
//!
//! `PushConsumer` wires the rebalancer, the pull workers and the offset
//! store together over a shared `ConsumerInner`, and exposes the lifecycle:
//! subscribe, start, shutdown, plus the event stream and the delivery/ack
//! contract.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::allocate::{AllocateMessageQueueAveragely, AllocateMessageQueueStrategy};
use crate::client::MQClient;
use crate::config::{ConsumerConfig, MessageModel};
use crate::error::{Error, Result};
use crate::message::{retry_topic, MessageExt, MessageQueue};
use crate::offset::{LocalFileOffsetStore, OffsetStore, RemoteBrokerOffsetStore};
use crate::pull::PullRequest;
use crate::rebalance;
use crate::subscription::{SubscriptionData, SUB_ALL};

/// Events the consumer emits besides message delivery.
///
/// Errors from the transport, the offset store and the pull workers are
/// funneled here instead of tearing down internal loops.
#[derive(Debug)]
pub enum ConsumerEvent {
    /// Queue ownership for a topic changed after a rebalance.
    MessageQueueChanged {
        topic: String,
        message_queues: Vec<MessageQueue>,
    },
    Error(Error),
}

/// Completion handle for one delivered batch.
///
/// The worker holds the batch in flight until `ack` is called; dropping the
/// handle without acking counts as a negative acknowledgement and the batch
/// is redelivered later.
pub struct AckHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl AckHandle {
    pub(crate) fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Acknowledge the batch; the consumed offset advances past it.
    pub fn ack(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// User-side message handler with an explicit ack contract.
///
/// One batch is in flight per queue at a time; batches arrive in
/// broker-assigned offset order within a queue and interleave freely across
/// queues.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn consume(&self, message_queue: MessageQueue, messages: Vec<MessageExt>, ack: AckHandle);
}

/// Adapter for handlers without an explicit ack: `Ok` acks the batch on
/// return, `Err` lets it be redelivered.
struct AutoAckListener<F> {
    handler: F,
}

#[async_trait]
impl<F, Fut> MessageListener for AutoAckListener<F>
where
    F: Fn(MessageQueue, Vec<MessageExt>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn consume(&self, message_queue: MessageQueue, messages: Vec<MessageExt>, ack: AckHandle) {
        match (self.handler)(message_queue.clone(), messages).await {
            Ok(()) => ack.ack(),
            Err(err) => {
                warn!(
                    message_queue = %message_queue,
                    error = %err,
                    "message handler failed, batch will be redelivered"
                );
            }
        }
    }
}

/// State shared between the façade, the rebalancer and the pull workers.
pub(crate) struct ConsumerInner {
    pub(crate) config: ConsumerConfig,
    pub(crate) client: Arc<dyn MQClient>,
    pub(crate) offset_store: Arc<dyn OffsetStore>,
    pub(crate) allocate_strategy: Arc<dyn AllocateMessageQueueStrategy>,
    pub(crate) subscriptions: RwLock<HashMap<String, SubscriptionData>>,
    pub(crate) process_queue_table: DashMap<MessageQueue, Arc<PullRequest>>,
    /// Replica hint per queue, fed by `suggestWhichBrokerId` on pull results.
    pub(crate) pull_from_which_node: DashMap<MessageQueue, i64>,
    pub(crate) rebalance_lock: tokio::sync::Mutex<()>,
    listener: RwLock<Option<Arc<dyn MessageListener>>>,
    events: mpsc::UnboundedSender<ConsumerEvent>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl ConsumerInner {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub(crate) fn subscription(&self, topic: &str) -> Option<SubscriptionData> {
        self.subscriptions.read().get(topic).cloned()
    }

    pub(crate) fn subscribed_topics(&self) -> Vec<String> {
        self.subscriptions.read().keys().cloned().collect()
    }

    pub(crate) fn listener(&self) -> Option<Arc<dyn MessageListener>> {
        self.listener.read().clone()
    }

    pub(crate) fn emit_event(&self, event: ConsumerEvent) {
        // Nobody listening is fine; events must never block internal loops.
        let _ = self.events.send(event);
    }

    pub(crate) fn emit_error(&self, err: Error) {
        self.emit_event(ConsumerEvent::Error(err));
    }

    fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

/// A push-style consumer: subscribes to topics, shares their queues with the
/// other members of its group and long-polls each owned queue, delivering
/// batches to the registered listener.
pub struct PushConsumer {
    inner: Arc<ConsumerInner>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConsumerEvent>>>,
}

impl PushConsumer {
    /// Build a consumer over an existing client handle with the averaged
    /// allocation strategy.
    pub fn new(config: ConsumerConfig, client: Arc<dyn MQClient>) -> Result<Self> {
        Self::with_strategy(config, client, Arc::new(AllocateMessageQueueAveragely))
    }

    /// Build a consumer with a custom allocation strategy. Every member of
    /// the group must use the same strategy or the allocation is no longer a
    /// partition.
    pub fn with_strategy(
        mut config: ConsumerConfig,
        client: Arc<dyn MQClient>,
        strategy: Arc<dyn AllocateMessageQueueStrategy>,
    ) -> Result<Self> {
        config.validate()?;
        if config.message_model() == MessageModel::Clustering {
            config.change_instance_name_to_pid();
        }

        let offset_store: Arc<dyn OffsetStore> = match config.message_model() {
            MessageModel::Broadcasting => Arc::new(LocalFileOffsetStore::new(
                config.offset_store_path(),
                &client.client_id(),
                &config.consumer_group,
            )),
            MessageModel::Clustering => Arc::new(RemoteBrokerOffsetStore::new(
                &config.consumer_group,
                Arc::clone(&client),
            )),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(ConsumerInner {
            config,
            client,
            offset_store,
            allocate_strategy: strategy,
            subscriptions: RwLock::new(HashMap::new()),
            process_queue_table: DashMap::new(),
            pull_from_which_node: DashMap::new(),
            rebalance_lock: tokio::sync::Mutex::new(()),
            listener: RwLock::new(None),
            events: events_tx,
            running: AtomicBool::new(false),
            shutdown: shutdown_tx,
        });
        Ok(Self {
            inner,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// The offset store backing this consumer.
    pub fn offset_store(&self) -> Arc<dyn OffsetStore> {
        Arc::clone(&self.inner.offset_store)
    }

    /// Queues currently owned by this consumer, with a live pull worker each.
    pub fn owned_message_queues(&self) -> Vec<MessageQueue> {
        let mut owned: Vec<MessageQueue> = self
            .inner
            .process_queue_table
            .iter()
            .filter(|entry| !entry.value().process_queue.is_dropped())
            .map(|entry| entry.key().clone())
            .collect();
        owned.sort();
        owned
    }

    /// Take the event stream. Yields `None` forever after the first call.
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<ConsumerEvent>> {
        self.events_rx.lock().take()
    }

    /// Register the delivery listener with the explicit ack contract.
    pub fn register_message_listener(&self, listener: Arc<dyn MessageListener>) {
        *self.inner.listener.write() = Some(listener);
    }

    /// Register a handler that acks automatically when it returns `Ok`.
    pub fn register_message_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(MessageQueue, Vec<MessageExt>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_message_listener(Arc::new(AutoAckListener { handler }));
    }

    /// Subscribe `topic` with a tag expression (`*` or empty for all,
    /// otherwise `"TagA||TagB"`). Re-subscribing replaces the expression and
    /// bumps the subscription version. On a running consumer this triggers a
    /// route refresh, a heartbeat and an immediate rebalance.
    pub async fn subscribe(&self, topic: &str, expression: &str) -> Result<()> {
        let data = SubscriptionData::new(topic, expression)?;
        self.inner
            .subscriptions
            .write()
            .insert(topic.to_string(), data);
        info!(topic = %topic, expression = %expression, "subscribed");

        if self.inner.is_running() {
            if let Err(err) = self
                .inner
                .client
                .update_topic_route_info_from_name_server(topic)
                .await
            {
                warn!(topic = %topic, error = %err, "route refresh after subscribe failed");
            }
            if let Err(err) = self.inner.client.send_heartbeat_to_all_broker().await {
                warn!(error = %err, "heartbeat after subscribe failed");
            }
            rebalance::do_rebalance(&self.inner).await;
        }
        Ok(())
    }

    /// Start consuming: register with the client, wait for it to become
    /// ready, load the offset store and kick off the periodic rebalance and
    /// offset-flush tasks.
    pub async fn start(&self) -> Result<()> {
        if self.inner.is_running() {
            return Err(Error::State("consumer already started".to_string()));
        }
        let group = self.inner.config.consumer_group.clone();
        self.inner.client.register_consumer(&group).await?;
        self.inner.client.ready().await?;

        if self.inner.config.message_model() == MessageModel::Clustering {
            // Redelivered messages come back through the group's retry topic.
            let retry = retry_topic(&group);
            let data = SubscriptionData::new(&retry, SUB_ALL)?;
            self.inner.subscriptions.write().insert(retry, data);
        }

        self.inner.offset_store.load().await?;
        self.inner.set_running(true);

        if let Err(err) = self.inner.client.update_all_topic_router_info().await {
            warn!(error = %err, "initial route refresh failed");
        }
        spawn_background_tasks(&self.inner);
        info!(
            consumer_group = %group,
            model = %self.inner.config.message_model(),
            client_id = %self.inner.client.client_id(),
            "consumer started"
        );
        Ok(())
    }

    /// Run a rebalance pass now. The transport calls this when the broker
    /// notifies a consumer-id change; it is also safe to call at any time.
    pub async fn rebalance_now(&self) {
        rebalance::do_rebalance(&self.inner).await;
    }

    /// Cooperative shutdown: flush offsets, drop every owned queue so the
    /// workers exit at their next check, and release the client.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.inner.is_running() {
            return Ok(());
        }
        self.inner.set_running(false);
        let _ = self.inner.shutdown.send(true);

        let owned: Vec<MessageQueue> = self
            .inner
            .process_queue_table
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        self.inner.offset_store.persist_all(&owned).await;

        for entry in self.inner.process_queue_table.iter() {
            entry.value().process_queue.mark_dropped();
        }
        self.inner.process_queue_table.clear();
        self.inner.pull_from_which_node.clear();
        self.inner.subscriptions.write().clear();
        *self.inner.listener.write() = None;

        let group = &self.inner.config.consumer_group;
        if let Err(err) = self.inner.client.unregister_consumer(group).await {
            warn!(error = %err, "unregister consumer failed");
        }
        if let Err(err) = self.inner.client.close().await {
            warn!(error = %err, "closing mq client failed");
        }
        info!(consumer_group = %group, "consumer shut down");
        Ok(())
    }
}

/// Periodic work: heartbeat + rebalance on one timer, offset flush on
/// another. Both stop on the shutdown signal.
fn spawn_background_tasks(inner: &Arc<ConsumerInner>) {
    {
        let inner = Arc::clone(inner);
        let mut shutdown = inner.shutdown_signal();
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_millis(inner.config.rebalance_interval_ms));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => {
                        if !inner.is_running() {
                            break;
                        }
                        if let Err(err) = inner.client.send_heartbeat_to_all_broker().await {
                            warn!(error = %err, "heartbeat to brokers failed");
                        }
                        rebalance::do_rebalance(&inner).await;
                    }
                }
            }
            debug!("rebalance task stopped");
        });
    }
    {
        let inner = Arc::clone(inner);
        let mut shutdown = inner.shutdown_signal();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(
                inner.config.persist_offset_interval_ms,
            ));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => {
                        if !inner.is_running() {
                            break;
                        }
                        let owned: Vec<MessageQueue> = inner
                            .process_queue_table
                            .iter()
                            .map(|entry| entry.key().clone())
                            .collect();
                        inner.offset_store.persist_all(&owned).await;
                    }
                }
            }
            debug!("offset flush task stopped");
        });
    }
}
