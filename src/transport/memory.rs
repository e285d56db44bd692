// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A single-process broker implementing the transport capability. It routes
//! through the default exchange and direct exchanges, pushes deliveries to
//! consumers round-robin, serves `get`, and tracks unacknowledged deliveries so
//! acknowledgment mistakes surface as errors. It also records declarations,
//! channels and acknowledgments for inspection in tests.
//!
//! Prefetch limits are recorded but not enforced.

use super::{Broker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, MessageProperties};
use crate::{
    config::RabbitMQConfig,
    errors::AmqpError,
    exchange::{ExchangeDefinition, DEFAULT_EXCHANGE},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, AmqpError>>;

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
}

struct MemoryConsumer {
    tag: String,
    channel_id: u64,
    connection: Arc<AtomicBool>,
    sender: DeliverySender,
}

#[derive(Default)]
struct MemoryQueue {
    messages: VecDeque<StoredMessage>,
    consumers: Vec<MemoryConsumer>,
    cursor: usize,
}

#[derive(Default)]
struct MemoryExchange {
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, MemoryExchange>,
    queues: HashMap<String, MemoryQueue>,
    unacked: HashMap<u64, String>,
    next_tag: u64,
    acks: Vec<u64>,
    queue_declarations: HashMap<String, usize>,
    exchange_declarations: HashMap<String, usize>,
    prefetch: Vec<u16>,
    connections: Vec<Arc<AtomicBool>>,
    channels_opened: usize,
}

impl BrokerState {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, AmqpError> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }

        let Some(exch) = self.exchanges.get(exchange) else {
            warn!(exchange, "publishing to an undeclared exchange");
            return Err(AmqpError::PublishingError);
        };

        let mut targets: Vec<String> = exch
            .bindings
            .iter()
            .filter(|(_, key)| key == routing_key)
            .map(|(queue, _)| queue.clone())
            .collect();
        targets.dedup();

        Ok(targets)
    }

    fn enqueue(&mut self, queue: &str, msg: StoredMessage) {
        let BrokerState {
            queues,
            unacked,
            next_tag,
            ..
        } = self;

        let Some(q) = queues.get_mut(queue) else {
            return;
        };

        while !q.consumers.is_empty() {
            let idx = q.cursor % q.consumers.len();
            q.cursor = q.cursor.wrapping_add(1);

            *next_tag += 1;
            let delivery = to_delivery(*next_tag, &msg);

            if q.consumers[idx].sender.send(Ok(delivery)).is_ok() {
                unacked.insert(*next_tag, queue.to_owned());
                return;
            }

            q.consumers.remove(idx);
        }

        q.messages.push_back(msg);
    }

    fn take(&mut self, queue: &str) -> Option<Delivery> {
        let msg = self.queues.get_mut(queue)?.messages.pop_front()?;
        self.next_tag += 1;
        self.unacked.insert(self.next_tag, queue.to_owned());
        Some(to_delivery(self.next_tag, &msg))
    }

    fn drop_consumers(&mut self, channel_id: u64) {
        for q in self.queues.values_mut() {
            q.consumers.retain(|c| c.channel_id != channel_id);
        }
    }
}

fn to_delivery(tag: u64, msg: &StoredMessage) -> Delivery {
    Delivery {
        delivery_tag: tag,
        exchange: msg.exchange.clone(),
        routing_key: msg.routing_key.clone(),
        redelivered: false,
        properties: msg.properties.clone(),
        body: msg.body.clone(),
    }
}

/// In-process broker shared by every connection it hands out.
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    reachable: AtomicBool,
    next_channel_id: Arc<AtomicU64>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        MemoryBroker {
            state: Arc::new(Mutex::new(BrokerState::default())),
            reachable: AtomicBool::new(true),
            next_channel_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl MemoryBroker {
    /// An empty, reachable broker.
    pub fn new() -> Arc<MemoryBroker> {
        Arc::new(MemoryBroker::default())
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes subsequent connection attempts fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Marks every open connection as dropped by the broker. Their consumers
    /// are removed and their delivery streams end.
    pub fn drop_connections(&self) {
        let mut state = self.state();

        for conn in state.connections.iter() {
            conn.store(false, Ordering::SeqCst);
        }
        for q in state.queues.values_mut() {
            q.consumers.retain(|c| c.connection.load(Ordering::SeqCst));
        }
    }

    /// Connections handed out so far, dropped ones included.
    pub fn connections_opened(&self) -> usize {
        self.state().connections.len()
    }

    pub fn channels_opened(&self) -> usize {
        self.state().channels_opened
    }

    pub fn queue_declarations(&self, queue: &str) -> usize {
        self.state()
            .queue_declarations
            .get(queue)
            .copied()
            .unwrap_or_default()
    }

    pub fn exchange_declarations(&self, exchange: &str) -> usize {
        self.state()
            .exchange_declarations
            .get(exchange)
            .copied()
            .unwrap_or_default()
    }

    /// True when `queue` is bound to `exchange` with `routing_key`.
    pub fn has_binding(&self, exchange: &str, queue: &str, routing_key: &str) -> bool {
        self.state().exchanges.get(exchange).is_some_and(|e| {
            e.bindings
                .iter()
                .any(|(q, k)| q == queue && k == routing_key)
        })
    }

    /// Messages waiting in `queue` that were not handed to any consumer.
    pub fn message_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    /// Every ack attempt in order, including rejected ones.
    pub fn acks(&self) -> Vec<u64> {
        self.state().acks.clone()
    }

    /// Ack attempts for one delivery tag.
    pub fn ack_count(&self, delivery_tag: u64) -> usize {
        self.state()
            .acks
            .iter()
            .filter(|tag| **tag == delivery_tag)
            .count()
    }

    /// Deliveries handed out and not acknowledged yet.
    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    pub fn prefetch_settings(&self) -> Vec<u16> {
        self.state().prefetch.clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(
        &self,
        _config: &RabbitMQConfig,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(AmqpError::ConnectionError);
        }

        let open = Arc::new(AtomicBool::new(true));
        self.state().connections.push(open.clone());
        debug!("memory connection opened");

        Ok(Arc::new(MemoryConnection {
            state: self.state.clone(),
            open,
            next_channel_id: self.next_channel_id.clone(),
        }))
    }
}

/// Connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
    open: Arc<AtomicBool>,
    next_channel_id: Arc<AtomicU64>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.is_connected() {
            return Err(AmqpError::ChannelError);
        }

        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .channels_opened += 1;

        Ok(Arc::new(MemoryChannel {
            id: self.next_channel_id.fetch_add(1, Ordering::SeqCst),
            state: self.state.clone(),
            connection: self.open.clone(),
            open: AtomicBool::new(true),
        }))
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Channel of a [`MemoryConnection`].
pub struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    connection: Arc<AtomicBool>,
    open: AtomicBool,
}

impl MemoryChannel {
    /// Locks the broker state if this channel and its connection are usable.
    fn state(&self) -> Result<MutexGuard<'_, BrokerState>, AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::ChannelError);
        }
        Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.state()?;

        state.exchanges.entry(def.name().to_owned()).or_default();
        *state
            .exchange_declarations
            .entry(def.name().to_owned())
            .or_default() += 1;
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        let mut state = self.state()?;

        state.queues.entry(def.name().to_owned()).or_default();
        *state
            .queue_declarations
            .entry(def.name().to_owned())
            .or_default() += 1;

        Ok(def.name().to_owned())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.state()?;

        let failure = || {
            AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue().to_owned(),
            )
        };

        if !state.queues.contains_key(binding.queue()) {
            return Err(failure());
        }

        let exch = state
            .exchanges
            .get_mut(binding.exchange_name())
            .ok_or_else(failure)?;

        let entry = (binding.queue().to_owned(), binding.key().to_owned());
        if !exch.bindings.contains(&entry) {
            exch.bindings.push(entry);
        }
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.state()?.prefetch.push(prefetch_count);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        let mut state = self.state()?;

        let msg = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            body: body.to_vec(),
        };

        let targets = state.route(exchange, routing_key)?;
        if targets.is_empty() {
            debug!(exchange, routing_key, "message was unroutable and dropped");
        }

        for queue in targets {
            state.enqueue(&queue, msg.clone());
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.state()?;
        let (sender, receiver) = mpsc::unbounded_channel();

        let BrokerState {
            queues,
            unacked,
            next_tag,
            ..
        } = &mut *state;

        let q = queues
            .get_mut(queue)
            .ok_or_else(|| AmqpError::BindingConsumerError(queue.to_owned()))?;

        for msg in q.messages.drain(..) {
            *next_tag += 1;
            unacked.insert(*next_tag, queue.to_owned());
            // the receiver is alive, it is returned below
            let _ = sender.send(Ok(to_delivery(*next_tag, &msg)));
        }

        q.consumers.push(MemoryConsumer {
            tag: consumer_tag.to_owned(),
            channel_id: self.id,
            connection: self.connection.clone(),
            sender,
        });

        Ok(stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.state()?;

        let mut found = false;
        for q in state.queues.values_mut() {
            let before = q.consumers.len();
            q.consumers.retain(|c| c.tag != consumer_tag);
            found |= q.consumers.len() != before;
        }

        if found {
            Ok(())
        } else {
            Err(AmqpError::CancelConsumerError(consumer_tag.to_owned()))
        }
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, AmqpError> {
        let mut state = self.state()?;

        if !state.queues.contains_key(queue) {
            return Err(AmqpError::GetMessageError(queue.to_owned()));
        }
        Ok(state.take(queue))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.state()?;

        state.acks.push(delivery_tag);
        match state.unacked.remove(&delivery_tag) {
            Some(_) => Ok(()),
            None => Err(AmqpError::AckMessageError),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drop_consumers(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let conn = broker.connect(&RabbitMQConfig::default()).await.unwrap();
        conn.open_channel().await.unwrap()
    }

    #[tokio::test]
    async fn direct_exchange_routes_by_key() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;

        ch.declare_exchange(&ExchangeDefinition::new("E1")).await.unwrap();
        ch.declare_queue(&QueueDefinition::new("Q1")).await.unwrap();
        ch.bind_queue(&QueueBinding::new("Q1").exchange("E1").routing_key("Q1"))
            .await
            .unwrap();

        ch.publish("E1", "Q1", MessageProperties::json(), b"a")
            .await
            .unwrap();
        ch.publish("E1", "other", MessageProperties::json(), b"b")
            .await
            .unwrap();

        assert_eq!(broker.message_count("Q1"), 1);
        let delivery = ch.get("Q1").await.unwrap().unwrap();
        assert_eq!(delivery.body, b"a".to_vec());
        assert!(ch.get("Q1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn double_ack_is_rejected() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_queue(&QueueDefinition::new("Q")).await.unwrap();
        ch.publish("", "Q", MessageProperties::json(), b"x")
            .await
            .unwrap();

        let delivery = ch.get("Q").await.unwrap().unwrap();
        ch.ack(delivery.delivery_tag).await.unwrap();

        assert_eq!(
            ch.ack(delivery.delivery_tag).await,
            Err(AmqpError::AckMessageError)
        );
        assert_eq!(broker.ack_count(delivery.delivery_tag), 2);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn consumers_receive_backlog_then_live_messages() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_queue(&QueueDefinition::new("Q")).await.unwrap();
        ch.publish("", "Q", MessageProperties::json(), b"1")
            .await
            .unwrap();

        let mut stream = ch.consume("Q", "c1").await.unwrap();
        ch.publish("", "Q", MessageProperties::json(), b"2")
            .await
            .unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap().body, b"1".to_vec());
        assert_eq!(stream.next().await.unwrap().unwrap().body, b"2".to_vec());

        ch.cancel("c1").await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn dropped_connection_closes_its_channels() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        assert!(ch.is_open());

        ch.declare_queue(&QueueDefinition::new("Q")).await.unwrap();
        let mut stream = ch.consume("Q", "c1").await.unwrap();

        broker.drop_connections();

        assert!(!ch.is_open());
        assert_eq!(ch.get("Q").await, Err(AmqpError::ChannelError));
        assert!(stream.next().await.is_none());
        assert_eq!(broker.consumer_count("Q"), 0);
    }

    #[tokio::test]
    async fn closed_channel_rejects_operations() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.close().await.unwrap();

        assert!(!ch.is_open());
        assert_eq!(
            ch.declare_queue(&QueueDefinition::new("Q")).await,
            Err(AmqpError::ChannelError)
        );
    }
}
