// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Pool
//!
//! One channel per queue name, created on first use and kept for the lifetime of
//! the client. Creation is guarded per queue name: concurrent first callers for
//! the same queue wait on a single initialisation while other queues proceed.
//! Every operation on a pooled channel takes that channel's own lock, so calls
//! for one queue never interleave on the wire.
//!
//! The first caller for a queue decides how the queue itself is declared. Later
//! callers asking for a binding the channel has not installed yet get it
//! declared on the existing channel.
//!
//! A pooled channel whose connection went away is evicted on its next lookup
//! and rebuilt, with its topology, over the recovered connection.

use crate::{
    connection::ConnectionManager,
    errors::AmqpError,
    queue::{queue_name, QueueBinding, QueueDefinition},
    topology::Topology,
    transport::{BrokerChannel, Delivery, DeliveryStream, MessageProperties},
};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, warn};

/// At most one unacknowledged delivery per consumer.
pub const FAIR_DISPATCH_PREFETCH: u16 = 1;

/// A channel dedicated to one queue.
pub struct PooledChannel {
    queue: String,
    channel: Arc<dyn BrokerChannel>,
    serial: Mutex<()>,
    bindings: Mutex<HashSet<(String, String)>>,
}

impl PooledChannel {
    fn new(queue: String, channel: Arc<dyn BrokerChannel>, topology: &Topology) -> Self {
        PooledChannel {
            queue,
            channel,
            serial: Mutex::new(()),
            bindings: Mutex::new(binding_keys(topology).collect()),
        }
    }

    /// The queue this channel is dedicated to.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// True while the channel and its connection are usable.
    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Publishes one message.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange, empty for the default exchange
    /// * `routing_key` - Routing key of the message
    /// * `properties` - Message properties
    /// * `body` - Raw payload
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        let _guard = self.serial.lock().await;
        self.channel
            .publish(exchange, routing_key, properties, body)
            .await
    }

    /// Starts a consumer on this channel's queue.
    pub async fn consume(&self, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let _guard = self.serial.lock().await;
        self.channel.consume(&self.queue, consumer_tag).await
    }

    /// Cancels the consumer registered under `consumer_tag`.
    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let _guard = self.serial.lock().await;
        self.channel.cancel(consumer_tag).await
    }

    /// Fetches one message from this channel's queue.
    pub async fn get(&self) -> Result<Option<Delivery>, AmqpError> {
        let _guard = self.serial.lock().await;
        self.channel.get(&self.queue).await
    }

    /// Acknowledges one delivery received on this channel.
    ///
    /// # Parameters
    /// * `delivery_tag` - Tag of the delivery, only meaningful on this channel
    pub async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let _guard = self.serial.lock().await;
        self.channel.ack(delivery_tag).await
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let _guard = self.serial.lock().await;
        self.channel.close().await
    }

    /// Installs the exchanges and bindings of `topology` missing on this channel.
    async fn extend(&self, topology: &Topology) -> Result<(), AmqpError> {
        let mut installed = self.bindings.lock().await;

        let missing: Vec<_> = topology
            .queues_binding
            .iter()
            .filter(|b| !b.exchange_name().is_empty())
            .filter(|b| !installed.contains(&binding_key(b)))
            .cloned()
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        debug!(queue = self.queue, "installing new bindings on pooled channel");

        let extra = Topology {
            exchanges: topology.exchanges.clone(),
            queues: vec![],
            queues_binding: missing,
        };

        let _guard = self.serial.lock().await;
        extra.install(self.channel.as_ref()).await?;
        installed.extend(binding_keys(&extra));

        Ok(())
    }
}

fn binding_key(binding: &QueueBinding) -> (String, String) {
    (binding.exchange_name().to_owned(), binding.key().to_owned())
}

fn binding_keys(topology: &Topology) -> impl Iterator<Item = (String, String)> + '_ {
    topology
        .queues_binding
        .iter()
        .filter(|b| !b.exchange_name().is_empty())
        .map(binding_key)
}

/// Queue-name keyed cache of channels over the shared connection.
pub struct ChannelPool {
    connection: Arc<ConnectionManager>,
    channels: Mutex<HashMap<String, Arc<OnceCell<Arc<PooledChannel>>>>>,
}

impl ChannelPool {
    /// Creates an empty pool over the shared connection.
    ///
    /// # Parameters
    /// * `connection` - Manager of the connection every channel is opened on
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        ChannelPool {
            connection,
            channels: Mutex::new(HashMap::default()),
        }
    }

    /// The connection manager the channels are opened from.
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Channel for consuming `queue`: declares the queue and enables fair dispatch.
    pub async fn channel(&self, queue: &str, durable: bool) -> Result<Arc<PooledChannel>, AmqpError> {
        let queue = queue_name(queue);
        let topology = Topology::new().queue(QueueDefinition::new(&queue).with_durable(durable));

        self.get_or_create(queue, topology, Some(FAIR_DISPATCH_PREFETCH))
            .await
    }

    /// Channel for `queue` bound to `exchange` with `routing_key`.
    pub async fn bound_channel(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
        durable: bool,
    ) -> Result<Arc<PooledChannel>, AmqpError> {
        let queue = queue_name(queue);
        let topology = Topology::bound(exchange, &queue, routing_key, durable);

        self.get_or_create(queue, topology, None).await
    }

    /// Channel for a private reply queue, removed by the broker when the
    /// connection goes away.
    pub async fn reply_channel(&self, queue: &str) -> Result<Arc<PooledChannel>, AmqpError> {
        let queue = queue_name(queue);
        let topology = Topology::new().queue(QueueDefinition::new(&queue).exclusive().delete());

        self.get_or_create(queue, topology, None).await
    }

    async fn get_or_create(
        &self,
        queue: String,
        topology: Topology,
        prefetch: Option<u16>,
    ) -> Result<Arc<PooledChannel>, AmqpError> {
        let cell = self
            .channels
            .lock()
            .await
            .entry(queue.clone())
            .or_default()
            .clone();

        let mut channel = cell
            .get_or_try_init(|| self.create(&queue, &topology, prefetch))
            .await?
            .clone();

        if !channel.is_open() {
            warn!(queue = %queue, "pooled channel is closed, rebuilding it");
            let cell = self.evict(&queue, &cell).await;
            channel = cell
                .get_or_try_init(|| self.create(&queue, &topology, prefetch))
                .await?
                .clone();
        }

        channel.extend(&topology).await?;
        Ok(channel)
    }

    /// Replaces `stale` with an empty slot, unless a concurrent caller already
    /// did, and returns the slot now in the pool.
    async fn evict(
        &self,
        queue: &str,
        stale: &Arc<OnceCell<Arc<PooledChannel>>>,
    ) -> Arc<OnceCell<Arc<PooledChannel>>> {
        let mut channels = self.channels.lock().await;
        let slot = channels.entry(queue.to_owned()).or_default();

        if Arc::ptr_eq(slot, stale) {
            *slot = Arc::default();
        }
        slot.clone()
    }

    async fn create(
        &self,
        queue: &str,
        topology: &Topology,
        prefetch: Option<u16>,
    ) -> Result<Arc<PooledChannel>, AmqpError> {
        debug!(queue, "creating pooled channel");

        let conn = self.connection.connect().await?;
        let channel = conn.open_channel().await?;

        topology.install(channel.as_ref()).await?;

        if let Some(prefetch) = prefetch {
            channel.qos(prefetch).await?;
        }

        Ok(Arc::new(PooledChannel::new(queue.to_owned(), channel, topology)))
    }

    /// Number of channels created so far.
    pub async fn len(&self) -> usize {
        self.channels
            .lock()
            .await
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Closes every pooled channel and empties the pool.
    ///
    /// All channels are visited; the first close failure is returned.
    pub async fn close_all(&self) -> Result<(), AmqpError> {
        let cells: Vec<_> = self.channels.lock().await.drain().collect();
        let mut result = Ok(());

        for (queue, cell) in cells {
            let Some(channel) = cell.get() else {
                continue;
            };

            debug!(queue = %queue, "closing pooled channel");
            if let Err(err) = channel.close().await {
                error!(error = err.to_string(), queue = %queue, "failure to close channel");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        result
    }
}
