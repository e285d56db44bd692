// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! The capability the wrapper needs from a broker: connections that open
//! channels, and channels that declare topology, publish, consume, fetch and
//! acknowledge. [`amqp`] implements it on top of lapin; [`memory`] is an
//! in-process broker for tests and local development.

use crate::{
    config::RabbitMQConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc};

#[cfg(test)]
use mockall::automock;

pub mod amqp;
pub mod memory;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Message properties carried next to the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Delivery mode 2; survives a broker restart on a durable queue.
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    /// Properties for a JSON payload.
    pub fn json() -> Self {
        MessageProperties {
            content_type: Some(JSON_CONTENT_TYPE.to_owned()),
            ..Default::default()
        }
    }

    /// Sets the message id.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Sets the correlation id pairing a reply with its request.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Sets the queue replies should be sent to.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    /// Sets delivery mode 2 when `persistent`.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Replaces the application headers, e.g. propagated trace context.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// A message handed out by the broker, awaiting acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Stream of deliveries produced by a consumer; it ends when the consumer is
/// cancelled or its channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Entry point of a broker implementation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, config: &RabbitMQConfig)
        -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live session with the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A multiplexed session over a connection.
///
/// Implementations are not required to tolerate interleaved use from several
/// tasks; the channel pool serializes access per queue.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue and returns its name as known by the broker.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Limits unacknowledged deliveries per consumer on this channel.
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: &[u8],
    ) -> Result<(), AmqpError>;

    /// Starts a push consumer with manual acknowledgment.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Fetches one message without waiting; `None` when the queue is empty.
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// True while both the channel and its connection are usable.
    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}
