// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Sends JSON payloads to an exchange. The queue behind the routing key is
//! declared and bound on first use, so a message published before any
//! subscriber exists is kept by the broker. Outgoing messages carry the
//! caller's OpenTelemetry context in their headers.

use crate::{
    codec,
    errors::AmqpError,
    otel,
    pool::ChannelPool,
    routing::RoutingRegistry,
    transport::MessageProperties,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Publishes messages through the client's channel pool.
#[derive(Clone)]
pub struct Publisher {
    pool: Arc<ChannelPool>,
    registry: Arc<RoutingRegistry>,
}

impl Publisher {
    /// Creates a publisher.
    ///
    /// # Parameters
    /// * `pool` - Channel pool shared with the other components
    /// * `registry` - Type routing used by [`Publisher::publish_message`]
    pub fn new(pool: Arc<ChannelPool>, registry: Arc<RoutingRegistry>) -> Self {
        Publisher { pool, registry }
    }

    /// Publishes `body` to `exchange` with `routing_key`.
    ///
    /// `queue` is declared and bound to the exchange with `routing_key` if this
    /// client has not touched it yet. With `persistent`, both the queue and the
    /// message are durable.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange, trimmed; empty for the default exchange
    /// * `queue` - Queue that should receive the message
    /// * `routing_key` - Routing key the queue is bound with
    /// * `body` - Raw payload, sent as `application/json`
    /// * `persistent` - Durable queue and exchange, persistent message
    ///
    /// # Returns
    /// `Ok(())` once the broker accepted the message
    pub async fn publish(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
        body: &[u8],
        persistent: bool,
    ) -> Result<(), AmqpError> {
        let channel = self
            .pool
            .bound_channel(exchange, queue, routing_key, persistent)
            .await?;

        let properties = MessageProperties::json()
            .with_message_id(Uuid::new_v4().to_string())
            .with_persistent(persistent)
            .with_headers(otel::current_context_headers());

        channel
            .publish(exchange.trim(), routing_key, properties, body)
            .await?;

        debug!(exchange, routing_key, persistent, "message published");
        Ok(())
    }

    /// Publishes `message` using the routing registered for its type.
    ///
    /// The routing key is the queue name and persistence follows the
    /// registered durability.
    pub async fn publish_message<T>(&self, message: &T) -> Result<(), AmqpError>
    where
        T: Serialize + 'static,
    {
        let route = self.registry.resolve::<T>()?;
        let body = codec::encode(message)?;

        self.publish(
            route.exchange(),
            route.queue(),
            route.routing_key(),
            &body,
            route.durable(),
        )
        .await
    }
}
