// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Routing Registry
//!
//! Maps message types to the exchange and queue they travel through. The
//! registry is filled once at startup and shared read-only by the publisher,
//! subscriber, puller and RPC components.

use crate::errors::AmqpError;
use std::{
    any::{type_name, TypeId},
    collections::HashMap,
};

/// Exchange, queue and durability of a message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingMetadata {
    exchange: String,
    queue: String,
    durable: bool,
}

impl RoutingMetadata {
    /// Creates routing metadata.
    ///
    /// # Parameters
    /// * `exchange` - Exchange the messages are published to
    /// * `queue` - Queue the messages land in, also used as routing key
    /// * `durable` - Durable queue and exchange, persistent messages
    pub fn new(exchange: &str, queue: &str, durable: bool) -> Self {
        RoutingMetadata {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            durable,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Type-routed messages use the queue name as routing key.
    pub fn routing_key(&self) -> &str {
        &self.queue
    }

    pub fn durable(&self) -> bool {
        self.durable
    }
}

/// Static routing declared on the message type itself.
///
/// ```ignore
/// impl RoutedMessage for OrderPlaced {
///     const EXCHANGE: &'static str = "orders";
///     const QUEUE: &'static str = "orders.placed";
///     const DURABLE: bool = true;
/// }
/// ```
pub trait RoutedMessage: 'static {
    const EXCHANGE: &'static str;
    const QUEUE: &'static str;
    const DURABLE: bool;
}

/// Type-to-routing lookup table.
#[derive(Debug, Clone, Default)]
pub struct RoutingRegistry {
    routes: HashMap<TypeId, RoutingMetadata>,
}

impl RoutingRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        RoutingRegistry::default()
    }

    /// Registers `T`, replacing any previous registration.
    pub fn register<T: 'static>(mut self, metadata: RoutingMetadata) -> Self {
        self.routes.insert(TypeId::of::<T>(), metadata);
        self
    }

    /// Registers a type carrying its own routing constants.
    pub fn register_routed<T: RoutedMessage>(self) -> Self {
        self.register::<T>(RoutingMetadata::new(T::EXCHANGE, T::QUEUE, T::DURABLE))
    }

    /// Returns the routing of `T`, or `RoutingNotConfigured` naming the type.
    pub fn resolve<T: 'static>(&self) -> Result<&RoutingMetadata, AmqpError> {
        self.routes
            .get(&TypeId::of::<T>())
            .ok_or_else(|| AmqpError::RoutingNotConfigured(type_name::<T>().to_owned()))
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
