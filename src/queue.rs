// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Builders for queue declarations and queue-to-exchange bindings.

/// Name used in place of an empty or blank queue name.
pub const UNDEFINED_QUEUE_NAME: &str = "UndefinedQueueName";

/// Normalizes a queue name: trims it and maps blank names to a placeholder.
pub fn queue_name(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        UNDEFINED_QUEUE_NAME.to_owned()
    } else {
        name.to_owned()
    }
}

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
}

impl QueueDefinition {
    /// Creates a new non-durable, non-exclusive queue definition.
    ///
    /// The name goes through [`queue_name`], so blank names never reach the broker.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: queue_name(name),
            durable: false,
            delete: false,
            exclusive: false,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets durability from a flag.
    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Normalized queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key start empty.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue_name(queue),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind to.
    ///
    /// # Parameters
    /// * `exchange` - Exchange name, trimmed
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.trim().to_owned();
        self
    }

    /// Sets the binding key.
    ///
    /// # Parameters
    /// * `key` - Routing key matched by the direct exchange
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue_name
    }

    /// Exchange the queue is bound to; empty until set.
    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}
