// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Client
//!
//! Composition root of the wrapper. A client owns one connection manager, one
//! channel pool, the routing registry and the failure hook, and hands out the
//! publisher, subscriber, puller and RPC components that share them.
//!
//! ```ignore
//! let client = RabbitMQClient::amqp(RabbitMQConfig::load(None)?)
//!     .with_registry(RoutingRegistry::new().register_routed::<OrderPlaced>());
//!
//! client.publisher().publish_message(&order).await?;
//! client.dispose().await?;
//! ```

use crate::{
    config::RabbitMQConfig,
    connection::ConnectionManager,
    errors::AmqpError,
    failure::{FailureHook, LogFailureHook},
    pool::ChannelPool,
    publisher::Publisher,
    puller::Puller,
    routing::RoutingRegistry,
    rpc::{RpcClient, RpcServer},
    subscriber::Subscriber,
    transport::{amqp::AmqpBroker, Broker},
};
use std::sync::Arc;
use tracing::{debug, error};

/// Composition root of the wrapper.
///
/// Owns the shared connection, the channel pool, the routing registry and the
/// failure hook, and hands out the messaging components built on them.
pub struct RabbitMQClient {
    connection: Arc<ConnectionManager>,
    pool: Arc<ChannelPool>,
    registry: Arc<RoutingRegistry>,
    hook: Arc<dyn FailureHook>,
}

impl RabbitMQClient {
    /// Creates a client over `broker`. Nothing is opened until first use.
    ///
    /// # Parameters
    /// * `broker` - Transport implementation, [`crate::transport::amqp::AmqpBroker`] in production
    /// * `config` - Connection parameters
    ///
    /// # Returns
    /// A client with an empty routing registry and a [`LogFailureHook`]
    pub fn new(broker: Arc<dyn Broker>, config: RabbitMQConfig) -> Self {
        let connection = Arc::new(ConnectionManager::new(broker, config));
        let pool = Arc::new(ChannelPool::new(connection.clone()));

        RabbitMQClient {
            connection,
            pool,
            registry: Arc::new(RoutingRegistry::new()),
            hook: Arc::new(LogFailureHook),
        }
    }

    /// A client talking AMQP to the broker described by `config`.
    pub fn amqp(config: RabbitMQConfig) -> Self {
        RabbitMQClient::new(AmqpBroker::new(), config)
    }

    /// Sets the type routing used by the `*_message` operations.
    ///
    /// # Parameters
    /// * `registry` - Message type to exchange/queue table
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_registry(mut self, registry: RoutingRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Replaces the hook told about every failed handler invocation.
    ///
    /// # Parameters
    /// * `hook` - Receives the failed delivery and the handler error
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_failure_hook(mut self, hook: Arc<dyn FailureHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Connection parameters of this client.
    pub fn config(&self) -> &RabbitMQConfig {
        self.connection.config()
    }

    pub fn registry(&self) -> &RoutingRegistry {
        &self.registry
    }

    /// The per-queue channel pool.
    pub fn channels(&self) -> &Arc<ChannelPool> {
        &self.pool
    }

    /// Opens the shared connection now instead of on first use.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.connection.connect().await.map(|_| ())
    }

    /// True when the shared connection exists and is open.
    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    /// A publisher sharing this client's channels.
    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.pool.clone(), self.registry.clone())
    }

    /// A subscriber sharing this client's channels and failure hook.
    pub fn subscriber(&self) -> Subscriber {
        Subscriber::new(self.pool.clone(), self.registry.clone(), self.hook.clone())
    }

    /// A puller sharing this client's channels and failure hook.
    pub fn puller(&self) -> Puller {
        Puller::new(self.pool.clone(), self.registry.clone(), self.hook.clone())
    }

    /// A new RPC client with its own reply queue.
    pub fn rpc_client(&self) -> RpcClient {
        RpcClient::new(self.pool.clone(), self.registry.clone())
    }

    /// An RPC server sharing this client's channels and failure hook.
    pub fn rpc_server(&self) -> RpcServer {
        RpcServer::new(self.pool.clone(), self.registry.clone(), self.hook.clone())
    }

    /// Closes every pooled channel, then the shared connection.
    ///
    /// Running consumers stop and RPC calls waiting for a reply fail. The client
    /// stays usable: the next operation reconnects and recreates its channels,
    /// and existing RPC clients start a new reply dispatcher on their next call.
    pub async fn dispose(&self) -> Result<(), AmqpError> {
        debug!("disposing client");

        let channels = self.pool.close_all().await;
        let connection = self.connection.close().await;

        if let Err(err) = &connection {
            error!(error = err.to_string(), "failure to close the shared connection");
        }

        channels.and(connection)
    }
}
