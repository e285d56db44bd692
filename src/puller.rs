// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Puller
//!
//! On-demand consumption: one non-blocking fetch per call. An empty queue is
//! not an error, the handler is simply not invoked.

use crate::{
    consumer,
    errors::AmqpError,
    failure::FailureHook,
    handler::MessageHandler,
    pool::{ChannelPool, PooledChannel},
    routing::RoutingRegistry,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

/// Fetches single messages on demand.
#[derive(Clone)]
pub struct Puller {
    pool: Arc<ChannelPool>,
    registry: Arc<RoutingRegistry>,
    hook: Arc<dyn FailureHook>,
}

impl Puller {
    /// Creates a puller.
    ///
    /// # Parameters
    /// * `pool` - Channel pool shared with the other components
    /// * `registry` - Type routing used by [`Puller::pull_message`]
    /// * `hook` - Told about handler failures
    pub fn new(
        pool: Arc<ChannelPool>,
        registry: Arc<RoutingRegistry>,
        hook: Arc<dyn FailureHook>,
    ) -> Self {
        Puller {
            pool,
            registry,
            hook,
        }
    }

    /// Fetches at most one message from `queue`.
    ///
    /// Returns `Ok(false)` when the queue was empty. A fetched message is
    /// acknowledged whatever the handler outcome, and `Ok(true)` is returned
    /// even when the handler failed.
    ///
    /// # Parameters
    /// * `queue` - Queue to fetch from
    /// * `durable` - Declare the queue durable on first use
    /// * `handler` - Invoked with the decoded message
    pub async fn pull<T, H>(&self, queue: &str, durable: bool, handler: H) -> Result<bool, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        let channel = self.pool.channel(queue, durable).await?;
        self.pull_from::<T, H>(&channel, &handler).await
    }

    /// Fetches at most one message from the queue registered for `T`,
    /// declaring and binding it to the registered exchange on first use.
    pub async fn pull_message<T, H>(&self, handler: H) -> Result<bool, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        let route = self.registry.resolve::<T>()?;
        let channel = self
            .pool
            .bound_channel(
                route.exchange(),
                route.queue(),
                route.routing_key(),
                route.durable(),
            )
            .await?;

        self.pull_from::<T, H>(&channel, &handler).await
    }

    async fn pull_from<T, H>(&self, channel: &PooledChannel, handler: &H) -> Result<bool, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        let Some(delivery) = channel.get().await? else {
            debug!(queue = channel.queue(), "queue is empty");
            return Ok(false);
        };

        consumer::consume::<T, H>(channel, &delivery, handler, self.hook.as_ref()).await?;
        Ok(true)
    }
}
