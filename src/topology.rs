// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Declaration
//!
//! Declares exchanges, queues and the bindings between them on a channel.
//! Declarations are idempotent on the broker side, so installing the same
//! topology twice is harmless. The default exchange is never declared or bound.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::BrokerChannel,
};
use tracing::debug;

/// A set of exchanges, queues and bindings to install on a channel.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl Topology {
    /// An empty topology.
    pub fn new() -> Self {
        Topology::default()
    }

    /// The exchange/queue/binding triple behind a bound channel.
    pub fn bound(exchange: &str, queue: &str, routing_key: &str, durable: bool) -> Self {
        let mut exch = ExchangeDefinition::new(exchange);
        if durable {
            exch = exch.durable();
        }

        Topology::new()
            .exchange(exch)
            .queue(QueueDefinition::new(queue).with_durable(durable))
            .queue_binding(QueueBinding::new(queue).exchange(exchange).routing_key(routing_key))
    }

    /// Adds an exchange to declare.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue to declare.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a binding, installed after every exchange and queue.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs exchanges, then queues, then bindings.
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        self.install_exchange(channel).await?;
        self.install_queue(channel).await?;
        self.binding_queues(channel).await
    }

    async fn install_exchange(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for exch in self.exchanges.iter().filter(|e| !e.is_default()) {
            debug!("creating exchange: {}", exch.name());
            channel.declare_exchange(exch).await?;
            debug!("exchange: {} was created", exch.name());
        }

        Ok(())
    }

    async fn install_queue(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name());
            channel.declare_queue(def).await?;
            debug!("queue: {} was created", def.name());
        }

        Ok(())
    }

    async fn binding_queues(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for binding in self
            .queues_binding
            .iter()
            .filter(|b| !b.exchange_name().is_empty())
        {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue(),
                binding.exchange_name(),
                binding.key()
            );
            channel.bind_queue(binding).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockBrokerChannel;
    use mockall::Sequence;

    #[tokio::test]
    async fn installs_in_dependency_order() {
        let mut channel = MockBrokerChannel::new();
        let mut seq = Sequence::new();

        channel
            .expect_declare_exchange()
            .withf(|def| def.name() == "E1" && def.is_durable())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|def| def.name() == "Q1" && def.is_durable())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|def| Ok(def.name().to_owned()));
        channel
            .expect_bind_queue()
            .withf(|b| b.queue() == "Q1" && b.exchange_name() == "E1" && b.key() == "Q1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        Topology::bound("E1", "Q1", "Q1", true)
            .install(&channel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn default_exchange_is_skipped() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_declare_exchange().never();
        channel.expect_bind_queue().never();
        channel
            .expect_declare_queue()
            .times(1)
            .returning(|def| Ok(def.name().to_owned()));

        Topology::bound("", "Q1", "Q1", false)
            .install(&channel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn declaration_errors_stop_the_install() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_exchange()
            .returning(|def| Err(AmqpError::DeclareExchangeError(def.name().to_owned())));
        channel.expect_declare_queue().never();

        let result = Topology::bound("E1", "Q1", "Q1", false).install(&channel).await;

        assert_eq!(result, Err(AmqpError::DeclareExchangeError("E1".to_owned())));
    }
}
