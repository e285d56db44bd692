// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges are the routing mechanism in RabbitMQ that determine how messages are
//! distributed to queues. The wrapper routes every message by exact routing key,
//! so all the exchanges it declares are direct exchanges.

/// Name of the broker's default exchange, which routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Definition of a direct RabbitMQ exchange with its configuration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a new direct, non-durable exchange definition.
    ///
    /// The name is trimmed; a blank name designates the default exchange.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.trim().to_owned(),
            delete: false,
            durable: false,
        }
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Trimmed exchange name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The lapin kind used to declare this exchange.
    pub fn exchange_kind(&self) -> lapin::ExchangeKind {
        lapin::ExchangeKind::Direct
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    /// True for the broker's default exchange, which cannot be declared or bound.
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_EXCHANGE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_trimmed() {
        let def = ExchangeDefinition::new("  orders ").durable();

        assert_eq!(def.name(), "orders");
        assert!(def.is_durable());
        assert_eq!(def.exchange_kind(), lapin::ExchangeKind::Direct);
        assert!(!def.is_default());
    }

    #[test]
    fn blank_name_is_the_default_exchange() {
        assert!(ExchangeDefinition::new("   ").is_default());
    }
}
