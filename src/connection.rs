// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Management
//!
//! Owns the single broker connection of a client. The connection is created on
//! first use, shared by every channel the client opens, and closed on dispose.

use crate::{
    config::RabbitMQConfig,
    errors::AmqpError,
    transport::{Broker, BrokerConnection},
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Lazily creates and caches the client's broker connection.
///
/// Creation runs under an async mutex so concurrent first callers all end up
/// with the same connection. A failed attempt caches nothing.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    config: RabbitMQConfig,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
}

impl ConnectionManager {
    /// Creates a manager; no connection is opened yet.
    ///
    /// # Parameters
    /// * `broker` - Transport used to connect
    /// * `config` - Connection parameters, recovery settings included
    pub fn new(broker: Arc<dyn Broker>, config: RabbitMQConfig) -> Self {
        ConnectionManager {
            broker,
            config,
            connection: Mutex::new(None),
        }
    }

    /// Connection parameters.
    pub fn config(&self) -> &RabbitMQConfig {
        &self.config
    }

    /// Returns the shared connection, connecting if there is none yet.
    ///
    /// With automatic recovery enabled, a connection the broker dropped is
    /// replaced after waiting the recovery interval.
    pub async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut slot = self.connection.lock().await;

        if let Some(conn) = slot.as_ref() {
            if conn.is_connected() || !self.config.automatic_recovery {
                return Ok(conn.clone());
            }

            warn!(
                host = %self.config.host,
                interval_ms = self.config.recovery_interval_ms,
                "connection lost, recovering"
            );
            *slot = None;
            tokio::time::sleep(self.config.recovery_interval()).await;
        }

        let conn = self.broker.connect(&self.config).await.map_err(|err| {
            error!(error = err.to_string(), "failure to establish the shared connection");
            AmqpError::ConnectionError
        })?;

        debug!(host = %self.config.host, vhost = self.config.vhost(), "shared connection ready");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// True when a connection is cached and open.
    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|conn| conn.is_connected())
    }

    /// Closes and forgets the shared connection; the next `connect` reconnects.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let Some(conn) = self.connection.lock().await.take() else {
            return Ok(());
        };

        debug!("closing shared connection");
        conn.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockBroker, MockBrokerConnection};
    use std::time::Duration;

    fn connection(connected: bool) -> Arc<dyn BrokerConnection> {
        let mut conn = MockBrokerConnection::new();
        conn.expect_is_connected().return_const(connected);
        conn.expect_close().returning(|| Ok(()));
        Arc::new(conn)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_connection() {
        let mut broker = MockBroker::new();
        broker
            .expect_connect()
            .times(1)
            .returning(|_| Ok(connection(true)));

        let manager = Arc::new(ConnectionManager::new(
            Arc::new(broker),
            RabbitMQConfig::default(),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.connect().await.unwrap() })
            })
            .collect();

        let mut conns = vec![];
        for handle in handles {
            conns.push(handle.await.unwrap());
        }

        assert!(conns.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn failed_connect_is_not_cached() {
        let mut broker = MockBroker::new();
        let mut seq = mockall::Sequence::new();
        broker
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(AmqpError::ConnectionError));
        broker
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(connection(true)));

        let manager = ConnectionManager::new(Arc::new(broker), RabbitMQConfig::default());

        assert_eq!(manager.connect().await.err(), Some(AmqpError::ConnectionError));
        assert!(!manager.is_connected().await);
        assert!(manager.connect().await.is_ok());
        assert!(manager.is_connected().await);
    }

    #[tokio::test]
    async fn dead_connection_is_recovered() {
        let mut broker = MockBroker::new();
        let mut seq = mockall::Sequence::new();
        broker
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(connection(false)));
        broker
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(connection(true)));

        let config = RabbitMQConfig {
            recovery_interval_ms: 10,
            ..Default::default()
        };
        let manager = ConnectionManager::new(Arc::new(broker), config);

        let first = manager.connect().await.unwrap();
        let second = manager.connect().await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_connected());
    }

    #[tokio::test]
    async fn dead_connection_is_kept_without_recovery() {
        let mut broker = MockBroker::new();
        broker
            .expect_connect()
            .times(1)
            .returning(|_| Ok(connection(false)));

        let config = RabbitMQConfig {
            automatic_recovery: false,
            ..Default::default()
        };
        let manager = ConnectionManager::new(Arc::new(broker), config);

        let first = manager.connect().await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), manager.connect())
            .await
            .unwrap()
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn close_allows_reconnect() {
        let mut broker = MockBroker::new();
        broker
            .expect_connect()
            .times(2)
            .returning(|_| Ok(connection(true)));

        let manager = ConnectionManager::new(Arc::new(broker), RabbitMQConfig::default());

        manager.connect().await.unwrap();
        manager.close().await.unwrap();
        assert!(!manager.is_connected().await);
        manager.connect().await.unwrap();
    }
}
