// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request/Reply
//!
//! [`RpcClient`] publishes a request carrying a fresh correlation id and a
//! reply queue, then waits for the reply bearing the same id. [`RpcServer`]
//! consumes requests, runs a handler and always replies and acknowledges.

mod client;
mod pending;
mod server;

pub use client::{RpcClient, REPLY_QUEUE_PREFIX};
pub use pending::RpcCallState;
pub use server::RpcServer;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RabbitMQConfig,
        connection::ConnectionManager,
        errors::{AmqpError, HandlerError},
        failure::LogFailureHook,
        pool::ChannelPool,
        routing::{RoutingMetadata, RoutingRegistry},
        transport::{memory::MemoryBroker, MessageProperties},
    };
    use serde::{Deserialize, Serialize};
    use std::{sync::Arc, time::Duration};
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Add {
        a: i64,
        b: i64,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sum {
        value: i64,
    }

    fn pool(broker: Arc<MemoryBroker>) -> Arc<ChannelPool> {
        Arc::new(ChannelPool::new(Arc::new(ConnectionManager::new(
            broker,
            RabbitMQConfig::default(),
        ))))
    }

    fn registry() -> Arc<RoutingRegistry> {
        Arc::new(RoutingRegistry::new().register::<Add>(RoutingMetadata::new("math", "math.add", false)))
    }

    #[tokio::test]
    async fn typed_calls_decode_typed_replies() {
        let broker = MemoryBroker::new();
        let pool = pool(broker.clone());
        let server = RpcServer::new(pool.clone(), registry(), Arc::new(LogFailureHook));
        let client = RpcClient::new(pool.clone(), registry());

        server
            .serve_message(|req: Add| async move { Ok(Sum { value: req.a + req.b }) })
            .await
            .unwrap();

        let sum: Sum = client.call_message(&Add { a: 2, b: 3 }).await.unwrap();

        assert_eq!(sum, Sum { value: 5 });
        assert_eq!(client.pending_calls(), 0);
        assert!(broker.has_binding("math", "math.add", "math.add"));
    }

    #[tokio::test]
    async fn default_timeout_comes_from_config() {
        let broker = MemoryBroker::new();
        let config = RabbitMQConfig {
            rpc_timeout_ms: 1234,
            ..Default::default()
        };
        let pool = Arc::new(ChannelPool::new(Arc::new(ConnectionManager::new(broker, config))));

        let client = RpcClient::new(pool, registry());

        assert_eq!(client.default_timeout(), Duration::from_millis(1234));
        assert!(client.reply_queue().starts_with(REPLY_QUEUE_PREFIX));
    }

    #[tokio::test]
    async fn cancelled_calls_are_forgotten() {
        let broker = MemoryBroker::new();
        let client = RpcClient::new(pool(broker), registry());
        let token = CancellationToken::new();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel();
            })
        };

        let result = client
            .call_with_cancel("math", "nobody", "nobody", b"{}", false, Duration::from_secs(10), &token)
            .await;
        canceller.await.unwrap();

        assert!(matches!(result, Err(AmqpError::RpcCancelled(_))));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn dropped_calls_are_forgotten() {
        let broker = MemoryBroker::new();
        let client = RpcClient::new(pool(broker), registry());

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            client.call("math", "nobody", "nobody", b"{}", false, Duration::from_secs(10)),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn close_fails_waiting_calls_and_later_calls_restart_the_dispatcher() {
        let broker = MemoryBroker::new();
        let pool = pool(broker.clone());
        let client = RpcClient::new(pool.clone(), registry());

        let (waiting, closed) = tokio::join!(
            client.call("math", "nobody", "nobody", b"{}", false, Duration::from_secs(10)),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                client.close().await
            }
        );

        closed.unwrap();
        assert!(matches!(waiting, Err(AmqpError::ConsumerError(_))));
        assert_eq!(client.pending_calls(), 0);

        RpcServer::new(pool, registry(), Arc::new(LogFailureHook))
            .serve_message(|req: Add| async move { Ok(Sum { value: req.a * req.b }) })
            .await
            .unwrap();

        let product: Sum = client.call_message(&Add { a: 4, b: 5 }).await.unwrap();
        assert_eq!(product, Sum { value: 20 });
        assert_eq!(broker.consumer_count(client.reply_queue()), 1);
    }

    #[tokio::test]
    async fn requests_without_reply_to_are_only_acknowledged() {
        let broker = MemoryBroker::new();
        let pool = pool(broker.clone());
        let server = RpcServer::new(pool.clone(), registry(), Arc::new(LogFailureHook));

        server
            .serve("math", "math.add", false, |req: Add| async move {
                if req.a < 0 {
                    return Err(HandlerError::failed("negative"));
                }
                Ok(Sum { value: req.a + req.b })
            })
            .await
            .unwrap();

        pool.bound_channel("math", "math.add", "math.add", false)
            .await
            .unwrap()
            .publish("math", "math.add", MessageProperties::json(), br#"{"a":1,"b":1}"#)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.acks().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(broker.acks().len(), 1);
        assert_eq!(broker.unacked_count(), 0);
    }
}
