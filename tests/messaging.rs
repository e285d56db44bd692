// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use rabbitmq_wrapper::{
    errors::HandlerError,
    routing::{RoutedMessage, RoutingRegistry},
    transport::memory::MemoryBroker,
    AmqpError, RabbitMQClient, RabbitMQConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    id: u32,
    total: f64,
}

impl RoutedMessage for OrderPlaced {
    const EXCHANGE: &'static str = "orders";
    const QUEUE: &'static str = "orders.placed";
    const DURABLE: bool = true;
}

fn client(broker: &Arc<MemoryBroker>) -> RabbitMQClient {
    RabbitMQClient::new(broker.clone(), RabbitMQConfig::default())
        .with_registry(RoutingRegistry::new().register_routed::<OrderPlaced>())
}

async fn wait_for_acks(broker: &MemoryBroker, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while broker.acks().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("acknowledgments did not arrive in time");
}

#[tokio::test]
async fn published_ping_reaches_the_subscriber() {
    let broker = MemoryBroker::new();
    let client = client(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();

    client
        .publisher()
        .publish("E1", "Q1", "Q1", br#"{"op":"ping"}"#, false)
        .await
        .unwrap();

    client
        .subscriber()
        .subscribe("Q1", false, move |msg: Value| {
            let tx = tx.clone();
            async move { tx.send(msg).map_err(|err| HandlerError::failed(err.to_string())) }
        })
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(received, json!({"op": "ping"}));
    wait_for_acks(&broker, 1).await;
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn subscriber_first_then_exchange_publish() {
    let broker = MemoryBroker::new();
    let client = client(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();

    client
        .subscriber()
        .subscribe("Q1", false, move |msg: Value| {
            let tx = tx.clone();
            async move { tx.send(msg).map_err(|err| HandlerError::failed(err.to_string())) }
        })
        .await
        .unwrap();

    client
        .publisher()
        .publish("E1", "Q1", "Q1", br#"{"op":"ping"}"#, false)
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(received, json!({"op": "ping"}));
}

#[tokio::test]
async fn typed_messages_round_trip() {
    let broker = MemoryBroker::new();
    let client = client(&broker);
    let order = OrderPlaced { id: 7, total: 12.5 };

    client.publisher().publish_message(&order).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .subscriber()
        .subscribe_message(move |msg: OrderPlaced| {
            let tx = tx.clone();
            async move { tx.send(msg).map_err(|err| HandlerError::failed(err.to_string())) }
        })
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(received, order);
    assert!(broker.has_binding("orders", "orders.placed", "orders.placed"));
}

#[tokio::test]
async fn pull_on_empty_queue_returns_false() {
    let broker = MemoryBroker::new();
    let client = client(&broker);

    let pulled = client
        .puller()
        .pull("idle", false, |_: Value| async { Ok(()) })
        .await
        .unwrap();

    assert!(!pulled);
    assert!(broker.acks().is_empty());
}

#[tokio::test]
async fn pull_acknowledges_even_when_the_handler_fails() {
    let broker = MemoryBroker::new();
    let client = client(&broker);

    client.publisher().publish_message(&OrderPlaced { id: 1, total: 1.0 }).await.unwrap();

    let pulled = client
        .puller()
        .pull_message(|_: OrderPlaced| async { Err(HandlerError::failed("out of stock")) })
        .await
        .unwrap();

    assert!(pulled);
    assert_eq!(broker.acks().len(), 1);
    assert_eq!(broker.ack_count(broker.acks()[0]), 1);
    assert_eq!(broker.message_count("orders.placed"), 0);

    let again = client
        .puller()
        .pull_message(|_: OrderPlaced| async { Ok(()) })
        .await
        .unwrap();
    assert!(!again);
}

#[tokio::test]
async fn concurrent_first_use_shares_one_channel_per_queue() {
    let broker = MemoryBroker::new();
    let client = Arc::new(client(&broker));

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .publisher()
                    .publish("E1", "shared", "shared", format!("{i}").as_bytes(), false)
                    .await
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(broker.connections_opened(), 1);
    assert_eq!(broker.channels_opened(), 1);
    assert_eq!(broker.queue_declarations("shared"), 1);
    assert_eq!(broker.exchange_declarations("E1"), 1);
    assert_eq!(broker.message_count("shared"), 32);
}

#[tokio::test]
async fn unrouted_types_fail_before_touching_the_broker() {
    #[derive(Serialize, Deserialize)]
    struct Unrouted;

    let broker = MemoryBroker::new();
    let client = client(&broker);

    assert!(matches!(
        client.publisher().publish_message(&Unrouted).await,
        Err(AmqpError::RoutingNotConfigured(_))
    ));
    assert!(matches!(
        client.subscriber().subscribe_message(|_: Unrouted| async { Ok(()) }).await,
        Err(AmqpError::RoutingNotConfigured(_))
    ));
    assert!(matches!(
        client.puller().pull_message(|_: Unrouted| async { Ok(()) }).await,
        Err(AmqpError::RoutingNotConfigured(_))
    ));
    assert_eq!(broker.connections_opened(), 0);
}

#[tokio::test]
async fn dispose_closes_everything_and_allows_reconnect() {
    let broker = MemoryBroker::new();
    let client = client(&broker);

    let subscription = client
        .subscriber()
        .subscribe("Q1", false, |_: Value| async { Ok(()) })
        .await
        .unwrap();
    assert!(client.is_connected().await);

    client.dispose().await.unwrap();

    assert!(!client.is_connected().await);
    assert!(client.channels().is_empty().await);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !subscription.is_finished() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    client
        .publisher()
        .publish("E1", "Q1", "Q1", b"{}", false)
        .await
        .unwrap();

    assert!(client.is_connected().await);
    assert_eq!(broker.connections_opened(), 2);
}

#[tokio::test]
async fn unreachable_broker_is_retried_on_next_use() {
    let broker = MemoryBroker::new();
    let client = client(&broker);

    broker.set_reachable(false);
    assert_eq!(
        client.publisher().publish("E1", "Q1", "Q1", b"{}", false).await,
        Err(AmqpError::ConnectionError)
    );

    broker.set_reachable(true);
    client
        .publisher()
        .publish("E1", "Q1", "Q1", b"{}", false)
        .await
        .unwrap();
    assert_eq!(broker.message_count("Q1"), 1);
}

#[tokio::test]
async fn pooled_queues_recover_after_the_connection_drops() {
    let broker = MemoryBroker::new();
    let client = RabbitMQClient::new(
        broker.clone(),
        RabbitMQConfig {
            recovery_interval_ms: 10,
            ..Default::default()
        },
    );

    client
        .publisher()
        .publish("E1", "Q1", "Q1", b"{}", false)
        .await
        .unwrap();

    broker.drop_connections();

    for _ in 0..3 {
        client
            .publisher()
            .publish("E1", "Q1", "Q1", b"{}", false)
            .await
            .unwrap();
    }

    assert_eq!(broker.connections_opened(), 2);
    assert_eq!(broker.channels_opened(), 2);
    assert_eq!(broker.message_count("Q1"), 4);
}
