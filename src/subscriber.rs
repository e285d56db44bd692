// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscriber
//!
//! Long-lived push consumers. `subscribe` declares the queue, starts a consumer
//! with fair dispatch and returns as soon as the consumer is registered; the
//! deliveries are processed one at a time on a spawned task. Every delivery is
//! acknowledged exactly once, whether the handler succeeded, failed, panicked,
//! or the payload could not be decoded. Nothing is ever requeued.

use crate::{
    consumer,
    errors::AmqpError,
    failure::FailureHook,
    handler::MessageHandler,
    pool::{ChannelPool, PooledChannel},
    routing::RoutingRegistry,
    transport::DeliveryStream,
};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

/// Handle to a running consumer.
///
/// Dropping the handle leaves the consumer running; call [`Subscription::cancel`]
/// to stop it.
pub struct Subscription {
    consumer_tag: String,
    channel: Arc<PooledChannel>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(consumer_tag: String, channel: Arc<PooledChannel>, task: JoinHandle<()>) -> Self {
        Subscription {
            consumer_tag,
            channel,
            task,
        }
    }

    /// Tag the broker knows the consumer by, `<queue>.<uuid>`.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// The consumed queue.
    pub fn queue(&self) -> &str {
        self.channel.queue()
    }

    /// True once the consumer stream ended, e.g. after the client was disposed.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the consumer and waits for the delivery in progress, if any.
    pub async fn cancel(self) -> Result<(), AmqpError> {
        if let Err(err) = self.channel.cancel(&self.consumer_tag).await {
            error!(
                error = err.to_string(),
                consumer_tag = self.consumer_tag,
                "failure to cancel consumer"
            );
            self.task.abort();
            return Err(err);
        }

        if let Err(err) = self.task.await {
            error!(error = err.to_string(), "consumer task failure");
            return Err(AmqpError::InternalError);
        }

        debug!(consumer_tag = self.consumer_tag, "consumer cancelled");
        Ok(())
    }
}

pub(crate) fn consumer_tag(queue: &str) -> String {
    format!("{}.{}", queue, Uuid::new_v4())
}

/// Installs push consumers.
#[derive(Clone)]
pub struct Subscriber {
    pool: Arc<ChannelPool>,
    registry: Arc<RoutingRegistry>,
    hook: Arc<dyn FailureHook>,
}

impl Subscriber {
    /// Creates a subscriber.
    ///
    /// # Parameters
    /// * `pool` - Channel pool shared with the other components
    /// * `registry` - Type routing used by [`Subscriber::subscribe_message`]
    /// * `hook` - Told about handler failures
    pub fn new(
        pool: Arc<ChannelPool>,
        registry: Arc<RoutingRegistry>,
        hook: Arc<dyn FailureHook>,
    ) -> Self {
        Subscriber {
            pool,
            registry,
            hook,
        }
    }

    /// Consumes `queue`, handing every decoded message to `handler`.
    ///
    /// Each delivery is acknowledged once the handler returned, whatever it
    /// returned; failures go to the failure hook.
    ///
    /// # Parameters
    /// * `queue` - Queue to consume, declared with prefetch 1 on first use
    /// * `durable` - Declare the queue durable
    /// * `handler` - Invoked with every decoded message, one at a time
    ///
    /// # Returns
    /// The handle of the running consumer
    pub async fn subscribe<T, H>(
        &self,
        queue: &str,
        durable: bool,
        handler: H,
    ) -> Result<Subscription, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T> + 'static,
    {
        let channel = self.pool.channel(queue, durable).await?;
        let consumer_tag = consumer_tag(channel.queue());
        let deliveries = channel.consume(&consumer_tag).await?;

        debug!(queue = channel.queue(), consumer_tag, "consumer started");

        let task = tokio::spawn(run::<T, H>(
            channel.clone(),
            deliveries,
            handler,
            self.hook.clone(),
        ));

        Ok(Subscription::new(consumer_tag, channel, task))
    }

    /// Consumes the queue registered for `T`.
    pub async fn subscribe_message<T, H>(&self, handler: H) -> Result<Subscription, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T> + 'static,
    {
        let route = self.registry.resolve::<T>()?;
        self.subscribe(route.queue(), route.durable(), handler).await
    }
}

async fn run<T, H>(
    channel: Arc<PooledChannel>,
    mut deliveries: DeliveryStream,
    handler: H,
    hook: Arc<dyn FailureHook>,
) where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T>,
{
    while let Some(result) = deliveries.next().await {
        match result {
            Ok(delivery) => {
                if let Err(err) =
                    consumer::consume::<T, H>(&channel, &delivery, &handler, hook.as_ref()).await
                {
                    error!(error = err.to_string(), "error consume msg");
                }
            }

            Err(err) => error!(error = err.to_string(), "errors consume msg"),
        }
    }

    debug!(queue = channel.queue(), "consumer stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RabbitMQConfig,
        connection::ConnectionManager,
        errors::HandlerError,
        failure::{FailedDelivery, LogFailureHook},
        transport::{memory::MemoryBroker, MessageProperties},
    };
    use serde_json::{json, Value};
    use std::{sync::Mutex, time::Duration};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingHook {
        failures: Mutex<Vec<HandlerError>>,
    }

    impl FailureHook for RecordingHook {
        fn on_failure(&self, _delivery: &FailedDelivery<'_>, err: &HandlerError) {
            self.failures.lock().unwrap().push(err.clone());
        }
    }

    fn pool(broker: Arc<MemoryBroker>) -> Arc<ChannelPool> {
        Arc::new(ChannelPool::new(Arc::new(ConnectionManager::new(
            broker,
            RabbitMQConfig::default(),
        ))))
    }

    async fn send(pool: &ChannelPool, queue: &str, body: &[u8]) {
        pool.channel(queue, false)
            .await
            .unwrap()
            .publish("", queue, MessageProperties::json(), body)
            .await
            .unwrap();
    }

    async fn settle(broker: &MemoryBroker, acks: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.acks().len() < acks {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn every_outcome_is_acknowledged_once() {
        let broker = MemoryBroker::new();
        let pool = pool(broker.clone());
        let hook = Arc::new(RecordingHook::default());
        let subscriber = Subscriber::new(pool.clone(), Arc::new(RoutingRegistry::new()), hook.clone());

        subscriber
            .subscribe("jobs", false, |job: Value| async move {
                match job["kind"].as_str() {
                    Some("fail") => Err(HandlerError::failed("rejected")),
                    Some("panic") => panic!("handler blew up"),
                    _ => Ok(()),
                }
            })
            .await
            .unwrap();

        send(&pool, "jobs", br#"{"kind":"ok"}"#).await;
        send(&pool, "jobs", br#"{"kind":"fail"}"#).await;
        send(&pool, "jobs", br#"{"kind":"panic"}"#).await;
        send(&pool, "jobs", b"not json").await;
        send(&pool, "jobs", br#"{"kind":"ok"}"#).await;

        settle(&broker, 5).await;

        assert_eq!(broker.acks().len(), 5);
        assert!(broker.acks().iter().all(|tag| broker.ack_count(*tag) == 1));
        assert_eq!(broker.unacked_count(), 0);

        let failures = hook.failures.lock().unwrap().clone();
        assert_eq!(failures.len(), 3);
        assert_eq!(failures[0], HandlerError::Failed("rejected".to_owned()));
        assert_eq!(failures[1], HandlerError::Panicked("handler blew up".to_owned()));
        assert!(matches!(failures[2], HandlerError::Decode(_)));
    }

    #[tokio::test]
    async fn deliveries_are_handled_in_order() {
        let broker = MemoryBroker::new();
        let pool = pool(broker.clone());
        let subscriber = Subscriber::new(
            pool.clone(),
            Arc::new(RoutingRegistry::new()),
            Arc::new(LogFailureHook),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        subscriber
            .subscribe("ordered", false, move |n: u32| {
                let tx = tx.clone();
                async move {
                    tx.send(n).map_err(|err| HandlerError::failed(err.to_string()))
                }
            })
            .await
            .unwrap();

        for n in 0..10u32 {
            send(&pool, "ordered", n.to_string().as_bytes()).await;
        }

        let mut seen = vec![];
        for _ in 0..10 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn cancel_stops_the_consumer() {
        let broker = MemoryBroker::new();
        let pool = pool(broker.clone());
        let subscriber = Subscriber::new(
            pool.clone(),
            Arc::new(RoutingRegistry::new()),
            Arc::new(LogFailureHook),
        );

        let subscription = subscriber
            .subscribe("stoppable", false, |_: Value| async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(subscription.queue(), "stoppable");
        assert_eq!(broker.consumer_count("stoppable"), 1);

        subscription.cancel().await.unwrap();

        assert_eq!(broker.consumer_count("stoppable"), 0);
        send(&pool, "stoppable", &serde_json::to_vec(&json!({})).unwrap()).await;
        assert_eq!(broker.message_count("stoppable"), 1);
    }
}
