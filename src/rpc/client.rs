// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Client
//!
//! Request/reply over the broker. Each client owns a private reply queue,
//! exclusive to its connection and removed by the broker with it. A reply
//! dispatcher task consumes that queue and hands every reply to the call
//! registered under the reply's correlation id; replies nobody waits for are
//! acknowledged and dropped.
//!
//! A call waits until its deadline, measured from the moment the request was
//! published. The wait is a future: dropping it, or cancelling it through a
//! [`CancellationToken`], forgets the call.
//!
//! When the reply consumer stops, for instance because the client was disposed
//! or the connection dropped, the calls still waiting on it fail with
//! [`AmqpError::ConsumerError`] and the next call starts a new dispatcher.

use super::pending::{PendingCalls, RpcCallState};
use crate::{
    codec,
    errors::AmqpError,
    otel,
    pool::{ChannelPool, PooledChannel},
    routing::RoutingRegistry,
    subscriber::consumer_tag,
    transport::{DeliveryStream, MessageProperties},
};
use futures_util::StreamExt;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Prefix of the private reply queue names.
pub const REPLY_QUEUE_PREFIX: &str = "rpc.reply";

/// Deadline used when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

struct ReplyListener {
    id: u64,
    channel: Arc<PooledChannel>,
    consumer_tag: String,
    task: JoinHandle<()>,
}

impl ReplyListener {
    fn is_alive(&self) -> bool {
        self.channel.is_open() && !self.task.is_finished()
    }
}

impl Drop for ReplyListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Request/reply client with its own reply queue.
pub struct RpcClient {
    pool: Arc<ChannelPool>,
    registry: Arc<RoutingRegistry>,
    default_timeout: Duration,
    reply_queue: String,
    pending: Arc<PendingCalls>,
    listener: Mutex<Option<ReplyListener>>,
    listeners_started: AtomicU64,
}

impl RpcClient {
    /// Creates a client whose default timeout comes from the connection config.
    pub fn new(pool: Arc<ChannelPool>, registry: Arc<RoutingRegistry>) -> Self {
        let default_timeout = pool.connection().config().rpc_timeout();

        RpcClient {
            pool,
            registry,
            default_timeout,
            reply_queue: format!("{}.{}", REPLY_QUEUE_PREFIX, Uuid::new_v4()),
            pending: Arc::new(PendingCalls::default()),
            listener: Mutex::new(None),
            listeners_started: AtomicU64::new(0),
        }
    }

    /// Overrides the timeout used by [`RpcClient::call_message`].
    ///
    /// # Parameters
    /// * `timeout` - Maximum wait for a reply, counted from the publish
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Name of this client's reply queue.
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Number of calls waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Sends `body` as a request and waits for the matching reply body.
    ///
    /// Fails with [`AmqpError::RpcTimeout`] when no reply arrives within
    /// `timeout` of the publish, and with [`AmqpError::ConsumerError`] when the
    /// reply consumer stops first. Publish errors are returned as they are.
    ///
    /// # Parameters
    /// * `exchange` - Exchange the request is published to
    /// * `queue` - Request queue, declared and bound on first use
    /// * `routing_key` - Routing key of the request
    /// * `body` - Raw request payload
    /// * `persistent` - Durable queue and exchange, persistent request
    /// * `timeout` - Maximum wait for the reply
    ///
    /// # Returns
    /// The raw reply body
    pub async fn call(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
        body: &[u8],
        persistent: bool,
        timeout: Duration,
    ) -> Result<Vec<u8>, AmqpError> {
        self.execute(exchange, queue, routing_key, body, persistent, timeout, None)
            .await
    }

    /// Like [`RpcClient::call`], ending early with [`AmqpError::RpcCancelled`]
    /// when `cancel` fires.
    #[allow(clippy::too_many_arguments)]
    pub async fn call_with_cancel(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
        body: &[u8],
        persistent: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, AmqpError> {
        self.execute(exchange, queue, routing_key, body, persistent, timeout, Some(cancel))
            .await
    }

    /// Calls the queue registered for `T` with the default timeout and decodes
    /// the reply as `R`.
    pub async fn call_message<T, R>(&self, request: &T) -> Result<R, AmqpError>
    where
        T: Serialize + 'static,
        R: DeserializeOwned,
    {
        let route = self.registry.resolve::<T>()?;
        let body = codec::encode(request)?;

        let reply = self
            .call(
                route.exchange(),
                route.queue(),
                route.routing_key(),
                &body,
                route.durable(),
                self.default_timeout,
            )
            .await?;

        codec::decode(&reply)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
        body: &[u8],
        persistent: bool,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<u8>, AmqpError> {
        let channel = self
            .pool
            .bound_channel(exchange, queue, routing_key, persistent)
            .await?;
        let (listener, reply_queue) = self.listener().await?;

        let mut call = self.pending.register(listener);
        let correlation_id = call.correlation_id().to_owned();
        debug!(correlation_id, state = %RpcCallState::Created, "rpc call");

        let properties = MessageProperties::json()
            .with_message_id(Uuid::new_v4().to_string())
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(reply_queue)
            .with_persistent(persistent)
            .with_headers(otel::current_context_headers());

        channel
            .publish(exchange.trim(), routing_key, properties, body)
            .await?;

        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);
        debug!(correlation_id, state = %RpcCallState::Published, exchange, routing_key, "rpc call");

        let wait = timeout_at(deadline, call.reply());
        debug!(correlation_id, state = %RpcCallState::Waiting, "rpc call");

        let outcome = match cancel {
            Some(token) => tokio::select! {
                outcome = wait => outcome,
                _ = token.cancelled() => {
                    debug!(correlation_id, state = %RpcCallState::Cancelled, "rpc call");
                    return Err(AmqpError::RpcCancelled(correlation_id));
                }
            },
            None => wait.await,
        };

        match outcome {
            Ok(Ok(reply)) => {
                debug!(correlation_id, state = %RpcCallState::Completed, "rpc call");
                Ok(reply)
            }
            Ok(Err(_)) => {
                error!(correlation_id, "reply dispatcher stopped before the reply arrived");
                Err(AmqpError::ConsumerError(self.reply_queue.clone()))
            }
            Err(_) => {
                let timeout_ms = millis(timeout);
                warn!(
                    correlation_id,
                    state = %RpcCallState::TimedOut,
                    timeout_ms,
                    "rpc call"
                );
                Err(AmqpError::RpcTimeout {
                    correlation_id,
                    timeout_ms,
                })
            }
        }
    }

    /// Returns the id and queue of a running reply dispatcher, starting one
    /// when there is none or the previous one stopped.
    async fn listener(&self) -> Result<(u64, String), AmqpError> {
        let mut slot = self.listener.lock().await;

        if let Some(listener) = slot.as_ref().filter(|listener| listener.is_alive()) {
            return Ok((listener.id, listener.channel.queue().to_owned()));
        }

        if let Some(stale) = slot.take() {
            let abandoned = self.pending.abandon(stale.id);
            warn!(
                queue = stale.channel.queue(),
                abandoned, "reply dispatcher stopped, restarting it"
            );
        }

        let listener = self.start_listener().await?;
        let ready = (listener.id, listener.channel.queue().to_owned());
        *slot = Some(listener);

        Ok(ready)
    }

    async fn start_listener(&self) -> Result<ReplyListener, AmqpError> {
        let channel = self.pool.reply_channel(&self.reply_queue).await?;
        let consumer_tag = consumer_tag(channel.queue());
        let deliveries = channel.consume(&consumer_tag).await?;
        let id = self.listeners_started.fetch_add(1, Ordering::SeqCst);

        debug!(queue = channel.queue(), listener = id, "reply dispatcher started");

        let task = tokio::spawn(dispatch_replies(
            id,
            channel.clone(),
            deliveries,
            self.pending.clone(),
        ));

        Ok(ReplyListener {
            id,
            channel,
            consumer_tag,
            task,
        })
    }

    /// Stops the reply dispatcher; later calls start a new one.
    ///
    /// Calls still waiting for a reply fail with [`AmqpError::ConsumerError`].
    pub async fn close(&self) -> Result<(), AmqpError> {
        let Some(listener) = self.listener.lock().await.take() else {
            return Ok(());
        };

        self.pending.abandon(listener.id);
        if !listener.channel.is_open() {
            return Ok(());
        }
        listener.channel.cancel(&listener.consumer_tag).await
    }
}

async fn dispatch_replies(
    listener: u64,
    channel: Arc<PooledChannel>,
    mut deliveries: DeliveryStream,
    pending: Arc<PendingCalls>,
) {
    while let Some(result) = deliveries.next().await {
        let delivery = match result {
            Ok(delivery) => delivery,
            Err(err) => {
                error!(error = err.to_string(), "errors consume reply");
                continue;
            }
        };

        let delivered = match delivery.properties.correlation_id.as_deref() {
            Some(correlation_id) => pending.complete(correlation_id, delivery.body.clone()),
            None => false,
        };

        if !delivered {
            warn!(
                correlation_id = ?delivery.properties.correlation_id,
                queue = channel.queue(),
                "reply matches no pending call, dropping it"
            );
        }

        if let Err(err) = channel.ack(delivery.delivery_tag).await {
            error!(error = err.to_string(), "error whiling ack reply");
        }
    }

    let abandoned = pending.abandon(listener);
    debug!(queue = channel.queue(), listener, abandoned, "reply dispatcher stopped");
}

/// Milliseconds in `timeout`, saturating at `u64::MAX`.
fn millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}
