// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Server
//!
//! Consumes requests from a queue bound to an exchange and answers each one on
//! the queue named by its `reply_to` property, through the default exchange,
//! echoing the request's correlation id.
//!
//! Every request gets a reply and an acknowledgment. When the request cannot
//! be decoded, the handler fails or panics, or the response cannot be
//! encoded, the reply body is the original request body, unmodified.

use crate::{
    codec, consumer,
    errors::{AmqpError, HandlerError},
    exchange::DEFAULT_EXCHANGE,
    failure::FailureHook,
    handler::RpcHandler,
    otel,
    pool::{ChannelPool, PooledChannel},
    routing::RoutingRegistry,
    subscriber::{consumer_tag, Subscription},
    transport::{Delivery, DeliveryStream, MessageProperties},
};
use futures_util::StreamExt;
use opentelemetry::trace::Span;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Serves requests and replies to their `reply_to` queue.
#[derive(Clone)]
pub struct RpcServer {
    pool: Arc<ChannelPool>,
    registry: Arc<RoutingRegistry>,
    hook: Arc<dyn FailureHook>,
}

impl RpcServer {
    /// Creates an RPC server.
    ///
    /// # Parameters
    /// * `pool` - Channel pool shared with the other components
    /// * `registry` - Type routing used by [`RpcServer::serve_message`]
    /// * `hook` - Told about handler failures
    pub fn new(
        pool: Arc<ChannelPool>,
        registry: Arc<RoutingRegistry>,
        hook: Arc<dyn FailureHook>,
    ) -> Self {
        RpcServer {
            pool,
            registry,
            hook,
        }
    }

    /// Serves requests arriving on `queue`.
    ///
    /// The queue is declared and bound to `exchange` with its own name as the
    /// routing key. Returns once the consumer is registered.
    ///
    /// # Parameters
    /// * `exchange` - Exchange clients publish requests to
    /// * `queue` - Request queue
    /// * `durable` - Declare the queue and exchange durable
    /// * `handler` - Turns a decoded request into a response; on failure the
    ///   request body is sent back as the reply
    pub async fn serve<Req, Res, H>(
        &self,
        exchange: &str,
        queue: &str,
        durable: bool,
        handler: H,
    ) -> Result<Subscription, AmqpError>
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        H: RpcHandler<Req, Res> + 'static,
    {
        let channel = self.pool.bound_channel(exchange, queue, queue, durable).await?;
        let consumer_tag = consumer_tag(channel.queue());
        let deliveries = channel.consume(&consumer_tag).await?;

        debug!(exchange, queue = channel.queue(), consumer_tag, "rpc server started");

        let task = tokio::spawn(run::<Req, Res, H>(
            channel.clone(),
            deliveries,
            handler,
            self.hook.clone(),
        ));

        Ok(Subscription::new(consumer_tag, channel, task))
    }

    /// Serves the queue registered for `Req`.
    pub async fn serve_message<Req, Res, H>(&self, handler: H) -> Result<Subscription, AmqpError>
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        H: RpcHandler<Req, Res> + 'static,
    {
        let route = self.registry.resolve::<Req>()?;
        self.serve(route.exchange(), route.queue(), route.durable(), handler)
            .await
    }
}

async fn run<Req, Res, H>(
    channel: Arc<PooledChannel>,
    mut deliveries: DeliveryStream,
    handler: H,
    hook: Arc<dyn FailureHook>,
) where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    H: RpcHandler<Req, Res>,
{
    while let Some(result) = deliveries.next().await {
        match result {
            Ok(delivery) => {
                if let Err(err) =
                    respond::<Req, Res, H>(&channel, &delivery, &handler, hook.as_ref()).await
                {
                    error!(error = err.to_string(), "error consume request");
                }
            }

            Err(err) => error!(error = err.to_string(), "errors consume request"),
        }
    }

    debug!(queue = channel.queue(), "rpc server stopped");
}

async fn respond<Req, Res, H>(
    channel: &PooledChannel,
    delivery: &Delivery,
    handler: &H,
    hook: &dyn FailureHook,
) -> Result<(), AmqpError>
where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    H: RpcHandler<Req, Res>,
{
    let mut span = otel::new_span(&delivery.properties.headers, &otel::tracer(), channel.queue());

    debug!(
        queue = channel.queue(),
        delivery_tag = delivery.delivery_tag,
        correlation_id = ?delivery.properties.correlation_id,
        "received request"
    );

    let result = match consumer::decode::<Req>(&delivery.body) {
        Ok(request) => consumer::invoke(handler.handle(request))
            .await
            .and_then(|response| {
                codec::encode(&response).map_err(|err| HandlerError::Encode(err.to_string()))
            }),
        Err(err) => Err(err),
    };

    let (reply, mut handled) = match result {
        Ok(reply) => (reply, true),
        Err(err) => {
            consumer::report_failure(&mut span, hook, channel.queue(), delivery, &err);
            (delivery.body.clone(), false)
        }
    };

    match delivery
        .properties
        .reply_to
        .as_deref()
        .map(str::trim)
        .filter(|reply_to| !reply_to.is_empty())
    {
        Some(reply_to) => {
            let mut properties = MessageProperties::json()
                .with_message_id(Uuid::new_v4().to_string())
                .with_headers(otel::current_context_headers());
            if let Some(correlation_id) = &delivery.properties.correlation_id {
                properties = properties.with_correlation_id(correlation_id.clone());
            }

            if let Err(err) = channel
                .publish(DEFAULT_EXCHANGE, reply_to, properties, &reply)
                .await
            {
                error!(error = err.to_string(), reply_to, "failure to publish reply");
                span.record_error(&err);
                handled = false;
            }
        }
        None => warn!(
            queue = channel.queue(),
            delivery_tag = delivery.delivery_tag,
            "request without reply_to, no reply sent"
        ),
    }

    consumer::acknowledge(channel, delivery, &mut span, handled).await
}
