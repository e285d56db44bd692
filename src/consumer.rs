// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! The per-delivery steps shared by subscriptions, pulls and the RPC server:
//! open a consumer span, decode, run the handler with panics caught, report
//! failures, and acknowledge exactly once whatever the handler outcome.

use crate::{
    codec,
    errors::{AmqpError, HandlerError},
    failure::{FailedDelivery, FailureHook},
    handler::MessageHandler,
    otel,
    pool::PooledChannel,
    transport::Delivery,
};
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedSpan,
    trace::{Span, Status},
};
use serde::de::DeserializeOwned;
use std::{any::Any, borrow::Cow, future::Future, panic::AssertUnwindSafe};
use tracing::{debug, error};

/// Consumes one delivery on behalf of a [`MessageHandler`].
///
/// Handler failures are reported to `hook` and never returned; the only error
/// is a failed acknowledgment.
pub(crate) async fn consume<T, H>(
    channel: &PooledChannel,
    delivery: &Delivery,
    handler: &H,
    hook: &dyn FailureHook,
) -> Result<(), AmqpError>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T> + ?Sized,
{
    let mut span = otel::new_span(&delivery.properties.headers, &otel::tracer(), channel.queue());

    debug!(
        queue = channel.queue(),
        exchange = delivery.exchange,
        delivery_tag = delivery.delivery_tag,
        "received message"
    );

    let result = match decode::<T>(&delivery.body) {
        Ok(message) => invoke(handler.handle(message)).await,
        Err(err) => Err(err),
    };

    let handled = match result {
        Ok(()) => {
            debug!("message successfully processed");
            true
        }
        Err(err) => {
            report_failure(&mut span, hook, channel.queue(), delivery, &err);
            false
        }
    };

    acknowledge(channel, delivery, &mut span, handled).await
}

pub(crate) fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, HandlerError> {
    codec::decode(body).map_err(|err| HandlerError::Decode(err.to_string()))
}

/// Awaits a handler future, turning a panic into [`HandlerError::Panicked`].
pub(crate) async fn invoke<R, Fut>(fut: Fut) -> Result<R, HandlerError>
where
    Fut: Future<Output = Result<R, HandlerError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::Panicked(panic_message(&*panic))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

pub(crate) fn report_failure(
    span: &mut BoxedSpan,
    hook: &dyn FailureHook,
    queue: &str,
    delivery: &Delivery,
    err: &HandlerError,
) {
    span.record_error(err);
    span.set_status(Status::Error {
        description: Cow::from(err.to_string()),
    });

    hook.on_failure(
        &FailedDelivery {
            queue,
            delivery_tag: delivery.delivery_tag,
            correlation_id: delivery.properties.correlation_id.as_deref(),
            body: &delivery.body,
        },
        err,
    );
}

/// Acknowledges `delivery`; the span is marked ok only when `handled`.
pub(crate) async fn acknowledge(
    channel: &PooledChannel,
    delivery: &Delivery,
    span: &mut BoxedSpan,
    handled: bool,
) -> Result<(), AmqpError> {
    match channel.ack(delivery.delivery_tag).await {
        Err(err) => {
            error!(
                error = err.to_string(),
                queue = channel.queue(),
                delivery_tag = delivery.delivery_tag,
                "error whiling ack msg"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            Err(AmqpError::AckMessageError)
        }
        Ok(()) => {
            if handled {
                span.set_status(Status::Ok);
            }
            Ok(())
        }
    }
}
