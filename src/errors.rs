// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Wrapper
//!
//! This module provides the error types for broker operations. `AmqpError` covers
//! everything that is propagated to callers: connection and channel setup,
//! topology declaration, publishing, consuming, routing resolution and RPC waits.
//! `HandlerError` covers failures of application-supplied handlers, which are
//! never propagated but reported to a [`FailureHook`](crate::failure::FailureHook).

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating or using a channel
    #[error("failure to create a channel")]
    ChannelError,

    /// Error loading the client configuration
    #[error("failure to load configuration `{0}`")]
    ConfigError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error encoding or decoding a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error fetching a message with basic.get
    #[error("failure to get message from `{0}`")]
    GetMessageError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error closing a channel or connection
    #[error("failure to close `{0}`")]
    CloseError(String),

    /// The message type has no registered exchange/queue metadata
    #[error("no routing configured for `{0}`")]
    RoutingNotConfigured(String),

    /// No matching reply arrived before the deadline
    #[error("rpc call `{correlation_id}` timed out after {timeout_ms}ms")]
    RpcTimeout {
        correlation_id: String,
        timeout_ms: u64,
    },

    /// The caller cancelled the wait for a reply
    #[error("rpc call `{0}` was cancelled")]
    RpcCancelled(String),

    /// Error compressing or decompressing a payload
    #[error("failure to compress payload `{0}`")]
    CompressionError(String),
}

/// Failure of an application-supplied handler.
///
/// Handler failures are isolated per delivery: the delivery is still
/// acknowledged and the consumer keeps running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The delivery body could not be decoded into the handler's input type
    #[error("failure to decode payload: {0}")]
    Decode(String),

    /// The handler's output could not be encoded
    #[error("failure to encode response: {0}")]
    Encode(String),

    /// The handler returned an error
    #[error("handler failed: {0}")]
    Failed(String),

    /// The handler panicked
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Builds a [`HandlerError::Failed`] from a message.
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}
