// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Wrapper
//!
//! Publish/subscribe, pull and request/reply messaging over RabbitMQ. One
//! [`client::RabbitMQClient`] owns a single lazily opened connection and one
//! channel per queue name; every consumed delivery is acknowledged exactly
//! once, whatever its handler does.

mod consumer;
mod otel;

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod errors;
pub mod exchange;
pub mod failure;
pub mod handler;
pub mod pool;
pub mod publisher;
pub mod puller;
pub mod queue;
pub mod routing;
pub mod rpc;
pub mod subscriber;
pub mod topology;
pub mod trace_log;
pub mod transport;

pub use client::RabbitMQClient;
pub use config::RabbitMQConfig;
pub use errors::{AmqpError, HandlerError};
pub use otel::new_span;
