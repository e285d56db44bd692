// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! Application callbacks invoked for consumed messages. Both traits are
//! implemented for async closures, so most callers never implement them by
//! hand:
//!
//! ```ignore
//! subscriber
//!     .subscribe("orders", true, |order: Order| async move {
//!         store(order).await.map_err(|err| HandlerError::failed(err.to_string()))
//!     })
//!     .await?;
//! ```

use crate::errors::HandlerError;
use async_trait::async_trait;
use std::future::Future;

/// Handles one decoded message from a subscription or a pull.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync {
    async fn handle(&self, message: T) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: T) -> Result<(), HandlerError> {
        (self)(message).await
    }
}

/// Computes the response to an RPC request.
#[async_trait]
pub trait RpcHandler<Req, Res>: Send + Sync {
    async fn handle(&self, request: Req) -> Result<Res, HandlerError>;
}

#[async_trait]
impl<Req, Res, F, Fut> RpcHandler<Req, Res> for F
where
    Req: Send + 'static,
    Res: Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Res, HandlerError>> + Send,
{
    async fn handle(&self, request: Req) -> Result<Res, HandlerError> {
        (self)(request).await
    }
}
