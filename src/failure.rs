// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Failure Reporting
//!
//! Handler failures never reach the broker: the delivery is acknowledged and
//! dropped. The failure is handed to a [`FailureHook`] instead, which by default
//! logs it. Applications can plug in their own hook to count, alert, or copy the
//! message elsewhere without changing the acknowledgment contract.

use crate::errors::HandlerError;
use tracing::error;

/// The delivery whose handler failed.
#[derive(Debug, Clone, Copy)]
pub struct FailedDelivery<'a> {
    pub queue: &'a str,
    pub delivery_tag: u64,
    pub correlation_id: Option<&'a str>,
    pub body: &'a [u8],
}

/// Receives handler failures from subscribers, pullers and RPC servers.
pub trait FailureHook: Send + Sync {
    fn on_failure(&self, delivery: &FailedDelivery<'_>, error: &HandlerError);
}

/// Logs handler failures with `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogFailureHook;

impl FailureHook for LogFailureHook {
    fn on_failure(&self, delivery: &FailedDelivery<'_>, err: &HandlerError) {
        error!(
            error = err.to_string(),
            queue = delivery.queue,
            delivery_tag = delivery.delivery_tag,
            correlation_id = delivery.correlation_id,
            "handler failure, message acknowledged and dropped"
        );
    }
}
