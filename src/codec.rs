// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! JSON payload encoding.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};
use tracing::error;

/// Serializes `value` as a JSON message body.
///
/// # Returns
/// The JSON bytes, or `ParsePayloadError` when `value` cannot be serialized
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(value).map_err(|err| {
        error!(error = err.to_string(), "failure to encode payload");
        AmqpError::ParsePayloadError(err.to_string())
    })
}

/// Deserializes a JSON message body.
///
/// # Returns
/// The decoded value, or `ParsePayloadError` when `body` is not a valid `T`
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, AmqpError> {
    serde_json::from_slice(body).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
}
