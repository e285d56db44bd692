// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Trace Log
//!
//! A record of one traced request/response exchange, with the identity of the
//! process that produced it. Request and response bodies are usually large XML
//! or JSON documents, so the shipped form, [`CompressedTraceLog`], carries them
//! as LZ4 frames, base64 encoded in JSON.

use crate::errors::AmqpError;
use async_compression::tokio::{bufread::Lz4Decoder, write::Lz4Encoder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{env, process, thread};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const UNKNOWN: &str = "unknown";

/// Identity of the process and thread recording a trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceOrigin {
    pub machine_name: String,
    pub process_id: u32,
    pub process_name: String,
    pub thread_id: String,
    pub thread_name: Option<String>,
    pub application_path: String,
}

impl TraceOrigin {
    /// Captures the identity of the calling process and thread.
    pub fn capture() -> Self {
        let current = thread::current();
        let exe = env::current_exe().ok();

        TraceOrigin {
            machine_name: env::var("HOSTNAME")
                .or_else(|_| env::var("COMPUTERNAME"))
                .unwrap_or_else(|_| UNKNOWN.to_owned()),
            process_id: process::id(),
            process_name: exe
                .as_deref()
                .and_then(|path| path.file_stem())
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| UNKNOWN.to_owned()),
            thread_id: format!("{:?}", current.id()),
            thread_name: current.name().map(str::to_owned),
            application_path: exe
                .as_deref()
                .and_then(|path| path.parent())
                .map(|dir| dir.display().to_string())
                .unwrap_or_else(|| UNKNOWN.to_owned()),
        }
    }
}

/// A traced exchange with plain request and response bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceLog {
    #[serde(flatten)]
    pub origin: TraceOrigin,
    pub created_time: DateTime<Utc>,
    pub class_name: String,
    pub method_name: String,
    pub method_display_name: String,
    pub request: String,
    pub response: String,
    pub remark: String,
    /// Milliseconds.
    pub duration: u64,
}

impl TraceLog {
    /// Starts a trace log stamped with the current time and process identity.
    ///
    /// # Parameters
    /// * `class_name` - Component that handled the request
    /// * `method_name` - Operation that handled the request
    pub fn new(class_name: &str, method_name: &str) -> Self {
        TraceLog {
            origin: TraceOrigin::capture(),
            created_time: Utc::now(),
            class_name: class_name.to_owned(),
            method_name: method_name.to_owned(),
            method_display_name: String::default(),
            request: String::default(),
            response: String::default(),
            remark: String::default(),
            duration: 0,
        }
    }

    pub fn with_method_display_name(mut self, name: &str) -> Self {
        self.method_display_name = name.to_owned();
        self
    }

    /// Sets the request body.
    pub fn with_request(mut self, request: impl Into<String>) -> Self {
        self.request = request.into();
        self
    }

    /// Sets the response body.
    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = response.into();
        self
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = remark.into();
        self
    }

    /// Sets the duration in milliseconds.
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration = duration_ms;
        self
    }

    /// Compresses request and response bodies.
    pub async fn compress(&self) -> Result<CompressedTraceLog, AmqpError> {
        Ok(CompressedTraceLog {
            origin: self.origin.clone(),
            created_time: self.created_time,
            class_name: self.class_name.clone(),
            method_name: self.method_name.clone(),
            method_display_name: self.method_display_name.clone(),
            request: lz4_compress(self.request.as_bytes()).await?,
            response: lz4_compress(self.response.as_bytes()).await?,
            remark: self.remark.clone(),
            duration: self.duration,
        })
    }
}

/// Shipped form of a [`TraceLog`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedTraceLog {
    #[serde(flatten)]
    pub origin: TraceOrigin,
    pub created_time: DateTime<Utc>,
    pub class_name: String,
    pub method_name: String,
    pub method_display_name: String,
    #[serde(with = "frame_serde")]
    pub request: Vec<u8>,
    #[serde(with = "frame_serde")]
    pub response: Vec<u8>,
    pub remark: String,
    pub duration: u64,
}

impl CompressedTraceLog {
    /// Restores the plain request and response bodies.
    ///
    /// # Returns
    /// The trace log, or `CompressionError` when a frame is not valid LZ4 text
    pub async fn decompress(&self) -> Result<TraceLog, AmqpError> {
        Ok(TraceLog {
            origin: self.origin.clone(),
            created_time: self.created_time,
            class_name: self.class_name.clone(),
            method_name: self.method_name.clone(),
            method_display_name: self.method_display_name.clone(),
            request: lz4_decompress_text(&self.request).await?,
            response: lz4_decompress_text(&self.response).await?,
            remark: self.remark.clone(),
            duration: self.duration,
        })
    }
}

mod frame_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(frame: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(frame).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

fn compression_error(err: std::io::Error) -> AmqpError {
    AmqpError::CompressionError(err.to_string())
}

async fn lz4_compress(data: &[u8]) -> Result<Vec<u8>, AmqpError> {
    let mut encoder = Lz4Encoder::new(Vec::new());
    encoder.write_all(data).await.map_err(compression_error)?;
    encoder.shutdown().await.map_err(compression_error)?;
    Ok(encoder.into_inner())
}

async fn lz4_decompress_text(frame: &[u8]) -> Result<String, AmqpError> {
    let mut decoder = Lz4Decoder::new(frame);
    let mut text = String::new();
    decoder
        .read_to_string(&mut text)
        .await
        .map_err(compression_error)?;
    Ok(text)
}
