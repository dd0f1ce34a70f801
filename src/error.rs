// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the CDC replication pipeline.
//!
//! Errors are categorized by their source (transport, offset store, local
//! store, codec) and carry enough context to be logged without the caller
//! adding more.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Publish/poll failures, timeouts, connection loss |
//! | `Store` | Yes | Local store temporarily unavailable |
//! | `OffsetStore` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `Codec` | No | Malformed record on the wire |
//! | `Decompression` | No | Data corruption (zstd decode failed) |
//! | `UnknownType` | No | Record references a type never announced on the metadata topic |
//! | `InvalidState` | No | Streamer state machine violation |
//! | `Shutdown` | No | Streamer is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Batch loops use [`CdcError::is_retryable()`] to decide between backing
//! off and retrying the same batch, or giving up. Non-retryable errors on a
//! single record make that record poisoned; it is skipped, never retried.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, CdcError>;

/// Errors that can occur while streaming changes between clusters.
#[derive(Error, Debug)]
pub enum CdcError {
    /// Transport (partitioned log) command failure.
    ///
    /// Retryable: publish and poll are repeated with the same batch.
    #[error("Transport error ({operation}): {message}")]
    Transport {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// SQLite error while loading or committing consumer offsets.
    #[error("Offset store error: {0}")]
    OffsetStore(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    ///
    /// Surfaced at construction or first use, never silently defaulted.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local store read or write failure.
    ///
    /// Retryable: the whole uncommitted batch is re-resolved and reapplied.
    #[error("Store error: {0}")]
    Store(String),

    /// Record could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Zstd decompression failure.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Data record references a type with no metadata descriptor.
    #[error("Unknown type: {0}")]
    UnknownType(String),

    /// Streamer state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CdcError {
    /// Create a transport error from a redis::RedisError
    pub fn transport(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a transport error without source
    pub fn transport_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Store(_) => true,
            Self::OffsetStore(_) => false,
            Self::Config(_) => false,
            Self::Codec(_) => false,
            Self::Decompression(_) => false,
            Self::UnknownType(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label for the `error_type` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Store(_) => "store",
            Self::OffsetStore(_) => "offset_store",
            Self::Config(_) => "config",
            Self::Codec(_) => "codec",
            Self::Decompression(_) => "decompression",
            Self::UnknownType(_) => "unknown_type",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<redis::RedisError> for CdcError {
    fn from(e: redis::RedisError) -> Self {
        Self::transport("unknown", e)
    }
}

impl From<crate::store::StoreError> for CdcError {
    fn from(e: crate::store::StoreError) -> Self {
        Self::Store(e.0)
    }
}
