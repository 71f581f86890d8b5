// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the storage node.
//!
//! Errors are categorized by where they come from (peer transport, the local
//! SQLite store, the blob backend, decoding) and carry enough context to be
//! logged without further wrapping.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Network errors, timeouts, connection refused |
//! | `RemoteRejected` | Yes | Peer answered with a non-2xx status |
//! | `Store` | Transient only | SQLite busy/locked, pool timeout, I/O |
//! | `Blob` | Yes | Blob backend I/O failure |
//! | `Malformed` | No | Operation or payload could not be decoded |
//! | `Auth` | No | Signature or nonce verification failed |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Node state machine violation |
//! | `Shutdown` | No | Node is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! [`ReplicationError::is_retryable()`] decides whether an apply is retried
//! inside a sweep. [`ReplicationError::is_malformed()`] marks operations that
//! will never succeed and must be skipped instead of stalling replication.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Errors that can occur while replicating, placing or repairing.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Network-level failure talking to a peer.
    ///
    /// Covers connect errors, timeouts and broken responses. The next
    /// scheduled push/sweep/probe is the retry.
    #[error("Transport error ({peer}): {message}")]
    Transport { peer: String, message: String },

    /// Peer answered, but with a non-success status.
    #[error("Peer {peer} rejected request with status {status}")]
    RemoteRejected { peer: String, status: u16 },

    /// Local SQLite error (op log, blob metadata, cursors).
    ///
    /// Only busy/locked/pool-timeout/I/O conditions are worth retrying;
    /// everything else needs operator attention.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Blob backend failure (read/write/delete of blob bytes).
    #[error("Blob store error: {0}")]
    Blob(String),

    /// An operation or its payload could not be decoded.
    ///
    /// Never retried: the same bytes will fail the same way.
    #[error("Malformed operation: {0}")]
    Malformed(String),

    /// Signature or nonce verification failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Node state machine violation (e.g. `start()` twice).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a transport error for a peer.
    pub fn transport(peer: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Transport {
            peer: peer.into(),
            message: message.to_string(),
        }
    }

    /// Create a malformed-operation error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::RemoteRejected { .. } => true,
            Self::Store(e) => is_transient_store_error(e),
            Self::Blob(_) => true,
            Self::Malformed(_) => false,
            Self::Auth(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error marks a permanently undecodable operation.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

/// Whether a sqlx error is a transient condition (busy/locked, pool pressure, I/O).
pub(crate) fn is_transient_store_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        other => crate::store::is_sqlite_busy_error(other),
    }
}
