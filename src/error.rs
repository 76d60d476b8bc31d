// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are categorized by how the replication loop reacts to them, not by
//! which library produced them.
//!
//! # Error Categories
//!
//! | Error Type | Kind | Retryable | Effect |
//! |------------|------|-----------|--------|
//! | `Transport` | Transport | Yes | Backoff, retried by the loop |
//! | `Protocol` | Protocol | No | Fails the call, replication moves to `Errored` |
//! | `Conflict` | Conflict | No | Routed to the conflict resolver |
//! | `LocalStorage` | LocalStorage | Yes | Checkpoint not advanced, retried next cycle |
//! | `Checkpoint` | LocalStorage | Yes | Checkpoint treated as absent |
//! | `Config` | Internal | No | Fix the configuration |
//! | `InvalidState` | Internal | No | Lifecycle misuse |
//! | `NotLeader` | Internal | No | Lease lost mid-operation |
//! | `Shutdown` | Internal | No | Replication is stopping |
//! | `Internal` | Internal | No | Bug |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether to back off and
//! retry, and [`ReplicationError::is_fatal()`] to decide whether the state
//! machine must halt.

use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Network failure or timeout talking to the remote.
    ///
    /// Always retryable. Drives the long-poll backoff.
    #[error("Transport error ({operation}): {message}")]
    Transport {
        operation: String,
        message: String,
        timeout: bool,
    },

    /// The remote answered with something we cannot interpret.
    ///
    /// Example: a batch response whose row count differs from the request.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A write was rejected because the remote state moved.
    #[error("Conflict on document {id}")]
    Conflict { id: String },

    /// The local collection failed to import or report writes.
    #[error("Local storage error: {0}")]
    LocalStorage(String),

    /// SQLite error in the checkpoint store.
    #[error("Checkpoint store error: {0}")]
    Checkpoint(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle operation attempted in the wrong state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Leadership was lost while the operation was running.
    #[error("Leadership lost")]
    NotLeader,

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error taxonomy as seen by subscribers of the error stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Conflict,
    LocalStorage,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Conflict => "conflict",
            ErrorKind::LocalStorage => "local_storage",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl ReplicationError {
    /// Create a transport error that is not a timeout.
    pub fn transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
            timeout: false,
        }
    }

    /// Create a transport error for an expired request timeout.
    pub fn timeout(operation: impl Into<String>) -> Self {
        let operation = operation.into();
        Self::Transport {
            message: format!("{} timed out", operation),
            operation,
            timeout: true,
        }
    }

    /// Map a `reqwest` failure for the given remote operation.
    ///
    /// Body decode failures mean the server spoke something other than the
    /// expected shape, everything else is a transport problem.
    pub fn from_http(operation: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(operation)
        } else if err.is_decode() {
            Self::Protocol(format!("{}: {}", operation, err))
        } else {
            Self::transport(operation, err.to_string())
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::LocalStorage(_) => true, // Retried on the next cycle
            Self::Checkpoint(_) => true,
            Self::Protocol(_) => false,
            Self::Conflict { .. } => false, // Resolved, not retried
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::NotLeader => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error must halt replication (`Errored` state).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Config(_) | Self::Internal(_))
    }

    /// Check if this error is an expired timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport { timeout: true, .. })
    }

    /// Category of this error on the error stream.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::LocalStorage(_) | Self::Checkpoint(_) => ErrorKind::LocalStorage,
            Self::Config(_)
            | Self::InvalidState { .. }
            | Self::NotLeader
            | Self::Shutdown
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Which part of the replication produced an error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Pull,
    Push,
    LongPoll,
    Checkpoint,
    Lifecycle,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorSource::Pull => "pull",
            ErrorSource::Push => "push",
            ErrorSource::LongPoll => "long_poll",
            ErrorSource::Checkpoint => "checkpoint",
            ErrorSource::Lifecycle => "lifecycle",
        };
        f.write_str(s)
    }
}

/// An entry on the replication error stream.
///
/// `ReplicationError` wraps non-cloneable sources, so subscribers get this
/// flattened copy instead.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub source: ErrorSource,
    pub message: String,
    pub retryable: bool,
    pub at: DateTime<Utc>,
}

impl ErrorEvent {
    pub fn new(source: ErrorSource, error: &ReplicationError) -> Self {
        Self {
            kind: error.kind(),
            source,
            message: error.to_string(),
            retryable: error.is_retryable(),
            at: Utc::now(),
        }
    }
}
