//! Error types for the sync engine
//!
//! Each error maps onto a [`TransferErrorKind`] so the orchestrator can
//! decide on retries without matching on individual variants.

use std::io;
use std::path::PathBuf;

use glamour_common::{ContentHash, TransferErrorKind};
use thiserror::Error;

/// Content-addressed cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("content not found in cache: {hash}")]
    NotFound { hash: ContentHash },

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CacheError {
    pub fn kind(&self) -> TransferErrorKind {
        match self {
            Self::NotFound { .. } => TransferErrorKind::NotFound,
            Self::HashMismatch { .. } => TransferErrorKind::HashMismatch,
            Self::Io(_) => TransferErrorKind::Filesystem,
        }
    }
}

/// Failures surfaced by a relay transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// Timeout, reset, rate limit or server-side error
    #[error("relay unavailable: {0}")]
    NetworkTransient(String),

    #[error("not found on relay: {hash}")]
    NotFound { hash: ContentHash },

    #[error("relay rejected credentials: {0}")]
    Unauthorized(String),
}

impl RelayError {
    pub fn kind(&self) -> TransferErrorKind {
        match self {
            Self::NetworkTransient(_) => TransferErrorKind::NetworkTransient,
            Self::NotFound { .. } => TransferErrorKind::NotFound,
            Self::Unauthorized(_) => TransferErrorKind::Unauthorized,
        }
    }
}

/// Rejections from `TransferOrchestrator::enqueue`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// Backlog limit reached; retry once capacity frees up
    #[error("transfer queue is full ({limit} queued)")]
    QueueFull { limit: usize },

    #[error("orchestrator is shut down")]
    ShutDown,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Failures while preparing an upload batch
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to read {}: {source}", path.display())]
    Asset { path: PathBuf, source: io::Error },

    #[error("upload batch cancelled")]
    Cancelled,

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
}

/// Errors that abort a compaction pass
///
/// Per-file failures are retried and skipped, never surfaced here.
#[derive(Debug, Error)]
pub enum CompactError {
    #[error("failed to scan {}: {source}", path.display())]
    Scan { path: PathBuf, source: io::Error },

    #[error("compaction task failed: {0}")]
    Task(String),
}
