//! Transfer descriptor and state machine types
//!
//! A descriptor is owned by the orchestrator while the transfer is alive.
//! Everything handed to consumers is a cloned snapshot.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use glamour_common::{ContentHash, PeerId, TransferErrorKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Transfer Id / Direction / Priority
// =============================================================================

/// Identity of one orchestrated transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of the transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    /// Relay to local cache
    Download,
    /// Local file to relay
    Upload,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Download => f.write_str("download"),
            Self::Upload => f.write_str("upload"),
        }
    }
}

/// Scheduling priority; higher runs first, ties run in enqueue order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub u8);

impl Priority {
    pub const LOW: Self = Self(0);
    pub const NORMAL: Self = Self(128);
    pub const HIGH: Self = Self(255);
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

// =============================================================================
// Transfer State
// =============================================================================

/// Failure attached to a descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFailure {
    pub kind: TransferErrorKind,
    /// True while the orchestrator still intends to retry
    pub retryable: bool,
    pub message: String,
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Transfer state machine
///
/// `Queued -> Connecting -> Transferring -> Verifying -> Completed`, or
/// `Failed` with `retryable` set (waiting for backoff, then `Queued` again)
/// or cleared (terminal). `Cancelled` is terminal and not a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TransferState {
    Queued,
    Connecting,
    Transferring,
    Verifying,
    Completed,
    Failed(TransferFailure),
    Cancelled,
}

impl TransferState {
    /// Returns true once no further transitions will happen
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Completed | Self::Cancelled => true,
            Self::Failed(failure) => !failure.retryable,
            _ => false,
        }
    }

    /// Returns true while a worker owns the transfer
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Transferring | Self::Verifying)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Returns true for a terminal failure
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Failed(f) if !f.retryable)
    }

    pub fn failure(&self) -> Option<&TransferFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => f.write_str("queued"),
            Self::Connecting => f.write_str("connecting"),
            Self::Transferring => f.write_str("transferring"),
            Self::Verifying => f.write_str("verifying"),
            Self::Completed => f.write_str("completed"),
            Self::Failed(failure) if failure.retryable => {
                write!(f, "failed (retrying): {failure}")
            }
            Self::Failed(failure) => write!(f, "failed: {failure}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

// =============================================================================
// Transfer Request
// =============================================================================

/// What a caller asks the orchestrator to move
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub hash: ContentHash,
    pub direction: TransferDirection,
    pub total_bytes: u64,
    /// Local file for uploads
    pub source: Option<PathBuf>,
    /// Peer the transfer is performed for, used by `cancel_all`
    pub peer: Option<PeerId>,
}

impl TransferRequest {
    pub fn download(hash: ContentHash, total_bytes: u64, peer: Option<PeerId>) -> Self {
        Self {
            hash,
            direction: TransferDirection::Download,
            total_bytes,
            source: None,
            peer,
        }
    }

    pub fn upload(hash: ContentHash, source: PathBuf, total_bytes: u64) -> Self {
        Self {
            hash,
            direction: TransferDirection::Upload,
            total_bytes,
            source: Some(source),
            peer: None,
        }
    }
}

// =============================================================================
// Transfer Descriptor
// =============================================================================

/// Mutable record of one transfer's progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    pub id: TransferId,
    pub hash: ContentHash,
    pub direction: TransferDirection,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub state: TransferState,
    /// Attempts started so far (first attempt included)
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<TransferFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    /// Peers waiting on this transfer
    #[serde(default)]
    pub peers: Vec<PeerId>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TransferDescriptor {
    pub fn new(request: TransferRequest, priority: Priority) -> Self {
        Self {
            id: TransferId::new(),
            hash: request.hash,
            direction: request.direction,
            total_bytes: request.total_bytes,
            transferred_bytes: 0,
            state: TransferState::Queued,
            attempts: 0,
            last_error: None,
            source: request.source,
            peers: request.peer.into_iter().collect(),
            priority,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Calculate progress as a percentage (0.0 to 100.0)
    pub fn progress_percent(&self) -> f32 {
        if self.total_bytes == 0 {
            if self.state.is_completed() {
                100.0
            } else {
                0.0
            }
        } else {
            (self.transferred_bytes as f64 / self.total_bytes as f64 * 100.0) as f32
        }
    }

    /// Start a new attempt
    pub(crate) fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.transferred_bytes = 0;
        self.state = TransferState::Connecting;
    }

    pub(crate) fn fail(&mut self, failure: TransferFailure) {
        self.last_error = Some(failure.clone());
        if !failure.retryable {
            self.completed_at = Some(Utc::now());
        }
        self.state = TransferState::Failed(failure);
    }

    pub(crate) fn complete(&mut self) {
        self.state = TransferState::Completed;
        self.transferred_bytes = self.total_bytes.max(self.transferred_bytes);
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn cancel(&mut self) {
        self.state = TransferState::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    /// Return a retryable failure to the queue
    pub(crate) fn requeue(&mut self) {
        if matches!(&self.state, TransferState::Failed(f) if f.retryable) {
            self.state = TransferState::Queued;
        }
    }
}
