//! Typed messages carried by the mediator

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use glamour_common::{ContentHash, PeerId, TransferErrorKind};
use strum::{AsRefStr, EnumDiscriminants};

use crate::compactor::CompactionReport;
use crate::constants::NOTIFICATION_DURATION;
use crate::transfers::TransferDescriptor;

/// Severity of a free-form [`Event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Free-form event raised by any component
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub severity: Severity,
    pub source: &'static str,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(severity: Severity, source: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity,
            source,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.severity.as_ref(),
            self.source,
            self.message
        )
    }
}

/// Style hint for user-facing notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Error,
}

/// A per-manifest hash that could not be fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashFailure {
    pub hash: ContentHash,
    pub kind: TransferErrorKind,
    pub message: String,
}

/// Everything that can travel over the mediator
///
/// Subscriptions are keyed by [`MessageKind`], generated from the variants.
#[derive(Debug, Clone, EnumDiscriminants)]
#[strum_discriminants(name(MessageKind), derive(Hash, AsRefStr))]
pub enum Message {
    Event(Event),

    Notification {
        title: String,
        message: String,
        kind: NotificationKind,
        duration: Option<Duration>,
    },

    /// Snapshot after every transfer state change
    TransferUpdate(TransferDescriptor),

    /// Rate-limited progress of one peer's manifest
    DownloadProgress {
        peer: PeerId,
        transferred_bytes: u64,
        total_bytes: u64,
        completed: usize,
        total: usize,
    },

    ManifestCompleted {
        peer: PeerId,
        downloaded: usize,
        total: usize,
    },

    ManifestFailed {
        peer: PeerId,
        failures: Vec<HashFailure>,
    },

    /// Relay rejected the session; consumers should reconnect
    AuthorizationFailed {
        hash: Option<ContentHash>,
        reason: String,
    },

    PeerOffline {
        peer: PeerId,
    },

    PeerUnpaired {
        peer: PeerId,
    },

    CompactionFinished(CompactionReport),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        MessageKind::from(self)
    }

    /// Shorthand for an info-level [`Event`]
    pub fn info(source: &'static str, message: impl Into<String>) -> Self {
        Self::Event(Event::new(Severity::Info, source, message))
    }

    pub fn warning(source: &'static str, message: impl Into<String>) -> Self {
        Self::Event(Event::new(Severity::Warning, source, message))
    }

    pub fn error(source: &'static str, message: impl Into<String>) -> Self {
        Self::Event(Event::new(Severity::Error, source, message))
    }

    /// User-facing notification; errors stay until dismissed
    pub fn notification(
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let duration = match kind {
            NotificationKind::Error => None,
            _ => Some(NOTIFICATION_DURATION),
        };
        Self::Notification {
            title: title.into(),
            message: message.into(),
            kind,
            duration,
        }
    }
}
