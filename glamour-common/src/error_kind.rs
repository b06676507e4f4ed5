//! Machine-readable transfer failure kinds
//!
//! Every failure inside the transfer pipeline is classified into one of
//! these kinds. The kind decides whether the orchestrator retries, and is
//! carried in events so consumers can react (e.g. prompting for a fresh
//! login on `unauthorized`).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Failure classification for uploads and downloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferErrorKind {
    /// Timeout, reset connection, rate limiting or a 5xx-style relay error
    ///
    /// Retried with exponential backoff.
    NetworkTransient,

    /// Received bytes do not hash to the declared hash
    ///
    /// Either corruption or a tampered relay. Retried up to a separate
    /// ceiling, then fatal.
    HashMismatch,

    /// Asset no longer exists on the relay
    NotFound,

    /// Session credential rejected or missing
    ///
    /// Fatal immediately; consumers should trigger re-authentication.
    Unauthorized,

    /// Local filesystem failure (staging, commit, reading an upload source)
    ///
    /// Retried a bounded number of times, then fatal for that file only.
    Filesystem,

    /// Cooperative cancellation
    ///
    /// Terminal, but not reported as a failure.
    Cancelled,
}

impl TransferErrorKind {
    /// Whether a failure of this kind may be retried at all
    ///
    /// Per-kind attempt ceilings are applied by the orchestrator.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkTransient | Self::HashMismatch | Self::Filesystem
        )
    }

    /// Convert to the string representation used in events and logs
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkTransient => "network_transient",
            Self::HashMismatch => "hash_mismatch",
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Filesystem => "filesystem",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse from string
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "network_transient" => Some(Self::NetworkTransient),
            "hash_mismatch" => Some(Self::HashMismatch),
            "not_found" => Some(Self::NotFound),
            "unauthorized" => Some(Self::Unauthorized),
            "filesystem" => Some(Self::Filesystem),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for TransferErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<TransferErrorKind> for String {
    fn from(kind: TransferErrorKind) -> Self {
        kind.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TransferErrorKind; 6] = [
        TransferErrorKind::NetworkTransient,
        TransferErrorKind::HashMismatch,
        TransferErrorKind::NotFound,
        TransferErrorKind::Unauthorized,
        TransferErrorKind::Filesystem,
        TransferErrorKind::Cancelled,
    ];

    #[test]
    fn test_retryable_kinds() {
        assert!(TransferErrorKind::NetworkTransient.is_retryable());
        assert!(TransferErrorKind::HashMismatch.is_retryable());
        assert!(TransferErrorKind::Filesystem.is_retryable());
        assert!(!TransferErrorKind::NotFound.is_retryable());
        assert!(!TransferErrorKind::Unauthorized.is_retryable());
        assert!(!TransferErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            TransferErrorKind::parse("hash_mismatch"),
            Some(TransferErrorKind::HashMismatch)
        );
        assert_eq!(TransferErrorKind::parse("unknown"), None);
        assert_eq!(TransferErrorKind::parse(""), None);
    }

    #[test]
    fn test_display_matches_serde() {
        for kind in ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
        }
    }

    #[test]
    fn test_into_string() {
        let s: String = TransferErrorKind::Unauthorized.into();
        assert_eq!(s, "unauthorized");
    }

    #[test]
    fn test_roundtrip() {
        for kind in ALL {
            assert_eq!(TransferErrorKind::parse(kind.as_str()), Some(kind));
        }
    }
}
