//! Content hashing for cache keys and transfer identity
//!
//! Every asset is identified by the SHA-256 digest of its bytes. The digest
//! doubles as the cache key and as the transfer identity on the relay.
//!
//! All async helpers run the hashing on tokio's blocking pool so large files
//! never stall async workers.
//!
//! ## Cancellation
//!
//! The cancellable variants check an `AtomicBool` before every buffer read
//! (~1MB) and return `io::ErrorKind::Interrupted` once it is set.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::HASH_BUFFER_SIZE;

/// Length of a content hash in bytes
pub const HASH_LEN: usize = 32;

/// Length of a content hash rendered as hex
pub const HASH_HEX_LEN: usize = HASH_LEN * 2;

// =============================================================================
// ContentHash
// =============================================================================

/// SHA-256 digest identifying a blob of content
///
/// Displayed and serialized as 64 lowercase hex characters. Parsing accepts
/// either case so hashes coming from other tooling round-trip cleanly.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    /// Wrap raw digest bytes
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Hash an in-memory buffer
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = ContentHasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// Lowercase hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First two hex characters, used as the cache fan-out directory
    pub fn prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

/// Error returned when a string is not a valid content hash
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseHashError {
    #[error("content hash must be {HASH_HEX_LEN} hex characters, got {0}")]
    InvalidLength(usize),
    #[error("content hash contains non-hex characters")]
    InvalidHex,
}

impl FromStr for ContentHash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HASH_HEX_LEN {
            return Err(ParseHashError::InvalidLength(s.len()));
        }
        let mut bytes = [0u8; HASH_LEN];
        hex::decode_to_slice(s.to_ascii_lowercase(), &mut bytes)
            .map_err(|_| ParseHashError::InvalidHex)?;
        Ok(Self(bytes))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Incremental hashing
// =============================================================================

/// Incremental hasher for streamed content
#[derive(Clone, Default)]
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash(self.inner.finalize().into())
    }
}

// =============================================================================
// File hashing
// =============================================================================

/// Compute the content hash of an entire file
///
/// Runs on a blocking thread pool to avoid blocking async workers.
pub async fn compute_hash(path: &Path) -> io::Result<ContentHash> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || compute_hash_sync(&path))
        .await
        .map_err(|e| io::Error::other(format!("hash task failed: {e}")))?
}

/// Compute the content hash of a file with cancellation support
///
/// If `cancel_flag` is set to `true` the computation stops at the next
/// buffer boundary and returns `ErrorKind::Interrupted`.
pub async fn compute_hash_cancellable(
    path: &Path,
    cancel_flag: Arc<AtomicBool>,
) -> io::Result<ContentHash> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file(&path, Some(&cancel_flag)))
        .await
        .map_err(|e| io::Error::other(format!("hash task failed: {e}")))?
}

/// Synchronous content hash of a file
pub fn compute_hash_sync(path: &Path) -> io::Result<ContentHash> {
    hash_file(path, None)
}

fn hash_file(path: &Path, cancel_flag: Option<&Arc<AtomicBool>>) -> io::Result<ContentHash> {
    if is_cancelled(cancel_flag) {
        return Err(cancelled());
    }

    let mut file = File::open(path)?;
    let mut hasher = ContentHasher::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        if is_cancelled(cancel_flag) {
            return Err(cancelled());
        }

        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "hash computation cancelled")
}

/// Relaxed is enough here: the worst case is one extra buffer read.
#[inline]
fn is_cancelled(cancel_flag: Option<&Arc<AtomicBool>>) -> bool {
    cancel_flag
        .map(|flag| flag.load(Ordering::Relaxed))
        .unwrap_or(false)
}
