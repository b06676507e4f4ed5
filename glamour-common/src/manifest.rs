//! Peer identity and manifest snapshots
//!
//! A manifest is a peer's complete asset set at a point in time. It is never
//! patched: when the peer's data changes a new manifest replaces the old one.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;

/// Opaque identity of a paired peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One file in a peer's asset set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Game-relative path the asset replaces
    pub logical_path: String,
    pub hash: ContentHash,
    pub size_bytes: u64,
}

impl ManifestEntry {
    pub fn new(logical_path: impl Into<String>, hash: ContentHash, size_bytes: u64) -> Self {
        Self {
            logical_path: logical_path.into(),
            hash,
            size_bytes,
        }
    }
}

/// Immutable snapshot of a peer's asset set
///
/// Cloning is cheap; entries are shared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub peer: PeerId,
    pub entries: Arc<[ManifestEntry]>,
    pub created_at: DateTime<Utc>,
}

impl Manifest {
    pub fn new(peer: PeerId, entries: Vec<ManifestEntry>) -> Self {
        Self {
            peer,
            entries: entries.into(),
            created_at: Utc::now(),
        }
    }

    /// Hashes in first-appearance order, duplicates removed
    ///
    /// Several logical paths may point at the same content.
    pub fn unique_hashes(&self) -> Vec<ContentHash> {
        let mut seen = HashSet::with_capacity(self.entries.len());
        self.entries
            .iter()
            .filter(|e| seen.insert(e.hash))
            .map(|e| e.hash)
            .collect()
    }

    /// Total bytes of distinct content
    pub fn total_bytes(&self) -> u64 {
        let mut seen = HashSet::with_capacity(self.entries.len());
        self.entries
            .iter()
            .filter(|e| seen.insert(e.hash))
            .map(|e| e.size_bytes)
            .sum()
    }

    /// Declared size of `hash`, if the manifest references it
    pub fn size_of(&self, hash: &ContentHash) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| &e.hash == hash)
            .map(|e| e.size_bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        let a = ContentHash::of(b"a");
        let b = ContentHash::of(b"bb");
        Manifest::new(
            PeerId::new("peer-1"),
            vec![
                ManifestEntry::new("chara/a.tex", a, 1),
                ManifestEntry::new("chara/b.tex", b, 2),
                ManifestEntry::new("chara/a_copy.tex", a, 1),
            ],
        )
    }

    #[test]
    fn test_unique_hashes_keeps_first_order() {
        let m = manifest();
        assert_eq!(
            m.unique_hashes(),
            vec![ContentHash::of(b"a"), ContentHash::of(b"bb")]
        );
    }

    #[test]
    fn test_total_bytes_counts_shared_content_once() {
        assert_eq!(manifest().total_bytes(), 3);
    }

    #[test]
    fn test_size_of() {
        let m = manifest();
        assert_eq!(m.size_of(&ContentHash::of(b"bb")), Some(2));
        assert_eq!(m.size_of(&ContentHash::of(b"zzz")), None);
    }

    #[test]
    fn test_serde_roundtrip_preserves_order() {
        let m = manifest();
        let json = serde_json::to_string(&m).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
        assert!(json.contains("\"peer\":\"peer-1\""));
    }
}
