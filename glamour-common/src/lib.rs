//! Glamour Common Library
//!
//! Shared types for the Glamour appearance sync system: content hashes,
//! peer manifests, and the transfer error taxonomy.

mod error_kind;
pub mod hash;
pub mod manifest;

pub use error_kind::TransferErrorKind;
pub use hash::{ContentHash, ContentHasher, ParseHashError};
pub use manifest::{Manifest, ManifestEntry, PeerId};

/// Buffer size for SHA-256 hashing operations (1MB for fewer syscalls)
pub const HASH_BUFFER_SIZE: usize = 1024 * 1024;
