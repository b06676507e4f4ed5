//! Relay transport seam
//!
//! The relay mediates byte transfer between peers. The engine only needs two
//! primitives (a chunked upload and a streamed download), both keyed by
//! content hash and authorized with a session token from an external auth
//! collaborator.

mod memory;

use std::fmt;
use std::sync::RwLock;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use glamour_common::ContentHash;

pub use memory::{Fault, MemoryRelay};

use crate::error::RelayError;

/// Downloaded bytes, in relay-chosen chunk sizes
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, RelayError>>;

/// Bearer credential for relay calls
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken([REDACTED])")
    }
}

/// Relay acknowledgement of an uploaded chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadAck {
    /// Contiguous bytes the relay now holds for the hash
    pub received_bytes: u64,
    /// True once the relay verified and stored the whole object
    pub complete: bool,
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open a byte stream for `hash`
    async fn download_stream(
        &self,
        token: &SessionToken,
        hash: ContentHash,
    ) -> Result<ByteStream, RelayError>;

    /// Send `bytes` starting at `offset` of the object `hash`
    async fn upload_chunk(
        &self,
        token: &SessionToken,
        hash: ContentHash,
        offset: u64,
        bytes: Vec<u8>,
        total_bytes: u64,
    ) -> Result<UploadAck, RelayError>;

    /// Bytes already held for a partial upload of `hash`
    ///
    /// `None` means the relay cannot resume and uploads restart from zero.
    async fn upload_offset(
        &self,
        _token: &SessionToken,
        _hash: ContentHash,
    ) -> Result<Option<u64>, RelayError> {
        Ok(None)
    }

    /// Subset of `hashes` the relay does not have yet
    async fn missing_hashes(
        &self,
        _token: &SessionToken,
        hashes: &[ContentHash],
    ) -> Result<Vec<ContentHash>, RelayError> {
        Ok(hashes.to_vec())
    }
}

/// Source of the current session token
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// `None` when no session is established
    async fn session_token(&self) -> Option<SessionToken>;
}

/// Credential provider holding a token set by the login flow
#[derive(Debug, Default)]
pub struct StaticCredentials {
    token: RwLock<Option<SessionToken>>,
}

impl StaticCredentials {
    pub fn new(token: SessionToken) -> Self {
        Self {
            token: RwLock::new(Some(token)),
        }
    }

    pub fn set(&self, token: SessionToken) {
        *self.token.write().expect("credentials lock poisoned") = Some(token);
    }

    pub fn clear(&self) {
        *self.token.write().expect("credentials lock poisoned") = None;
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn session_token(&self) -> Option<SessionToken> {
        self.token.read().expect("credentials lock poisoned").clone()
    }
}

/// Fetch the session token or fail as unauthorized
pub(crate) async fn require_token(
    credentials: &dyn CredentialProvider,
) -> Result<SessionToken, RelayError> {
    credentials
        .session_token()
        .await
        .ok_or_else(|| RelayError::Unauthorized("no session token".to_string()))
}
