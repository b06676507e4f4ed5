//! Single-attempt transfer execution
//!
//! One call runs one attempt of one transfer: connect, move bytes, verify.
//! Retry decisions belong to the orchestrator; this module only classifies
//! what went wrong.
//!
//! Cancellation is observed between I/O steps. A cancelled download drops
//! its staged file, so nothing partial is ever committed.

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use glamour_common::{ContentHash, TransferErrorKind};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, trace};

use super::throttle::Throttle;
use crate::cache::ContentCache;
use crate::config::TransferSettings;
use crate::error::{CacheError, RelayError};
use crate::relay::{CredentialProvider, RelayTransport, UploadAck, require_token};

// =============================================================================
// Events and outcomes
// =============================================================================

/// Progress reported by a running attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    Connecting,
    /// Bytes moved so far in this attempt (resume offset included)
    Transferring { transferred: u64 },
    Verifying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed,
    /// Download skipped because the cache already holds the hash
    AlreadyCached,
    Cancelled,
}

/// Classified failure of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptError {
    pub kind: TransferErrorKind,
    pub message: String,
}

impl AttemptError {
    fn new(kind: TransferErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn timeout(step: &str) -> Self {
        Self::new(
            TransferErrorKind::NetworkTransient,
            format!("{step} timed out"),
        )
    }

    fn filesystem(err: impl std::fmt::Display) -> Self {
        Self::new(TransferErrorKind::Filesystem, err.to_string())
    }
}

impl From<RelayError> for AttemptError {
    fn from(err: RelayError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<CacheError> for AttemptError {
    fn from(err: CacheError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

// =============================================================================
// Context
// =============================================================================

/// Shared collaborators for one attempt
pub struct AttemptContext<'a> {
    pub relay: &'a dyn RelayTransport,
    pub credentials: &'a dyn CredentialProvider,
    pub cache: &'a ContentCache,
    pub throttle: &'a Throttle,
    pub settings: &'a TransferSettings,
    pub cancel: &'a AtomicBool,
}

impl AttemptContext<'_> {
    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

async fn with_timeout<T, F>(limit: Duration, step: &str, fut: F) -> Result<T, AttemptError>
where
    F: Future<Output = Result<T, RelayError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(AttemptError::from),
        Err(_) => Err(AttemptError::timeout(step)),
    }
}

// =============================================================================
// Download
// =============================================================================

/// Fetch `hash` from the relay into the cache
pub async fn run_download(
    ctx: &AttemptContext<'_>,
    hash: ContentHash,
    on_event: &mut (dyn FnMut(TransferEvent) + Send),
) -> Result<AttemptOutcome, AttemptError> {
    if ctx.is_cancelled() {
        return Ok(AttemptOutcome::Cancelled);
    }
    if ctx.cache.contains(&hash) {
        debug!(hash = %hash, "already cached, skipping download");
        return Ok(AttemptOutcome::AlreadyCached);
    }

    on_event(TransferEvent::Connecting);
    let token = require_token(ctx.credentials).await?;
    let mut stream = with_timeout(
        ctx.settings.connect_timeout(),
        "connect",
        ctx.relay.download_stream(&token, hash),
    )
    .await?;

    let mut staged = ctx.cache.begin_store(hash).await?;
    on_event(TransferEvent::Transferring { transferred: 0 });

    loop {
        if ctx.is_cancelled() {
            staged.discard().await;
            return Ok(AttemptOutcome::Cancelled);
        }
        let next = match tokio::time::timeout(ctx.settings.read_timeout(), stream.next()).await {
            Ok(next) => next,
            Err(_) => return Err(AttemptError::timeout("read")),
        };
        let chunk = match next {
            Some(chunk) => chunk?,
            None => break,
        };
        staged.write(&chunk).await?;
        ctx.throttle.consume(chunk.len()).await;
        trace!(hash = %hash, bytes = staged.bytes_written(), "chunk received");
        on_event(TransferEvent::Transferring {
            transferred: staged.bytes_written(),
        });
    }

    if ctx.is_cancelled() {
        staged.discard().await;
        return Ok(AttemptOutcome::Cancelled);
    }
    on_event(TransferEvent::Verifying);
    staged.commit().await?;
    Ok(AttemptOutcome::Completed)
}

// =============================================================================
// Upload
// =============================================================================

/// Send the local file `source` to the relay as `hash`
///
/// Resumes from the relay's offset when it reports one; otherwise starts
/// from zero.
pub async fn run_upload(
    ctx: &AttemptContext<'_>,
    hash: ContentHash,
    source: &Path,
    total_bytes: u64,
    on_event: &mut (dyn FnMut(TransferEvent) + Send),
) -> Result<AttemptOutcome, AttemptError> {
    if ctx.is_cancelled() {
        return Ok(AttemptOutcome::Cancelled);
    }

    on_event(TransferEvent::Connecting);
    let token = require_token(ctx.credentials).await?;
    let resume_from = with_timeout(
        ctx.settings.connect_timeout(),
        "connect",
        ctx.relay.upload_offset(&token, hash),
    )
    .await?
    .filter(|offset| *offset <= total_bytes)
    .unwrap_or(0);

    let mut file = tokio::fs::File::open(source)
        .await
        .map_err(AttemptError::filesystem)?;
    if resume_from > 0 {
        debug!(hash = %hash, offset = resume_from, "resuming upload");
        file.seek(std::io::SeekFrom::Start(resume_from))
            .await
            .map_err(AttemptError::filesystem)?;
    }

    let mut sent = resume_from;
    let mut buffer = vec![0u8; ctx.settings.chunk_size.max(1)];
    let mut last_ack: Option<UploadAck> = None;
    on_event(TransferEvent::Transferring { transferred: sent });

    // An empty object still needs one call so the relay can commit it
    while sent < total_bytes || last_ack.is_none() {
        if ctx.is_cancelled() {
            return Ok(AttemptOutcome::Cancelled);
        }

        let want = (total_bytes - sent).min(buffer.len() as u64) as usize;
        let n = read_full(&mut file, &mut buffer[..want])
            .await
            .map_err(AttemptError::filesystem)?;
        if n < want {
            return Err(AttemptError::new(
                TransferErrorKind::Filesystem,
                format!("{} shrank while uploading", source.display()),
            ));
        }

        let ack = with_timeout(
            ctx.settings.write_timeout(),
            "write",
            ctx.relay
                .upload_chunk(&token, hash, sent, buffer[..n].to_vec(), total_bytes),
        )
        .await?;
        ctx.throttle.consume(n).await;
        sent += n as u64;
        last_ack = Some(ack);
        on_event(TransferEvent::Transferring { transferred: sent });
    }

    on_event(TransferEvent::Verifying);
    match last_ack {
        Some(ack) if ack.complete && ack.received_bytes == total_bytes => {
            Ok(AttemptOutcome::Completed)
        }
        _ => Err(AttemptError::new(
            TransferErrorKind::NetworkTransient,
            "relay did not confirm the upload",
        )),
    }
}

/// Read until `buf` is full or EOF
async fn read_full(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
