//! Uploads of locally owned assets
//!
//! The manager hashes assets that arrive without a hash, asks the relay
//! which hashes it still lacks and enqueues uploads for only those. Resume
//! of interrupted uploads happens inside each attempt when the relay
//! reports a partial offset.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::join_all;
use glamour_common::hash::compute_hash_cancellable;
use glamour_common::{ContentHash, TransferErrorKind};
use tracing::{debug, info};

use crate::error::{EnqueueError, RelayError, UploadError};
use crate::mediator::{Mediator, Message};
use crate::relay::{CredentialProvider, RelayTransport, require_token};
use crate::transfers::{
    Priority, TransferDescriptor, TransferHandle, TransferOrchestrator, TransferRequest,
};

/// A local file offered for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAsset {
    pub path: PathBuf,
    /// Declared hash; computed from the file when absent
    pub hash: Option<ContentHash>,
}

impl LocalAsset {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            hash: None,
        }
    }

    pub fn with_hash(path: impl Into<PathBuf>, hash: ContentHash) -> Self {
        Self {
            path: path.into(),
            hash: Some(hash),
        }
    }
}

/// Uploads admitted for one batch of assets
///
/// Dropping the plan hands its transfers back to the orchestrator, which
/// forgets them once they settle.
pub struct UploadPlan {
    pub handles: Vec<TransferHandle>,
    /// Unique hashes the relay already had
    pub skipped: usize,
    cancel: Arc<AtomicBool>,
    orchestrator: TransferOrchestrator,
}

impl UploadPlan {
    /// Wait for every upload and return the terminal snapshots
    pub async fn wait(&self) -> Vec<TransferDescriptor> {
        let done = join_all(self.handles.iter().map(TransferHandle::wait)).await;
        for handle in &self.handles {
            self.orchestrator.acknowledge(handle.id());
        }
        done
    }

    /// Cancel every upload in the plan that has not finished
    ///
    /// Also sets the batch's cancel flag. Returns how many were cancelled.
    pub fn cancel(&self) -> usize {
        self.cancel.store(true, Ordering::SeqCst);
        self.handles
            .iter()
            .filter(|handle| self.orchestrator.cancel(handle.id()))
            .count()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for UploadPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadPlan")
            .field("handles", &self.handles)
            .field("skipped", &self.skipped)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Drop for UploadPlan {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            self.orchestrator.acknowledge_when_terminal(handle);
        }
    }
}

pub struct UploadManager {
    orchestrator: TransferOrchestrator,
    relay: Arc<dyn RelayTransport>,
    credentials: Arc<dyn CredentialProvider>,
    mediator: Mediator,
}

impl UploadManager {
    pub fn new(
        orchestrator: TransferOrchestrator,
        relay: Arc<dyn RelayTransport>,
        credentials: Arc<dyn CredentialProvider>,
        mediator: Mediator,
    ) -> Self {
        Self {
            orchestrator,
            relay,
            credentials,
            mediator,
        }
    }

    /// Upload every asset the relay does not already hold
    ///
    /// Setting `cancel` while this runs stops hashing and admission, and
    /// uploads admitted so far are cancelled. Once the plan is returned,
    /// cancel through [`UploadPlan::cancel`].
    pub async fn upload(
        &self,
        assets: Vec<LocalAsset>,
        cancel: Arc<AtomicBool>,
    ) -> Result<UploadPlan, UploadError> {
        let prepared = self.prepare(assets, &cancel).await?;
        let hashes: Vec<_> = prepared.iter().map(|(hash, _, _)| *hash).collect();

        let missing: HashSet<ContentHash> = match self.missing_on_relay(&hashes).await {
            Ok(missing) => missing.into_iter().collect(),
            Err(e) => {
                if e.kind() == TransferErrorKind::Unauthorized {
                    self.mediator.publish(Message::AuthorizationFailed {
                        hash: None,
                        reason: e.to_string(),
                    });
                }
                return Err(e.into());
            }
        };
        let skipped = prepared.len().saturating_sub(missing.len());

        let mut handles: Vec<TransferHandle> = Vec::with_capacity(missing.len());
        for (hash, path, size) in prepared {
            if !missing.contains(&hash) {
                continue;
            }
            match self.enqueue(TransferRequest::upload(hash, path, size), &cancel).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in &handles {
                        self.orchestrator.cancel(handle.id());
                    }
                    return Err(e);
                }
            }
        }

        info!(uploads = handles.len(), skipped, "upload batch admitted");
        Ok(UploadPlan {
            handles,
            skipped,
            cancel,
            orchestrator: self.orchestrator.clone(),
        })
    }

    /// Hash and size every asset, dropping repeated hashes
    async fn prepare(
        &self,
        assets: Vec<LocalAsset>,
        cancel: &Arc<AtomicBool>,
    ) -> Result<Vec<(ContentHash, PathBuf, u64)>, UploadError> {
        let mut seen = HashSet::new();
        let mut prepared = Vec::with_capacity(assets.len());
        for asset in assets {
            if cancel.load(Ordering::SeqCst) {
                return Err(UploadError::Cancelled);
            }
            let size = tokio::fs::metadata(&asset.path)
                .await
                .map_err(|source| UploadError::Asset {
                    path: asset.path.clone(),
                    source,
                })?
                .len();
            let hash = match asset.hash {
                Some(hash) => hash,
                None => compute_hash_cancellable(&asset.path, cancel.clone())
                    .await
                    .map_err(|source| match source.kind() {
                        io::ErrorKind::Interrupted => UploadError::Cancelled,
                        _ => UploadError::Asset {
                            path: asset.path.clone(),
                            source,
                        },
                    })?,
            };
            if seen.insert(hash) {
                debug!(hash = %hash, path = %asset.path.display(), size, "asset prepared");
                prepared.push((hash, asset.path, size));
            }
        }
        Ok(prepared)
    }

    async fn missing_on_relay(
        &self,
        hashes: &[ContentHash],
    ) -> Result<Vec<ContentHash>, RelayError> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let token = require_token(self.credentials.as_ref()).await?;
        let limit = self.orchestrator.settings().connect_timeout();
        tokio::time::timeout(limit, self.relay.missing_hashes(&token, hashes))
            .await
            .map_err(|_| RelayError::NetworkTransient("missing-hash query timed out".into()))?
    }

    async fn enqueue(
        &self,
        request: TransferRequest,
        cancel: &AtomicBool,
    ) -> Result<TransferHandle, UploadError> {
        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(UploadError::Cancelled);
            }
            match self.orchestrator.enqueue(request.clone(), Priority::NORMAL) {
                Ok(handle) => return Ok(handle),
                Err(EnqueueError::QueueFull { .. }) => {
                    self.orchestrator.wait_for_capacity().await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
