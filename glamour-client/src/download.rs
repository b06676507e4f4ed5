//! Manifest-driven downloads for one peer
//!
//! A [`DownloadManager`] turns a peer's [`Manifest`] into download transfers
//! for every hash the cache lacks, reports progress at a bounded rate and
//! publishes one final outcome per manifest. Applying a newer manifest
//! supersedes the previous one. The manager cancels its peer's work when
//! the peer goes offline or is unpaired.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use glamour_common::{ContentHash, Manifest, PeerId};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::ContentCache;
use crate::config::DownloadSettings;
use crate::error::EnqueueError;
use crate::mediator::{
    HashFailure, Mediator, Message, MessageKind, NotificationKind, Subscriber,
};
use crate::transfers::{
    Priority, TransferHandle, TransferId, TransferOrchestrator, TransferRequest, TransferState,
};

const SOURCE: &str = "downloads";

/// Result of diffing a manifest against the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestPlan {
    /// Hashes to download, in manifest order
    pub missing: Vec<ContentHash>,
    /// Unique hashes already cached
    pub present: usize,
}

/// Final state of one applied manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestOutcome {
    Completed { downloaded: usize, total: usize },
    Failed(Vec<HashFailure>),
    /// Superseded, cancelled, or the peer went away
    Cancelled,
}

/// Builds per-peer managers that share one orchestrator and cache
#[derive(Clone)]
pub struct DownloadManagerFactory {
    orchestrator: TransferOrchestrator,
    cache: Arc<ContentCache>,
    mediator: Mediator,
    settings: DownloadSettings,
}

impl DownloadManagerFactory {
    pub fn new(
        orchestrator: TransferOrchestrator,
        cache: Arc<ContentCache>,
        mediator: Mediator,
        settings: DownloadSettings,
    ) -> Self {
        Self {
            orchestrator,
            cache,
            mediator,
            settings,
        }
    }

    pub fn create(&self, peer: PeerId) -> DownloadManager {
        DownloadManager::new(
            peer,
            self.orchestrator.clone(),
            self.cache.clone(),
            self.mediator.clone(),
            self.settings.clone(),
        )
    }
}

/// State shared between a manager and one batch task
#[derive(Default)]
struct BatchControl {
    cancel: AtomicBool,
    /// Admitted transfers; locked while the batch is being superseded
    transfers: Mutex<HashMap<ContentHash, TransferId>>,
    /// Hashes a superseding manifest still needs
    keep: Mutex<HashSet<ContentHash>>,
}

impl BatchControl {
    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn transfers(&self) -> std::sync::MutexGuard<'_, HashMap<ContentHash, TransferId>> {
        self.transfers.lock().expect("batch transfers poisoned")
    }

    fn keeps(&self, hash: &ContentHash) -> bool {
        self.keep.lock().expect("batch keep set poisoned").contains(hash)
    }
}

struct Batch {
    control: Arc<BatchControl>,
    outcome: watch::Receiver<Option<ManifestOutcome>>,
}

struct ManagerShared {
    peer: PeerId,
    orchestrator: TransferOrchestrator,
    cache: Arc<ContentCache>,
    mediator: Mediator,
    settings: DownloadSettings,
    batch: Mutex<Option<Batch>>,
}

impl ManagerShared {
    /// Stop the current batch and cancel everything only this peer wants
    fn cancel_outstanding(&self, reason: &str) {
        if let Some(batch) = self.batch.lock().expect("batch lock poisoned").as_ref() {
            batch.control.cancel.store(true, Ordering::SeqCst);
        }
        let cancelled = self.orchestrator.cancel_all(&self.peer);
        info!(peer = %self.peer, cancelled, reason, "outstanding downloads cancelled");
    }
}

/// Download driver for one peer
pub struct DownloadManager {
    shared: Arc<ManagerShared>,
    _subscriber: Subscriber,
}

impl DownloadManager {
    fn new(
        peer: PeerId,
        orchestrator: TransferOrchestrator,
        cache: Arc<ContentCache>,
        mediator: Mediator,
        settings: DownloadSettings,
    ) -> Self {
        let shared = Arc::new(ManagerShared {
            peer: peer.clone(),
            orchestrator,
            cache,
            mediator: mediator.clone(),
            settings,
            batch: Mutex::new(None),
        });

        let subscriber = mediator.register(format!("{SOURCE}:{peer}"));
        for kind in [MessageKind::PeerOffline, MessageKind::PeerUnpaired] {
            let weak: Weak<ManagerShared> = Arc::downgrade(&shared);
            subscriber.subscribe(kind, move |message| {
                let (Message::PeerOffline { peer } | Message::PeerUnpaired { peer }) = message
                else {
                    return;
                };
                if let Some(shared) = weak.upgrade()
                    && *peer == shared.peer
                {
                    shared.cancel_outstanding(message.kind().as_ref());
                }
            });
        }

        Self {
            shared,
            _subscriber: subscriber,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.shared.peer
    }

    /// Diff `manifest` against the cache and start downloading what is
    /// missing
    ///
    /// Replaces any manifest applied earlier. Downloads the new manifest
    /// still needs keep running; the rest are released.
    pub fn apply_manifest(&self, manifest: Manifest) -> ManifestPlan {
        let shared = &self.shared;
        let unique = manifest.unique_hashes();
        let total = unique.len();
        let missing: Vec<_> = unique
            .into_iter()
            .filter(|hash| !shared.cache.contains(hash))
            .collect();
        let plan = ManifestPlan {
            present: total - missing.len(),
            missing: missing.clone(),
        };
        info!(
            peer = %shared.peer,
            total,
            missing = plan.missing.len(),
            "manifest applied"
        );

        let mut slot = shared.batch.lock().expect("batch lock poisoned");
        if let Some(previous) = slot.take() {
            self.supersede(previous, &missing);
        }

        let control = Arc::new(BatchControl::default());
        let (outcome_tx, outcome_rx) = watch::channel(None);
        tokio::spawn(run_batch(
            shared.clone(),
            manifest,
            missing,
            control.clone(),
            outcome_tx,
        ));
        *slot = Some(Batch {
            control,
            outcome: outcome_rx,
        });
        plan
    }

    /// Stop the previous batch and release what the new manifest dropped
    ///
    /// The previous batch winds down on its own and still publishes its
    /// final event. Transfers it admits after this point are released by
    /// the batch itself, checked against the same keep set.
    fn supersede(&self, previous: Batch, still_needed: &[ContentHash]) {
        let control = &previous.control;
        let transfers = control.transfers();
        control
            .keep
            .lock()
            .expect("batch keep set poisoned")
            .extend(still_needed.iter().copied());
        control.cancel.store(true, Ordering::SeqCst);

        let mut released = 0;
        for (hash, id) in transfers.iter() {
            if control.keeps(hash) {
                continue;
            }
            if self.shared.orchestrator.release(*id, &self.shared.peer) {
                released += 1;
            }
        }
        debug!(peer = %self.shared.peer, released, "previous manifest superseded");
    }

    /// Cancel every outstanding download of this peer
    pub fn cancel(&self) {
        self.shared.cancel_outstanding("cancelled");
    }

    /// Outcome of the current manifest, if it has finished
    pub fn outcome(&self) -> Option<ManifestOutcome> {
        let batch = self.shared.batch.lock().expect("batch lock poisoned");
        batch.as_ref().and_then(|b| b.outcome.borrow().clone())
    }

    /// Wait for the current manifest to finish
    ///
    /// Returns `None` if no manifest has been applied.
    pub async fn wait(&self) -> Option<ManifestOutcome> {
        let mut rx = {
            let batch = self.shared.batch.lock().expect("batch lock poisoned");
            batch.as_ref()?.outcome.clone()
        };
        let finished = rx.wait_for(Option::is_some).await.map(|o| o.clone());
        Some(
            finished
                .ok()
                .flatten()
                .unwrap_or(ManifestOutcome::Cancelled),
        )
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        let active = self
            .shared
            .batch
            .lock()
            .map(|b| b.as_ref().is_some_and(|b| b.outcome.borrow().is_none()))
            .unwrap_or(false);
        if active {
            self.shared.cancel_outstanding("manager dropped");
        }
    }
}

// =============================================================================
// Batch task
// =============================================================================

async fn run_batch(
    shared: Arc<ManagerShared>,
    manifest: Manifest,
    missing: Vec<ContentHash>,
    control: Arc<BatchControl>,
    outcome_tx: watch::Sender<Option<ManifestOutcome>>,
) {
    let peer = shared.peer.clone();
    let total = manifest.unique_hashes().len();
    let wanted = missing.len();

    let mut handles: Vec<TransferHandle> = Vec::with_capacity(wanted);
    let mut interrupted = false;
    for hash in missing {
        let Some(handle) = enqueue(&shared, &manifest, hash, &control.cancel).await else {
            interrupted = true;
            break;
        };
        let mut transfers = control.transfers();
        if control.is_cancelled() {
            if !control.keeps(&hash) {
                shared.orchestrator.release(handle.id(), &peer);
            }
            handles.push(handle);
            interrupted = true;
            break;
        }
        transfers.insert(hash, handle.id());
        drop(transfers);
        handles.push(handle);
    }

    let mut ticker = tokio::time::interval(shared.settings.progress_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_progress = None;
    let snapshots = loop {
        ticker.tick().await;
        let snapshots: Vec<_> = handles.iter().map(TransferHandle::snapshot).collect();
        if control.is_cancelled() {
            interrupted = true;
            break snapshots;
        }

        let completed = snapshots.iter().filter(|d| d.state.is_completed()).count();
        let transferred_bytes: u64 = snapshots.iter().map(|d| d.transferred_bytes).sum();
        let total_bytes: u64 = snapshots.iter().map(|d| d.total_bytes).sum();
        let progress = (transferred_bytes, completed);
        if last_progress != Some(progress) {
            last_progress = Some(progress);
            shared.mediator.publish(Message::DownloadProgress {
                peer: peer.clone(),
                transferred_bytes,
                total_bytes,
                completed,
                total: wanted,
            });
        }

        if snapshots.iter().all(|d| d.state.is_terminal()) {
            break snapshots;
        }
    };

    let failures: Vec<HashFailure> = snapshots
        .iter()
        .filter_map(|d| {
            d.state.failure().map(|f| HashFailure {
                hash: d.hash,
                kind: f.kind,
                message: f.message.clone(),
            })
        })
        .collect();
    let cancelled =
        interrupted || snapshots.iter().any(|d| d.state == TransferState::Cancelled);

    let outcome = if !failures.is_empty() {
        warn!(peer = %peer, failed = failures.len(), "manifest download failed");
        shared.mediator.publish(Message::ManifestFailed {
            peer: peer.clone(),
            failures: failures.clone(),
        });
        shared.mediator.publish(Message::notification(
            NotificationKind::Error,
            "Sync failed",
            format!("{} file(s) from {peer} could not be downloaded", failures.len()),
        ));
        ManifestOutcome::Failed(failures)
    } else if cancelled {
        info!(peer = %peer, "manifest download cancelled");
        shared.mediator.publish(Message::info(
            SOURCE,
            format!("downloads for {peer} cancelled"),
        ));
        ManifestOutcome::Cancelled
    } else {
        info!(peer = %peer, downloaded = wanted, total, "manifest download completed");
        shared.mediator.publish(Message::ManifestCompleted {
            peer: peer.clone(),
            downloaded: wanted,
            total,
        });
        if wanted > 0 {
            shared.mediator.publish(Message::notification(
                NotificationKind::Success,
                "Appearance synced",
                format!("{wanted} file(s) downloaded for {peer}"),
            ));
        }
        ManifestOutcome::Completed {
            downloaded: wanted,
            total,
        }
    };

    for handle in handles {
        shared.orchestrator.acknowledge_when_terminal(handle);
    }
    outcome_tx.send_replace(Some(outcome));
}

/// Enqueue one download, waiting out `QueueFull`
///
/// Returns `None` if the batch was cancelled or the orchestrator shut down.
async fn enqueue(
    shared: &ManagerShared,
    manifest: &Manifest,
    hash: ContentHash,
    cancel: &AtomicBool,
) -> Option<TransferHandle> {
    let size = manifest.size_of(&hash).unwrap_or(0);
    loop {
        if cancel.load(Ordering::SeqCst) {
            return None;
        }
        let request = TransferRequest::download(hash, size, Some(shared.peer.clone()));
        match shared.orchestrator.enqueue(request, Priority::NORMAL) {
            Ok(handle) => return Some(handle),
            Err(EnqueueError::QueueFull { limit }) => {
                debug!(peer = %shared.peer, limit, "transfer queue full, waiting");
                shared.orchestrator.wait_for_capacity().await;
            }
            Err(EnqueueError::ShutDown) => return None,
        }
    }
}
