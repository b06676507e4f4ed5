//! Bounded worker pool driving transfers against the relay
//!
//! The orchestrator owns every live [`TransferDescriptor`]. Each descriptor
//! sits in a `watch` channel so handles can observe it without locking the
//! table; the table itself only tracks scheduling (priority queue, queued
//! count, coalescing keys).
//!
//! Lock order is table first, then a descriptor's watch. Nothing takes the
//! table lock while borrowing a watch.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use glamour_common::{ContentHash, PeerId, TransferErrorKind};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::executor::{
    AttemptContext, AttemptError, AttemptOutcome, TransferEvent, run_download, run_upload,
};
use super::retry::RetryPolicy;
use super::throttle::Throttle;
use super::types::{
    Priority, TransferDescriptor, TransferDirection, TransferFailure, TransferId,
    TransferRequest, TransferState,
};
use crate::cache::ContentCache;
use crate::config::{SyncConfig, TransferSettings};
use crate::error::EnqueueError;
use crate::mediator::{Mediator, Message};
use crate::relay::{CredentialProvider, RelayTransport};

// =============================================================================
// Scheduling table
// =============================================================================

struct QueueItem {
    priority: Priority,
    seq: Reverse<u64>,
    id: TransferId,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

/// Per-transfer state shared between the table, workers and handles
struct Slot {
    cancel: AtomicBool,
    cancelled: Notify,
    descriptor: watch::Sender<TransferDescriptor>,
    failures: Mutex<HashMap<TransferErrorKind, u32>>,
}

impl Slot {
    fn new(descriptor: TransferDescriptor) -> Self {
        let (tx, _rx) = watch::channel(descriptor);
        Self {
            cancel: AtomicBool::new(false),
            cancelled: Notify::new(),
            descriptor: tx,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn snapshot(&self) -> TransferDescriptor {
        self.descriptor.borrow().clone()
    }

    fn is_terminal(&self) -> bool {
        self.descriptor.borrow().state.is_terminal()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn signal_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.cancelled.notify_waiters();
    }

    /// Record one more failure of `kind` and return the running count
    fn count_failure(&self, kind: TransferErrorKind) -> u32 {
        let mut failures = self.failures.lock().expect("failure counts poisoned");
        let count = failures.entry(kind).or_insert(0);
        *count += 1;
        *count
    }
}

#[derive(Default)]
struct Table {
    slots: HashMap<TransferId, Arc<Slot>>,
    queue: BinaryHeap<QueueItem>,
    /// Descriptors currently in `Queued`
    queued: usize,
    coalesce: HashMap<(TransferDirection, ContentHash), TransferId>,
    seq: u64,
}

impl Table {
    fn push(&mut self, id: TransferId, priority: Priority) {
        self.seq += 1;
        self.queue.push(QueueItem {
            priority,
            seq: Reverse(self.seq),
            id,
        });
        self.queued += 1;
    }

    fn release_key(&mut self, descriptor: &TransferDescriptor) {
        let key = (descriptor.direction, descriptor.hash);
        if self.coalesce.get(&key) == Some(&descriptor.id) {
            self.coalesce.remove(&key);
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

struct Shared {
    settings: TransferSettings,
    retry: RetryPolicy,
    throttle: Throttle,
    relay: Arc<dyn RelayTransport>,
    credentials: Arc<dyn CredentialProvider>,
    cache: Arc<ContentCache>,
    mediator: Mediator,
    table: Mutex<Table>,
    work_ready: Notify,
    capacity: Notify,
    shutdown: AtomicBool,
    active: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Cloneable handle to the transfer worker pool
#[derive(Clone)]
pub struct TransferOrchestrator {
    inner: Arc<Shared>,
}

impl TransferOrchestrator {
    pub fn new(
        config: &SyncConfig,
        relay: Arc<dyn RelayTransport>,
        credentials: Arc<dyn CredentialProvider>,
        cache: Arc<ContentCache>,
        mediator: Mediator,
    ) -> Self {
        let throttle = match config.transfers.bandwidth_limit_bytes_per_sec {
            0 => Throttle::unlimited(),
            rate => Throttle::new(rate),
        };
        Self {
            inner: Arc::new(Shared {
                settings: config.transfers.clone(),
                retry: RetryPolicy::from_settings(&config.retry),
                throttle,
                relay,
                credentials,
                cache,
                mediator,
                table: Mutex::new(Table::default()),
                work_ready: Notify::new(),
                capacity: Notify::new(),
                shutdown: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the worker pool; later calls are no-ops
    pub fn start(&self) {
        let mut workers = self.inner.workers.lock().expect("worker list poisoned");
        if !workers.is_empty() || self.inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let count = self.inner.settings.parallel_transfers.max(1);
        for index in 0..count {
            workers.push(tokio::spawn(worker_loop(self.inner.clone(), index)));
        }
        info!(workers = count, "transfer workers started");
    }

    /// Admit a transfer
    ///
    /// A request matching a non-terminal transfer of the same hash and
    /// direction joins that transfer instead of starting a new one.
    pub fn enqueue(
        &self,
        request: TransferRequest,
        priority: Priority,
    ) -> Result<TransferHandle, EnqueueError> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(EnqueueError::ShutDown);
        }

        let key = (request.direction, request.hash);
        let mut table = self.inner.table();

        if let Some(id) = table.coalesce.get(&key).copied()
            && let Some(slot) = table.slots.get(&id).cloned()
            && !slot.is_terminal()
        {
            if let Some(peer) = request.peer {
                slot.descriptor.send_if_modified(|d| {
                    if d.peers.contains(&peer) {
                        return false;
                    }
                    d.peers.push(peer);
                    true
                });
            }
            debug!(id = %id, hash = %request.hash, "joined existing transfer");
            return Ok(TransferHandle::new(id, &slot));
        }

        let limit = self.inner.settings.queue_limit;
        if table.queued >= limit {
            return Err(EnqueueError::QueueFull { limit });
        }

        let descriptor = TransferDescriptor::new(request, priority);
        let id = descriptor.id;
        let slot = Arc::new(Slot::new(descriptor.clone()));
        table.slots.insert(id, slot.clone());
        table.coalesce.insert(key, id);
        table.push(id, priority);
        drop(table);

        debug!(
            id = %id,
            hash = %descriptor.hash,
            direction = %descriptor.direction,
            priority = priority.0,
            "transfer queued"
        );
        self.inner.publish(descriptor);
        self.inner.work_ready.notify_one();
        Ok(TransferHandle::new(id, &slot))
    }

    /// Request cancellation of one transfer
    ///
    /// Queued or backing-off transfers become `Cancelled` immediately; a
    /// running attempt stops at its next I/O step. Returns false if the
    /// transfer is unknown or already terminal.
    pub fn cancel(&self, id: TransferId) -> bool {
        let mut table = self.inner.table();
        let Some(slot) = table.slots.get(&id).cloned() else {
            return false;
        };
        self.inner.cancel_slot(&mut table, &slot)
    }

    /// Drop `peer`'s interest in a transfer, cancelling it once nobody is
    /// left waiting
    pub fn release(&self, id: TransferId, peer: &PeerId) -> bool {
        let mut table = self.inner.table();
        let Some(slot) = table.slots.get(&id).cloned() else {
            return false;
        };
        self.inner.release_peer(&mut table, &slot, peer)
    }

    /// Release `peer` from every transfer it requested; returns how many
    /// transfers were cancelled as a result
    ///
    /// Transfers still wanted by another peer keep running.
    pub fn cancel_all(&self, peer: &PeerId) -> usize {
        let mut table = self.inner.table();
        let slots: Vec<_> = table
            .slots
            .values()
            .filter(|slot| {
                let d = slot.descriptor.borrow();
                !d.state.is_terminal() && d.peers.contains(peer)
            })
            .cloned()
            .collect();

        let cancelled = slots
            .iter()
            .filter(|slot| self.inner.release_peer(&mut table, slot, peer))
            .count();
        if cancelled > 0 {
            info!(peer = %peer, cancelled, "cancelled transfers for peer");
        }
        cancelled
    }

    /// Resolve once the backlog is below the admission limit
    pub async fn wait_for_capacity(&self) {
        loop {
            let notified = self.inner.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.shutdown.load(Ordering::SeqCst)
                || self.queued_count() < self.inner.settings.queue_limit
            {
                return;
            }
            notified.await;
        }
    }

    /// Remove a terminal transfer and return its final snapshot
    ///
    /// Returns `None` for unknown or still-running transfers.
    pub fn acknowledge(&self, id: TransferId) -> Option<TransferDescriptor> {
        let mut table = self.inner.table();
        let slot = table.slots.get(&id)?;
        if !slot.is_terminal() {
            return None;
        }
        table.slots.remove(&id).map(|slot| slot.snapshot())
    }

    /// Acknowledge `handle` once it settles, without waiting for it here
    ///
    /// Terminal transfers are removed at once. Outside a runtime the
    /// transfer is left for a later `acknowledge`.
    pub fn acknowledge_when_terminal(&self, handle: TransferHandle) {
        if handle.snapshot().state.is_terminal() {
            self.acknowledge(handle.id());
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let orchestrator = self.clone();
        runtime.spawn(async move {
            handle.wait().await;
            orchestrator.acknowledge(handle.id());
        });
    }

    pub fn snapshot(&self, id: TransferId) -> Option<TransferDescriptor> {
        self.inner.table().slots.get(&id).map(|slot| slot.snapshot())
    }

    /// Snapshots of every tracked transfer, oldest first
    pub fn snapshots(&self) -> Vec<TransferDescriptor> {
        let mut all: Vec<_> = self
            .inner
            .table()
            .slots
            .values()
            .map(|slot| slot.snapshot())
            .collect();
        all.sort_by_key(|d| d.created_at);
        all
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.inner.settings
    }

    /// Attempts currently running on a worker
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn queued_count(&self) -> usize {
        self.inner.table().queued
    }

    /// Cancel every transfer and wait for the workers to exit
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut table = self.inner.table();
            let slots: Vec<_> = table.slots.values().cloned().collect();
            for slot in &slots {
                self.inner.cancel_slot(&mut table, slot);
            }
        }
        self.inner.work_ready.notify_waiters();
        self.inner.capacity.notify_waiters();

        let workers = std::mem::take(
            &mut *self.inner.workers.lock().expect("worker list poisoned"),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "transfer worker ended abnormally");
            }
        }
        info!("transfer orchestrator stopped");
    }
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().expect("transfer table poisoned")
    }

    fn publish(&self, descriptor: TransferDescriptor) {
        self.mediator.publish(Message::TransferUpdate(descriptor));
    }

    /// Pop the highest-priority queued transfer and start an attempt
    fn next_job(&self) -> Option<Arc<Slot>> {
        let mut table = self.table();
        while let Some(item) = table.queue.pop() {
            let Some(slot) = table.slots.get(&item.id).cloned() else {
                continue;
            };
            let started = slot.descriptor.send_if_modified(|d| {
                if d.state != TransferState::Queued {
                    return false;
                }
                d.begin_attempt();
                true
            });
            if !started {
                continue;
            }
            table.queued -= 1;
            self.active.fetch_add(1, Ordering::SeqCst);
            drop(table);

            self.capacity.notify_waiters();
            self.publish(slot.snapshot());
            return Some(slot);
        }
        None
    }

    async fn run_job(self: &Arc<Self>, slot: Arc<Slot>) {
        let snapshot = slot.snapshot();
        debug!(
            id = %snapshot.id,
            hash = %snapshot.hash,
            attempt = snapshot.attempts,
            "attempt starting"
        );

        let ctx = AttemptContext {
            relay: self.relay.as_ref(),
            credentials: self.credentials.as_ref(),
            cache: self.cache.as_ref(),
            throttle: &self.throttle,
            settings: &self.settings,
            cancel: &slot.cancel,
        };
        let mut on_event = |event: TransferEvent| self.apply_event(&slot, event);

        let result = match (snapshot.direction, snapshot.source.as_deref()) {
            (TransferDirection::Download, _) => {
                run_download(&ctx, snapshot.hash, &mut on_event).await
            }
            (TransferDirection::Upload, Some(source)) => {
                run_upload(
                    &ctx,
                    snapshot.hash,
                    source,
                    snapshot.total_bytes,
                    &mut on_event,
                )
                .await
            }
            (TransferDirection::Upload, None) => Err(AttemptError {
                kind: TransferErrorKind::Filesystem,
                message: "upload has no source file".to_string(),
            }),
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.finish_attempt(&slot, result);
    }

    /// Reflect executor progress in the descriptor
    ///
    /// Only state changes are published; byte counts go to watchers.
    fn apply_event(&self, slot: &Slot, event: TransferEvent) {
        let mut state_changed = false;
        slot.descriptor.send_if_modified(|d| {
            let next = match event {
                TransferEvent::Connecting => TransferState::Connecting,
                TransferEvent::Transferring { transferred } => {
                    d.transferred_bytes = transferred;
                    TransferState::Transferring
                }
                TransferEvent::Verifying => TransferState::Verifying,
            };
            if d.state != next {
                d.state = next;
                state_changed = true;
            }
            true
        });
        if state_changed {
            self.publish(slot.snapshot());
        }
    }

    fn finish_attempt(
        self: &Arc<Self>,
        slot: &Arc<Slot>,
        result: Result<AttemptOutcome, AttemptError>,
    ) {
        match result {
            Ok(AttemptOutcome::Completed | AttemptOutcome::AlreadyCached) => {
                self.settle(slot, |d| d.complete());
                let d = slot.snapshot();
                info!(
                    id = %d.id,
                    hash = %d.hash,
                    direction = %d.direction,
                    bytes = d.total_bytes,
                    attempts = d.attempts,
                    "transfer completed"
                );
            }
            Ok(AttemptOutcome::Cancelled) => self.settle_cancelled(slot),
            Err(_) if slot.is_cancelled() => self.settle_cancelled(slot),
            Err(err) => self.handle_failure(slot, err),
        }
    }

    fn settle_cancelled(&self, slot: &Slot) {
        self.settle(slot, |d| d.cancel());
        debug!(id = %slot.snapshot().id, "transfer cancelled");
    }

    /// Move a descriptor to a terminal state and release its coalescing key
    fn settle(&self, slot: &Slot, apply: impl FnOnce(&mut TransferDescriptor)) {
        let mut table = self.table();
        slot.descriptor.send_modify(apply);
        let snapshot = slot.snapshot();
        table.release_key(&snapshot);
        drop(table);
        self.publish(snapshot);
    }

    fn handle_failure(self: &Arc<Self>, slot: &Arc<Slot>, err: AttemptError) {
        let failures = slot.count_failure(err.kind);
        let retryable =
            self.retry.should_retry(err.kind, failures) && !self.shutdown.load(Ordering::SeqCst);
        let failure = TransferFailure {
            kind: err.kind,
            retryable,
            message: err.message.clone(),
        };

        if retryable {
            slot.descriptor.send_modify(|d| d.fail(failure));
            let snapshot = slot.snapshot();
            let delay = self.retry.delay_for_attempt(snapshot.attempts);
            warn!(
                id = %snapshot.id,
                hash = %snapshot.hash,
                kind = %err.kind,
                attempt = snapshot.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err.message,
                "transfer attempt failed, retrying"
            );
            self.publish(snapshot);
            self.schedule_retry(slot.clone(), delay);
            return;
        }

        self.settle(slot, |d| d.fail(failure));
        let snapshot = slot.snapshot();
        warn!(
            id = %snapshot.id,
            hash = %snapshot.hash,
            kind = %err.kind,
            attempts = snapshot.attempts,
            error = %err.message,
            "transfer failed"
        );
        if err.kind == TransferErrorKind::Unauthorized {
            self.mediator.publish(Message::AuthorizationFailed {
                hash: Some(snapshot.hash),
                reason: err.message,
            });
        }
    }

    /// Return a failed transfer to the queue after `delay` unless cancelled
    fn schedule_retry(self: &Arc<Self>, slot: Arc<Slot>, delay: std::time::Duration) {
        let shared = self.clone();
        tokio::spawn(async move {
            let cancelled = slot.cancelled.notified();
            tokio::pin!(cancelled);
            cancelled.as_mut().enable();

            if !slot.is_cancelled() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = &mut cancelled => {}
                }
            }
            shared.requeue(&slot);
        });
    }

    /// Put a backed-off transfer back in the queue, or settle it if it was
    /// cancelled while waiting
    fn requeue(&self, slot: &Slot) {
        let cancelled = slot.is_cancelled();
        let mut table = self.table();
        let changed = slot.descriptor.send_if_modified(|d| {
            if !matches!(&d.state, TransferState::Failed(f) if f.retryable) {
                return false;
            }
            if cancelled {
                d.cancel();
            } else {
                d.requeue();
            }
            true
        });
        if !changed {
            return;
        }
        let snapshot = slot.snapshot();
        if cancelled {
            table.release_key(&snapshot);
        } else {
            table.push(snapshot.id, snapshot.priority);
        }
        drop(table);

        self.publish(snapshot);
        if !cancelled {
            self.work_ready.notify_one();
        }
    }

    /// Returns true if this call moved the transfer toward `Cancelled`
    fn cancel_slot(&self, table: &mut Table, slot: &Slot) -> bool {
        if slot.is_terminal() {
            return false;
        }
        slot.signal_cancel();

        let mut was_queued = false;
        let settled = slot.descriptor.send_if_modified(|d| match &d.state {
            TransferState::Queued => {
                was_queued = true;
                d.cancel();
                true
            }
            TransferState::Failed(f) if f.retryable => {
                d.cancel();
                true
            }
            _ => false,
        });

        if settled {
            let snapshot = slot.snapshot();
            table.release_key(&snapshot);
            if was_queued {
                table.queued -= 1;
                self.capacity.notify_waiters();
            }
            debug!(id = %snapshot.id, "transfer cancelled");
            self.publish(snapshot);
        }
        true
    }

    fn release_peer(&self, table: &mut Table, slot: &Slot, peer: &PeerId) -> bool {
        let mut now_unwanted = false;
        slot.descriptor.send_if_modified(|d| {
            let before = d.peers.len();
            d.peers.retain(|p| p != peer);
            now_unwanted = before > 0 && d.peers.is_empty();
            d.peers.len() != before
        });
        now_unwanted && self.cancel_slot(table, slot)
    }
}

async fn worker_loop(shared: Arc<Shared>, index: usize) {
    debug!(worker = index, "transfer worker started");
    loop {
        let notified = shared.work_ready.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match shared.next_job() {
            Some(slot) => shared.run_job(slot).await,
            None => notified.await,
        }
    }
    debug!(worker = index, "transfer worker stopped");
}

// =============================================================================
// Handle
// =============================================================================

/// Requester's view of one transfer
#[derive(Debug, Clone)]
pub struct TransferHandle {
    id: TransferId,
    rx: watch::Receiver<TransferDescriptor>,
}

impl TransferHandle {
    fn new(id: TransferId, slot: &Slot) -> Self {
        Self {
            id,
            rx: slot.descriptor.subscribe(),
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn snapshot(&self) -> TransferDescriptor {
        self.rx.borrow().clone()
    }

    /// Resolve with the terminal snapshot
    pub async fn wait(&self) -> TransferDescriptor {
        let mut rx = self.rx.clone();
        let terminal = rx
            .wait_for(|d| d.state.is_terminal())
            .await
            .map(|d| d.clone());
        terminal.unwrap_or_else(|_| rx.borrow().clone())
    }

    /// Receiver that sees every descriptor change, byte progress included
    pub fn watch(&self) -> watch::Receiver<TransferDescriptor> {
        self.rx.clone()
    }
}
