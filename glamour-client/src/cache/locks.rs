//! Per-hash async locks
//!
//! Writers to the same hash are serialized; unrelated hashes never contend.
//! Entries are held weakly. Dead entries are swept once the table doubles in
//! size since the last sweep, so inserts stay amortized O(1).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use glamour_common::ContentHash;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Guard for one hash; the lock is released on drop
pub type HashGuard = OwnedMutexGuard<()>;

/// Table size below which dead entries are never swept
const MIN_SWEEP_LEN: usize = 64;

#[derive(Debug)]
struct LockTable {
    entries: HashMap<ContentHash, Weak<AsyncMutex<()>>>,
    sweep_at: usize,
}

impl Default for LockTable {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            sweep_at: MIN_SWEEP_LEN,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct HashLocks {
    locks: Mutex<LockTable>,
}

impl HashLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `hash`
    pub(crate) async fn lock(&self, hash: ContentHash) -> HashGuard {
        self.handle(hash).lock_owned().await
    }

    fn handle(&self, hash: ContentHash) -> Arc<AsyncMutex<()>> {
        let mut table = self.locks.lock().expect("hash lock table poisoned");
        if let Some(existing) = table.entries.get(&hash).and_then(Weak::upgrade) {
            return existing;
        }
        if table.entries.len() >= table.sweep_at {
            table.entries.retain(|_, weak| weak.strong_count() > 0);
            table.sweep_at = (table.entries.len() * 2).max(MIN_SWEEP_LEN);
        }
        let lock = Arc::new(AsyncMutex::new(()));
        table.entries.insert(hash, Arc::downgrade(&lock));
        lock
    }

    #[cfg(test)]
    fn live_entries(&self) -> usize {
        let table = self.locks.lock().expect("hash lock table poisoned");
        table.entries.values().filter(|w| w.strong_count() > 0).count()
    }

    #[cfg(test)]
    fn table_len(&self) -> usize {
        self.locks.lock().expect("hash lock table poisoned").entries.len()
    }
}
