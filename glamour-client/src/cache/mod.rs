//! Content-addressed file cache
//!
//! Layout under the cache root:
//!
//! ```text
//! objects/<first two hex chars>/<64 hex chars>   committed, read-only
//! staging/<hex>.<pid>.<seq>.part                 in-progress writes
//! ```
//!
//! Writes land in `staging/`, are hashed incrementally, and are only renamed
//! into `objects/` once the digest matches the declared hash. The rename is
//! done under a per-hash lock, so concurrent stores of the same content
//! commit exactly once and later writers observe the committed entry.
//! Readers never see a partial object: until the rename, `lookup` reports
//! `NotFound`.

mod locks;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use glamour_common::hash::compute_hash;
use glamour_common::{ContentHash, ContentHasher};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

pub use locks::HashGuard;
use locks::HashLocks;

use crate::constants::{BUFFER_SIZE, OBJECTS_DIR_NAME, PART_SUFFIX, STAGING_DIR_NAME};
use crate::error::CacheError;

/// Staged files untouched for this long are treated as leftovers of a crash
pub const STALE_STAGING_AGE: Duration = Duration::from_secs(60 * 60);

// =============================================================================
// Entry types
// =============================================================================

/// One committed cache object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub hash: ContentHash,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub last_access: DateTime<Utc>,
}

impl CacheEntry {
    fn from_metadata(hash: ContentHash, path: PathBuf, metadata: &fs::Metadata) -> Self {
        let last_access = metadata
            .accessed()
            .or_else(|_| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        Self {
            hash,
            path,
            size_bytes: metadata.len(),
            last_access: DateTime::<Utc>::from(last_access),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: u64,
    pub total_bytes: u64,
}

/// Result of re-hashing every cache object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub checked: u64,
    pub corrupted: Vec<ContentHash>,
}

// =============================================================================
// ContentCache
// =============================================================================

#[derive(Debug)]
pub struct ContentCache {
    root: PathBuf,
    objects: PathBuf,
    staging: PathBuf,
    locks: HashLocks,
    staging_seq: AtomicU64,
}

impl ContentCache {
    /// Open (creating if needed) the cache rooted at `root`
    ///
    /// Stale staging files left by an interrupted process are removed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        let objects = root.join(OBJECTS_DIR_NAME);
        let staging = root.join(STAGING_DIR_NAME);
        fs::create_dir_all(&objects)?;
        fs::create_dir_all(&staging)?;

        let cache = Self {
            root,
            objects,
            staging,
            locks: HashLocks::new(),
            staging_seq: AtomicU64::new(0),
        };
        let removed = cache.clean_staging(STALE_STAGING_AGE)?;
        if removed > 0 {
            info!(removed, root = %cache.root.display(), "removed stale staging files");
        }
        debug!(root = %cache.root.display(), "cache opened");
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn objects_dir(&self) -> &Path {
        &self.objects
    }

    /// Final location of `hash`, whether or not it exists
    pub fn object_path(&self, hash: &ContentHash) -> PathBuf {
        self.objects.join(hash.prefix()).join(hash.to_hex())
    }

    /// Path of the committed object for `hash`
    pub fn lookup(&self, hash: &ContentHash) -> Result<PathBuf, CacheError> {
        let path = self.object_path(hash);
        match fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => Ok(path),
            Ok(_) => Err(CacheError::NotFound { hash: *hash }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(CacheError::NotFound { hash: *hash })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.lookup(hash).is_ok()
    }

    /// Full entry for `hash`
    pub fn entry(&self, hash: &ContentHash) -> Result<CacheEntry, CacheError> {
        let path = self.lookup(hash)?;
        let metadata = fs::metadata(&path)?;
        Ok(CacheEntry::from_metadata(*hash, path, &metadata))
    }

    /// Lazily walk every committed object
    ///
    /// Each call starts a fresh walk.
    pub fn enumerate(&self) -> CacheIter {
        CacheIter {
            shards: fs::read_dir(&self.objects).ok(),
            current: None,
        }
    }

    /// Start a verified write of `hash`
    pub async fn begin_store(&self, hash: ContentHash) -> Result<StagedWrite<'_>, CacheError> {
        let seq = self.staging_seq.fetch_add(1, Ordering::Relaxed);
        let path = self.staging.join(format!(
            "{}.{}.{}{}",
            hash.to_hex(),
            std::process::id(),
            seq,
            PART_SUFFIX
        ));
        let file = tokio::fs::File::create(&path).await?;
        Ok(StagedWrite {
            cache: self,
            hash,
            path,
            file: Some(file),
            hasher: ContentHasher::new(),
            written: 0,
            finished: false,
        })
    }

    /// Store everything `reader` yields under `hash`
    ///
    /// Fails with `HashMismatch` (leaving the cache untouched) if the bytes
    /// do not hash to `hash`.
    pub async fn store<R>(&self, hash: ContentHash, mut reader: R) -> Result<CacheEntry, CacheError>
    where
        R: AsyncRead + Unpin,
    {
        let mut staged = self.begin_store(hash).await?;
        let mut buffer = vec![0u8; BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            staged.write(&buffer[..n]).await?;
        }
        staged.commit().await
    }

    /// Remove the object for `hash`
    ///
    /// Returns false if nothing was stored.
    pub async fn evict(&self, hash: &ContentHash) -> Result<bool, CacheError> {
        let _guard = self.lock_hash(*hash).await;
        let path = self.object_path(hash);
        if !path.exists() {
            return Ok(false);
        }
        #[cfg(not(unix))]
        {
            let mut perms = tokio::fs::metadata(&path).await?.permissions();
            perms.set_readonly(false);
            tokio::fs::set_permissions(&path, perms).await?;
        }
        tokio::fs::remove_file(&path).await?;
        info!(hash = %hash, "evicted from cache");
        Ok(true)
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let mut stats = CacheStats::default();
        for entry in self.enumerate() {
            let entry = entry?;
            stats.entries += 1;
            stats.total_bytes += entry.size_bytes;
        }
        Ok(stats)
    }

    /// Re-hash every object and report the ones whose content changed
    pub async fn verify(&self) -> Result<VerifyReport, CacheError> {
        let mut report = VerifyReport::default();
        for entry in self.enumerate() {
            let entry = entry?;
            report.checked += 1;
            let actual = compute_hash(&entry.path).await?;
            if actual != entry.hash {
                warn!(hash = %entry.hash, actual = %actual, "corrupted cache object");
                report.corrupted.push(entry.hash);
            }
        }
        Ok(report)
    }

    /// Exclusive access to `hash` for commit or relinking
    pub async fn lock_hash(&self, hash: ContentHash) -> HashGuard {
        self.locks.lock(hash).await
    }

    /// Remove staging files older than `max_age`; returns how many
    fn clean_staging(&self, max_age: Duration) -> Result<usize, CacheError> {
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in fs::read_dir(&self.staging)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age >= max_age && fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

// =============================================================================
// StagedWrite
// =============================================================================

/// In-progress write of one object
///
/// Dropping it without calling [`StagedWrite::commit`] discards the staged
/// bytes.
pub struct StagedWrite<'a> {
    cache: &'a ContentCache,
    hash: ContentHash,
    path: PathBuf,
    file: Option<tokio::fs::File>,
    hasher: ContentHasher,
    written: u64,
    finished: bool,
}

impl StagedWrite<'_> {
    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), CacheError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("staged write already closed"))?;
        file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Verify the digest and atomically promote the staged file
    ///
    /// If another writer committed the same hash first, the staged copy is
    /// discarded and the existing entry returned.
    pub async fn commit(mut self) -> Result<CacheEntry, CacheError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_data().await?;
        }

        let actual = std::mem::take(&mut self.hasher).finalize();
        if actual != self.hash {
            self.remove_staged().await;
            return Err(CacheError::HashMismatch {
                expected: self.hash,
                actual,
            });
        }

        let _guard = self.cache.lock_hash(self.hash).await;
        let dest = self.cache.object_path(&self.hash);

        if tokio::fs::try_exists(&dest).await? {
            debug!(hash = %self.hash, "already committed, discarding staged copy");
            self.remove_staged().await;
            return self.cache.entry(&self.hash);
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        set_readonly(&self.path).await?;
        tokio::fs::rename(&self.path, &dest).await?;
        self.finished = true;

        info!(hash = %self.hash, bytes = self.written, "committed to cache");
        self.cache.entry(&self.hash)
    }

    /// Drop the staged bytes without committing
    pub async fn discard(mut self) {
        self.file.take();
        self.remove_staged().await;
    }

    async fn remove_staged(&mut self) {
        self.finished = true;
        if let Err(e) = tokio::fs::remove_file(&self.path).await
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to remove staged file");
        }
    }
}

impl Drop for StagedWrite<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.file.take();
            let _ = fs::remove_file(&self.path);
        }
    }
}

async fn set_readonly(path: &Path) -> io::Result<()> {
    let mut perms = tokio::fs::metadata(path).await?.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o444);
    }
    #[cfg(not(unix))]
    perms.set_readonly(true);
    tokio::fs::set_permissions(path, perms).await
}

// =============================================================================
// CacheIter
// =============================================================================

/// Lazy walk over `objects/<shard>/<hash>`
///
/// Files whose names are not valid hashes are skipped.
pub struct CacheIter {
    shards: Option<fs::ReadDir>,
    current: Option<fs::ReadDir>,
}

impl Iterator for CacheIter {
    type Item = Result<CacheEntry, CacheError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(files) = self.current.as_mut() {
                match files.next() {
                    Some(Ok(entry)) => {
                        let Some(hash) = entry
                            .file_name()
                            .to_str()
                            .and_then(|name| name.parse::<ContentHash>().ok())
                        else {
                            continue;
                        };
                        return Some(
                            entry
                                .metadata()
                                .map(|m| CacheEntry::from_metadata(hash, entry.path(), &m))
                                .map_err(CacheError::from),
                        );
                    }
                    Some(Err(e)) => return Some(Err(e.into())),
                    None => self.current = None,
                }
            }

            match self.shards.as_mut()?.next()? {
                Ok(shard) => {
                    let path = shard.path();
                    if !path.is_dir() {
                        continue;
                    }
                    match fs::read_dir(&path) {
                        Ok(files) => self.current = Some(files),
                        Err(e) => return Some(Err(e.into())),
                    }
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open() -> (TempDir, ContentCache) {
        let dir = TempDir::new().unwrap();
        let cache = ContentCache::open(dir.path()).unwrap();
        (dir, cache)
    }

    fn staging_files(cache: &ContentCache) -> usize {
        fs::read_dir(&cache.staging).unwrap().count()
    }

    #[tokio::test]
    async fn test_store_and_lookup() {
        let (_dir, cache) = open();
        let data = b"appearance data";
        let hash = ContentHash::of(data);

        let entry = cache.store(hash, &data[..]).await.unwrap();
        assert_eq!(entry.hash, hash);
        assert_eq!(entry.size_bytes, data.len() as u64);
        assert_eq!(cache.lookup(&hash).unwrap(), cache.object_path(&hash));
        assert_eq!(fs::read(&entry.path).unwrap(), data);
        assert!(cache.contains(&hash));
        assert_eq!(staging_files(&cache), 0);
    }

    #[tokio::test]
    async fn test_lookup_missing() {
        let (_dir, cache) = open();
        let hash = ContentHash::of(b"nope");
        assert!(matches!(
            cache.lookup(&hash),
            Err(CacheError::NotFound { hash: h }) if h == hash
        ));
    }

    #[tokio::test]
    async fn test_mismatch_leaves_cache_unchanged() {
        let (_dir, cache) = open();
        let declared = ContentHash::of(b"expected");

        let err = cache.store(declared, &b"tampered"[..]).await.unwrap_err();
        match err {
            CacheError::HashMismatch { expected, actual } => {
                assert_eq!(expected, declared);
                assert_eq!(actual, ContentHash::of(b"tampered"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!cache.contains(&declared));
        assert_eq!(cache.enumerate().count(), 0);
        assert_eq!(staging_files(&cache), 0);
    }

    #[tokio::test]
    async fn test_uncommitted_write_is_invisible() {
        let (_dir, cache) = open();
        let data = b"partial";
        let hash = ContentHash::of(data);

        let mut staged = cache.begin_store(hash).await.unwrap();
        staged.write(&data[..3]).await.unwrap();
        assert!(!cache.contains(&hash));

        staged.write(&data[3..]).await.unwrap();
        staged.commit().await.unwrap();
        assert!(cache.contains(&hash));
    }

    #[tokio::test]
    async fn test_dropped_write_is_discarded() {
        let (_dir, cache) = open();
        let hash = ContentHash::of(b"abc");
        {
            let mut staged = cache.begin_store(hash).await.unwrap();
            staged.write(b"ab").await.unwrap();
            assert_eq!(staging_files(&cache), 1);
        }
        assert_eq!(staging_files(&cache), 0);
        assert!(!cache.contains(&hash));
    }

    #[tokio::test]
    async fn test_concurrent_stores_commit_once() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(ContentCache::open(dir.path()).unwrap());
        let data = vec![7u8; 200_000];
        let hash = ContentHash::of(&data);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let data = data.clone();
            tasks.push(tokio::spawn(async move {
                cache.store(hash, &data[..]).await.unwrap()
            }));
        }
        for task in tasks {
            let entry = task.await.unwrap();
            assert_eq!(entry.path, cache.object_path(&hash));
        }

        let entries: Vec<_> = cache.enumerate().collect::<Result<_, _>>().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(staging_files(&cache), 0);
    }

    #[tokio::test]
    async fn test_enumerate_is_restartable() {
        let (_dir, cache) = open();
        let mut expected = HashSet::new();
        for data in [&b"a"[..], b"b", b"c"] {
            expected.insert(cache.store(ContentHash::of(data), data).await.unwrap().hash);
        }
        fs::write(cache.objects.join("README"), "not an object").unwrap();

        for _ in 0..2 {
            let seen: HashSet<_> = cache.enumerate().map(|e| e.unwrap().hash).collect();
            assert_eq!(seen, expected);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_committed_objects_are_readonly() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, cache) = open();
        let entry = cache.store(ContentHash::of(b"ro"), &b"ro"[..]).await.unwrap();
        let mode = fs::metadata(&entry.path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o444);
    }

    #[tokio::test]
    async fn test_stats_and_evict() {
        let (_dir, cache) = open();
        let a = ContentHash::of(b"aaaa");
        cache.store(a, &b"aaaa"[..]).await.unwrap();
        cache.store(ContentHash::of(b"bb"), &b"bb"[..]).await.unwrap();

        assert_eq!(
            cache.stats().unwrap(),
            CacheStats {
                entries: 2,
                total_bytes: 6
            }
        );

        assert!(cache.evict(&a).await.unwrap());
        assert!(!cache.evict(&a).await.unwrap());
        assert!(!cache.contains(&a));
        assert_eq!(cache.stats().unwrap().entries, 1);
    }

    #[tokio::test]
    async fn test_verify_detects_corruption() {
        let (_dir, cache) = open();
        let good = ContentHash::of(b"good");
        let bad = ContentHash::of(b"bad");
        cache.store(good, &b"good"[..]).await.unwrap();
        let entry = cache.store(bad, &b"bad"[..]).await.unwrap();

        let mut perms = fs::metadata(&entry.path).unwrap().permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        fs::set_permissions(&entry.path, perms).unwrap();
        fs::write(&entry.path, b"rot").unwrap();

        let report = cache.verify().await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.corrupted, vec![bad]);
    }

    #[test]
    fn test_open_removes_stale_staging() {
        let dir = TempDir::new().unwrap();
        let staging = dir.path().join(STAGING_DIR_NAME);
        fs::create_dir_all(&staging).unwrap();

        let stale = staging.join("stale.part");
        fs::write(&stale, b"x").unwrap();
        let old = SystemTime::now() - STALE_STAGING_AGE - Duration::from_secs(60);
        fs::File::options()
            .write(true)
            .open(&stale)
            .unwrap()
            .set_modified(old)
            .unwrap();
        let fresh = staging.join("fresh.part");
        fs::write(&fresh, b"y").unwrap();

        ContentCache::open(dir.path()).unwrap();
        assert!(!stale.exists());
        assert!(fresh.exists());
    }
}
