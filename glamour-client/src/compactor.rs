//! Hardlink deduplication of cache objects and mod directories
//!
//! A pass walks the cache's `objects/` tree plus any configured mod
//! directories, groups byte-identical files and replaces duplicates with
//! hard links to one canonical copy (the cache object when there is one).
//! Hash-to-content mappings never change; only inodes are shared.
//!
//! Scanning and hashing run on the blocking pool. The per-hash cache lock is
//! held only around the link-and-rename of a single file.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use glamour_common::ContentHash;
use glamour_common::hash::compute_hash_sync;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cache::ContentCache;
use crate::config::CompactorSettings;
use crate::error::CompactError;
use crate::mediator::{Mediator, Message};

/// Suffix of the temporary link created next to a file being replaced
const LINK_TEMP_SUFFIX: &str = ".glamour-link";

/// Outcome of one compaction pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Regular, non-empty files examined
    pub scanned_files: u64,
    /// Sets of byte-identical files on one device with more than one inode
    pub duplicate_groups: u64,
    /// Files replaced by a hard link
    pub linked: u64,
    pub bytes_reclaimed: u64,
    /// Files left alone after an error or a concurrent change
    pub skipped: u64,
}

/// Inode identity; `None` where the platform does not expose one
type FileId = Option<(u64, u64)>;

/// Result of one attempt to replace a duplicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkOutcome {
    Linked,
    /// A file changed since it was scanned
    Changed,
    /// The canonical copy no longer hashes to the group's hash
    Corrupted,
}

#[derive(Debug, Clone)]
struct ScannedFile {
    path: PathBuf,
    size: u64,
    modified: Option<SystemTime>,
    device: u64,
    id: FileId,
    /// Known hash for cache objects (taken from the file name)
    known_hash: Option<ContentHash>,
}

#[derive(Debug)]
struct DuplicateGroup {
    hash: ContentHash,
    canonical: PathBuf,
    duplicates: Vec<ScannedFile>,
}

#[derive(Debug, Default)]
struct ScanResult {
    scanned: u64,
    unreadable: u64,
    groups: Vec<DuplicateGroup>,
}

pub struct FileCompactor {
    cache: Arc<ContentCache>,
    settings: CompactorSettings,
    mediator: Option<Mediator>,
}

impl FileCompactor {
    pub fn new(
        cache: Arc<ContentCache>,
        settings: CompactorSettings,
        mediator: Option<Mediator>,
    ) -> Self {
        Self {
            cache,
            settings,
            mediator,
        }
    }

    /// Directories walked by a pass, cache objects first
    pub fn roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![self.cache.objects_dir().to_path_buf()];
        roots.extend(self.settings.extra_dirs.iter().cloned());
        roots
    }

    /// Run a single compaction pass
    pub async fn run_once(&self) -> Result<CompactionReport, CompactError> {
        let roots = self.roots();
        let objects = self.cache.objects_dir().to_path_buf();
        let scan = tokio::task::spawn_blocking(move || scan(&roots, &objects))
            .await
            .map_err(|e| CompactError::Task(e.to_string()))??;

        let mut report = CompactionReport {
            scanned_files: scan.scanned,
            duplicate_groups: scan.groups.len() as u64,
            skipped: scan.unreadable,
            ..Default::default()
        };

        for group in scan.groups {
            let mut reclaimed: HashSet<FileId> = HashSet::new();
            for duplicate in &group.duplicates {
                if self.relink(group.hash, &group.canonical, duplicate).await {
                    report.linked += 1;
                    if duplicate.id.is_none() || reclaimed.insert(duplicate.id) {
                        report.bytes_reclaimed += duplicate.size;
                    }
                } else {
                    report.skipped += 1;
                }
            }
        }

        info!(
            scanned = report.scanned_files,
            groups = report.duplicate_groups,
            linked = report.linked,
            reclaimed = report.bytes_reclaimed,
            skipped = report.skipped,
            "compaction pass finished"
        );
        if let Some(mediator) = &self.mediator {
            mediator.publish(Message::CompactionFinished(report.clone()));
        }
        Ok(report)
    }

    /// Run passes on the configured interval until the task is aborted
    ///
    /// The first pass happens one interval after spawning. Returns `None`
    /// when compaction is disabled.
    pub fn spawn(self: Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.settings.enabled {
            info!("compaction disabled");
            return None;
        }
        Some(tokio::spawn(async move {
            let period = self.settings.interval().max(Duration::from_secs(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    warn!(error = %e, "compaction pass failed");
                }
            }
        }))
    }

    /// Replace `duplicate` with a hard link to `canonical`
    ///
    /// Returns false if the file was skipped.
    async fn relink(
        &self,
        hash: ContentHash,
        canonical: &Path,
        duplicate: &ScannedFile,
    ) -> bool {
        let attempts = self.settings.max_fs_retries.max(1);
        for attempt in 1..=attempts {
            let result = {
                let _guard = self.cache.lock_hash(hash).await;
                let canonical = canonical.to_path_buf();
                let duplicate = duplicate.clone();
                tokio::task::spawn_blocking(move || link_over(hash, &canonical, &duplicate)).await
            };

            match result {
                Ok(Ok(LinkOutcome::Linked)) => {
                    debug!(hash = %hash, path = %duplicate.path.display(), "relinked");
                    return true;
                }
                Ok(Ok(LinkOutcome::Changed)) => {
                    debug!(path = %duplicate.path.display(), "changed during compaction, skipped");
                    return false;
                }
                Ok(Ok(LinkOutcome::Corrupted)) => {
                    warn!(
                        hash = %hash,
                        canonical = %canonical.display(),
                        "canonical copy does not match its hash, group skipped"
                    );
                    return false;
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::CrossesDevices => {
                    debug!(path = %duplicate.path.display(), "on another device, skipped");
                    return false;
                }
                Ok(Err(e)) => {
                    warn!(
                        path = %duplicate.path.display(),
                        attempt,
                        error = %e,
                        "relink failed"
                    );
                }
                Err(e) => {
                    warn!(path = %duplicate.path.display(), error = %e, "relink task failed");
                    return false;
                }
            }
        }
        warn!(path = %duplicate.path.display(), attempts, "giving up on file");
        false
    }
}

// =============================================================================
// Scan
// =============================================================================

fn scan(roots: &[PathBuf], objects: &Path) -> Result<ScanResult, CompactError> {
    let mut result = ScanResult::default();
    let mut by_size: HashMap<u64, Vec<ScannedFile>> = HashMap::new();

    for root in roots {
        if !root.is_dir() {
            warn!(path = %root.display(), "compaction root missing, skipped");
            continue;
        }
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => {
                    return Err(CompactError::Scan {
                        path: root.clone(),
                        source: e
                            .into_io_error()
                            .unwrap_or_else(|| io::Error::other("walk failed")),
                    });
                }
                Err(e) => {
                    debug!(error = %e, "unreadable entry, skipped");
                    continue;
                }
            };
            if !entry.file_type().is_file() || is_temp_link(entry.path()) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    debug!(path = %entry.path().display(), error = %e, "no metadata, skipped");
                    continue;
                }
            };
            if metadata.len() == 0 {
                continue;
            }

            let path = entry.into_path();
            let known_hash = if path.starts_with(objects) {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .and_then(|name| name.parse().ok())
            } else {
                None
            };
            result.scanned += 1;
            by_size
                .entry(metadata.len())
                .or_default()
                .push(ScannedFile {
                    size: metadata.len(),
                    modified: metadata.modified().ok(),
                    device: device_of(&metadata),
                    id: file_id(&metadata),
                    known_hash,
                    path,
                });
        }
    }

    for (_, candidates) in by_size {
        if candidates.len() < 2 {
            continue;
        }
        let mut by_hash: HashMap<(ContentHash, u64), Vec<ScannedFile>> = HashMap::new();
        for file in candidates {
            let hash = match file.known_hash {
                Some(hash) => hash,
                None => match compute_hash_sync(&file.path) {
                    Ok(hash) => hash,
                    Err(e) => {
                        debug!(path = %file.path.display(), error = %e, "hash failed, skipped");
                        result.unreadable += 1;
                        continue;
                    }
                },
            };
            by_hash.entry((hash, file.device)).or_default().push(file);
        }

        for ((hash, _), files) in by_hash {
            if let Some(group) = plan_group(hash, files) {
                result.groups.push(group);
            }
        }
    }

    Ok(result)
}

/// Pick the canonical copy and list the files that do not share its inode
fn plan_group(hash: ContentHash, mut files: Vec<ScannedFile>) -> Option<DuplicateGroup> {
    if files.len() < 2 {
        return None;
    }
    files.sort_by(|a, b| {
        b.known_hash
            .is_some()
            .cmp(&a.known_hash.is_some())
            .then_with(|| a.path.cmp(&b.path))
    });

    let canonical = files.remove(0);
    let duplicates: Vec<_> = files
        .into_iter()
        .filter(|f| canonical.id.is_none() || f.id != canonical.id)
        .collect();
    if duplicates.is_empty() {
        return None;
    }
    Some(DuplicateGroup {
        hash,
        canonical: canonical.path,
        duplicates,
    })
}

// =============================================================================
// Filesystem helpers
// =============================================================================

/// Atomically replace `target` with a hard link to `canonical`
///
/// Nothing is touched if either file changed since it was scanned or if
/// `canonical` no longer hashes to `hash`. Cache objects are grouped by
/// file name, so their content is only checked here.
fn link_over(
    hash: ContentHash,
    canonical: &Path,
    target: &ScannedFile,
) -> io::Result<LinkOutcome> {
    let current = fs::symlink_metadata(&target.path)?;
    if !current.is_file()
        || current.len() != target.size
        || current.modified().ok() != target.modified
    {
        return Ok(LinkOutcome::Changed);
    }
    if fs::metadata(canonical)?.len() != target.size {
        return Ok(LinkOutcome::Changed);
    }
    if compute_hash_sync(canonical)? != hash {
        return Ok(LinkOutcome::Corrupted);
    }

    let temp = temp_link_path(&target.path);
    let _ = fs::remove_file(&temp);
    fs::hard_link(canonical, &temp)?;
    if let Err(e) = fs::rename(&temp, &target.path) {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }
    Ok(LinkOutcome::Linked)
}

fn temp_link_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(LINK_TEMP_SUFFIX);
    path.with_file_name(name)
}

fn is_temp_link(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(LINK_TEMP_SUFFIX))
}

#[cfg(unix)]
fn device_of(metadata: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.dev()
}

#[cfg(not(unix))]
fn device_of(_metadata: &fs::Metadata) -> u64 {
    0
}

#[cfg(unix)]
fn file_id(metadata: &fs::Metadata) -> FileId {
    use std::os::unix::fs::MetadataExt;
    Some((metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
fn file_id(_metadata: &fs::Metadata) -> FileId {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediatorSettings;
    use crate::mediator::MessageKind;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        cache: Arc<ContentCache>,
        mods: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(ContentCache::open(dir.path().join("cache")).unwrap());
        let mods = dir.path().join("mods");
        fs::create_dir_all(&mods).unwrap();
        Fixture { dir, cache, mods }
    }

    fn compactor(fx: &Fixture, mediator: Option<Mediator>) -> FileCompactor {
        let settings = CompactorSettings {
            extra_dirs: vec![fx.mods.clone()],
            ..Default::default()
        };
        FileCompactor::new(fx.cache.clone(), settings, mediator)
    }

    #[cfg(unix)]
    fn same_inode(a: &Path, b: &Path) -> bool {
        use std::os::unix::fs::MetadataExt;
        let (a, b) = (fs::metadata(a).unwrap(), fs::metadata(b).unwrap());
        a.dev() == b.dev() && a.ino() == b.ino()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_mod_copies_link_to_cache_object() {
        let fx = fixture();
        let data = b"shared texture".repeat(100);
        let entry = fx
            .cache
            .store(ContentHash::of(&data), &data[..])
            .await
            .unwrap();
        let copy_a = fx.mods.join("a.tex");
        let copy_b = fx.mods.join("nested").join("b.tex");
        fs::create_dir_all(copy_b.parent().unwrap()).unwrap();
        fs::write(&copy_a, &data).unwrap();
        fs::write(&copy_b, &data).unwrap();
        fs::write(fx.mods.join("other.tex"), b"unrelated").unwrap();

        let report = compactor(&fx, None).run_once().await.unwrap();

        assert_eq!(report.scanned_files, 4);
        assert_eq!(report.duplicate_groups, 1);
        assert_eq!(report.linked, 2);
        assert_eq!(report.bytes_reclaimed, 2 * data.len() as u64);
        assert!(same_inode(&entry.path, &copy_a));
        assert!(same_inode(&entry.path, &copy_b));
        assert_eq!(fs::read(&copy_a).unwrap(), data);
        assert!(fx.cache.contains(&entry.hash));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_second_pass_is_a_no_op() {
        let fx = fixture();
        fs::write(fx.mods.join("one.bin"), b"same bytes").unwrap();
        fs::write(fx.mods.join("two.bin"), b"same bytes").unwrap();

        let compactor = compactor(&fx, None);
        let first = compactor.run_once().await.unwrap();
        assert_eq!(first.linked, 1);
        assert!(same_inode(&fx.mods.join("one.bin"), &fx.mods.join("two.bin")));

        let second = compactor.run_once().await.unwrap();
        assert_eq!(second.duplicate_groups, 0);
        assert_eq!(second.linked, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_corrupted_cache_object_is_not_linked_over_mod_file() {
        use std::os::unix::fs::PermissionsExt;

        let fx = fixture();
        let entry = fx.cache.store(ContentHash::of(b"bad"), &b"bad"[..]).await.unwrap();
        fs::set_permissions(&entry.path, fs::Permissions::from_mode(0o644)).unwrap();
        fs::write(&entry.path, b"rot").unwrap();
        let intact = fx.mods.join("intact.tex");
        fs::write(&intact, b"bad").unwrap();

        let report = compactor(&fx, None).run_once().await.unwrap();

        assert_eq!(report.duplicate_groups, 1);
        assert_eq!(report.linked, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(fs::read(&intact).unwrap(), b"bad");
        assert!(!same_inode(&entry.path, &intact));
    }

    #[tokio::test]
    async fn test_same_size_different_content_untouched() {
        let fx = fixture();
        fs::write(fx.mods.join("a.bin"), b"aaaa").unwrap();
        fs::write(fx.mods.join("b.bin"), b"bbbb").unwrap();
        fs::write(fx.mods.join("empty1"), b"").unwrap();
        fs::write(fx.mods.join("empty2"), b"").unwrap();

        let report = compactor(&fx, None).run_once().await.unwrap();
        assert_eq!(report.scanned_files, 2);
        assert_eq!(report.duplicate_groups, 0);
        assert_eq!(fs::read(fx.mods.join("a.bin")).unwrap(), b"aaaa");
    }

    #[test]
    fn test_changed_file_is_not_replaced() {
        let fx = fixture();
        let canonical = fx.mods.join("canonical");
        let target = fx.mods.join("target");
        fs::write(&canonical, b"content").unwrap();
        fs::write(&target, b"content").unwrap();

        let stale = ScannedFile {
            path: target.clone(),
            size: 7,
            modified: Some(SystemTime::UNIX_EPOCH),
            device: 0,
            id: None,
            known_hash: None,
        };
        assert_eq!(
            link_over(ContentHash::of(b"content"), &canonical, &stale).unwrap(),
            LinkOutcome::Changed
        );
        assert_eq!(fs::read(&target).unwrap(), b"content");
        assert!(!temp_link_path(&target).exists());
    }

    #[tokio::test]
    async fn test_missing_extra_dir_is_skipped() {
        let fx = fixture();
        let settings = CompactorSettings {
            extra_dirs: vec![fx.dir.path().join("absent")],
            ..Default::default()
        };
        let report = FileCompactor::new(fx.cache.clone(), settings, None)
            .run_once()
            .await
            .unwrap();
        assert_eq!(report, CompactionReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_pass_runs_after_interval() {
        let fx = fixture();
        let mediator = Mediator::new(&MediatorSettings::default());
        let seen = Arc::new(Mutex::new(0));
        let subscriber = mediator.register("test");
        let sink = seen.clone();
        subscriber.subscribe(MessageKind::CompactionFinished, move |_| {
            *sink.lock().unwrap() += 1;
        });
        mediator.start();
        let settings = CompactorSettings {
            interval_secs: 60,
            extra_dirs: vec![fx.mods.clone()],
            ..Default::default()
        };
        let compactor = FileCompactor::new(fx.cache.clone(), settings, Some(mediator.clone()));
        let task = Arc::new(compactor).spawn().unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        mediator.flush().await;
        assert_eq!(*seen.lock().unwrap(), 0);

        for _ in 0..600 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            mediator.flush().await;
            if *seen.lock().unwrap() > 0 {
                break;
            }
        }
        assert!(*seen.lock().unwrap() >= 1);
        task.abort();
    }

    #[tokio::test]
    async fn test_disabled_compactor_does_not_spawn() {
        let fx = fixture();
        let settings = CompactorSettings {
            enabled: false,
            ..Default::default()
        };
        assert!(
            Arc::new(FileCompactor::new(fx.cache.clone(), settings, None))
                .spawn()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_publishes_report() {
        let fx = fixture();
        let mediator = Mediator::new(&MediatorSettings::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscriber = mediator.register("test");
        let sink = seen.clone();
        subscriber.subscribe(MessageKind::CompactionFinished, move |msg| {
            if let Message::CompactionFinished(report) = msg {
                sink.lock().unwrap().push(report.clone());
            }
        });
        mediator.start();

        let report = compactor(&fx, Some(mediator.clone()))
            .run_once()
            .await
            .unwrap();
        mediator.flush().await;
        assert_eq!(*seen.lock().unwrap(), vec![report]);
    }
}
