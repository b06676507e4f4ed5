//! Sync engine configuration
//!
//! Stored as `config.json` in the platform config directory. Every field is
//! defaulted so partial files (or no file at all) load cleanly.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{APP_DIR_NAME, CONFIG_FILE_NAME};
use crate::error::ConfigError;

// =============================================================================
// Transfer Settings
// =============================================================================

/// Default number of concurrent transfer workers
pub const DEFAULT_PARALLEL_TRANSFERS: usize = 4;

/// Default backlog of queued descriptors before `QueueFull`
pub const DEFAULT_QUEUE_LIMIT: usize = 256;

/// Default upload chunk size (256KB)
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Default connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Default per-read timeout in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 60_000;

/// Default per-write timeout in milliseconds
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 60_000;

/// Worker pool and per-step I/O limits
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TransferSettings {
    /// Maximum concurrent transfers (minimum 1)
    #[serde(default = "default_parallel_transfers")]
    pub parallel_transfers: usize,

    /// Maximum queued descriptors; further enqueues fail with `QueueFull`
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,

    /// Bytes per upload chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Global bandwidth cap shared by all workers (0 = unlimited)
    #[serde(default)]
    pub bandwidth_limit_bytes_per_sec: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl TransferSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            parallel_transfers: DEFAULT_PARALLEL_TRANSFERS,
            queue_limit: DEFAULT_QUEUE_LIMIT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            bandwidth_limit_bytes_per_sec: 0,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
        }
    }
}

fn default_parallel_transfers() -> usize {
    DEFAULT_PARALLEL_TRANSFERS
}

fn default_queue_limit() -> usize {
    DEFAULT_QUEUE_LIMIT
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT_MS
}

fn default_write_timeout_ms() -> u64 {
    DEFAULT_WRITE_TIMEOUT_MS
}

// =============================================================================
// Retry Settings
// =============================================================================

/// Default attempts for network failures (first attempt included)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default attempts when received bytes fail verification
pub const DEFAULT_MAX_HASH_MISMATCH_ATTEMPTS: u32 = 2;

/// Default attempts for local filesystem failures
pub const DEFAULT_MAX_FILESYSTEM_ATTEMPTS: u32 = 3;

pub const DEFAULT_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_JITTER: f64 = 0.2;

/// Backoff and per-kind attempt ceilings
///
/// Each ceiling counts the first attempt, so `max_attempts = 1` disables
/// retries for that kind.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_max_hash_mismatch_attempts")]
    pub max_hash_mismatch_attempts: u32,

    #[serde(default = "default_max_filesystem_attempts")]
    pub max_filesystem_attempts: u32,

    /// Delay before the first retry; doubles each attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on a single backoff delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Fraction of the delay randomised in either direction (0.0 to 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_hash_mismatch_attempts: DEFAULT_MAX_HASH_MISMATCH_ATTEMPTS,
            max_filesystem_attempts: DEFAULT_MAX_FILESYSTEM_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: DEFAULT_JITTER,
        }
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_max_hash_mismatch_attempts() -> u32 {
    DEFAULT_MAX_HASH_MISMATCH_ATTEMPTS
}

fn default_max_filesystem_attempts() -> u32 {
    DEFAULT_MAX_FILESYSTEM_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

fn default_jitter() -> f64 {
    DEFAULT_JITTER
}

// =============================================================================
// Compactor Settings
// =============================================================================

/// Default time between compaction passes (1 hour)
pub const DEFAULT_COMPACT_INTERVAL_SECS: u64 = 60 * 60;

/// Default filesystem retries per file before it is skipped
pub const DEFAULT_COMPACT_FS_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CompactorSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_compact_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_compact_fs_retries")]
    pub max_fs_retries: u32,

    /// Mod directories scanned alongside the cache
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_dirs: Vec<PathBuf>,
}

impl CompactorSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for CompactorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_COMPACT_INTERVAL_SECS,
            max_fs_retries: DEFAULT_COMPACT_FS_RETRIES,
            extra_dirs: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_compact_interval_secs() -> u64 {
    DEFAULT_COMPACT_INTERVAL_SECS
}

fn default_compact_fs_retries() -> u32 {
    DEFAULT_COMPACT_FS_RETRIES
}

// =============================================================================
// Mediator / Download Settings
// =============================================================================

/// Handlers slower than this are logged (milliseconds)
pub const DEFAULT_SLOW_HANDLER_MS: u64 = 100;

/// Minimum time between progress events for one manifest (milliseconds)
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 250;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MediatorSettings {
    #[serde(default = "default_slow_handler_ms")]
    pub slow_handler_threshold_ms: u64,
}

impl MediatorSettings {
    pub fn slow_handler_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_handler_threshold_ms)
    }
}

impl Default for MediatorSettings {
    fn default() -> Self {
        Self {
            slow_handler_threshold_ms: DEFAULT_SLOW_HANDLER_MS,
        }
    }
}

fn default_slow_handler_ms() -> u64 {
    DEFAULT_SLOW_HANDLER_MS
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DownloadSettings {
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

impl DownloadSettings {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
        }
    }
}

fn default_progress_interval_ms() -> u64 {
    DEFAULT_PROGRESS_INTERVAL_MS
}

// =============================================================================
// SyncConfig
// =============================================================================

/// Top-level configuration for the sync engine
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SyncConfig {
    /// Cache root; defaults to the platform cache directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    #[serde(default)]
    pub transfers: TransferSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub compactor: CompactorSettings,

    #[serde(default)]
    pub mediator: MediatorSettings,

    #[serde(default)]
    pub downloads: DownloadSettings,
}

impl SyncConfig {
    /// Platform-specific config file path
    ///
    /// Returns None if the config directory cannot be determined.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Platform-specific cache root
    pub fn default_cache_dir() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join(APP_DIR_NAME))
    }

    /// Load configuration from `path`
    ///
    /// A missing file yields the defaults; unreadable or invalid JSON is an
    /// error so a typo never silently resets limits.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };

        let mut config: Self =
            serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: e,
            })?;
        config.normalize();
        Ok(config)
    }

    /// Resolved cache root (configured, else platform default)
    pub fn resolved_cache_dir(&self) -> Option<PathBuf> {
        self.cache_dir.clone().or_else(Self::default_cache_dir)
    }

    /// Clamp values that would stall the engine
    fn normalize(&mut self) {
        self.transfers.parallel_transfers = self.transfers.parallel_transfers.max(1);
        self.transfers.chunk_size = self.transfers.chunk_size.max(1);
        self.retry.max_attempts = self.retry.max_attempts.max(1);
        self.retry.max_hash_mismatch_attempts = self.retry.max_hash_mismatch_attempts.max(1);
        self.retry.max_filesystem_attempts = self.retry.max_filesystem_attempts.max(1);
        self.retry.jitter = self.retry.jitter.clamp(0.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = SyncConfig::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"transfers": {"parallel_transfers": 2}, "retry": {"max_attempts": 3}}"#,
        )
        .unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.transfers.parallel_transfers, 2);
        assert_eq!(config.transfers.queue_limit, DEFAULT_QUEUE_LIMIT);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(
            config.retry.max_hash_mismatch_attempts,
            DEFAULT_MAX_HASH_MISMATCH_ATTEMPTS
        );
        assert!(config.compactor.enabled);
    }

    #[test]
    fn test_invalid_json_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            SyncConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_normalize_clamps_zero_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"transfers": {"parallel_transfers": 0}, "retry": {"max_attempts": 0, "jitter": 4.0}}"#,
        )
        .unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.transfers.parallel_transfers, 1);
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(config.retry.jitter, 1.0);
    }

    #[test]
    fn test_resolved_cache_dir_prefers_configured() {
        let config = SyncConfig {
            cache_dir: Some(PathBuf::from("/tmp/glamour-cache")),
            ..Default::default()
        };
        assert_eq!(
            config.resolved_cache_dir(),
            Some(PathBuf::from("/tmp/glamour-cache"))
        );
    }

    #[test]
    fn test_default_path_ends_with_config_file() {
        if let Some(path) = SyncConfig::default_path() {
            assert!(path.ends_with("glamour/config.json"));
        }
    }
}
