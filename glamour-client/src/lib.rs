//! Glamour peer sync engine
//!
//! Content-addressed cache, hardlink compactor, transfer orchestrator with
//! per-peer download and upload managers, and the event mediator that ties
//! them to consumers.

pub mod cache;
pub mod compactor;
pub mod config;
pub mod constants;
pub mod download;
pub mod error;
pub mod mediator;
pub mod relay;
pub mod transfers;
pub mod upload;

pub use cache::{CacheEntry, CacheStats, ContentCache, VerifyReport};
pub use compactor::{CompactionReport, FileCompactor};
pub use config::SyncConfig;
pub use download::{DownloadManager, DownloadManagerFactory, ManifestOutcome, ManifestPlan};
pub use error::{CacheError, CompactError, ConfigError, EnqueueError, RelayError, UploadError};
pub use mediator::{Mediator, Message, MessageKind, Subscriber};
pub use relay::{CredentialProvider, MemoryRelay, RelayTransport, SessionToken, StaticCredentials};
pub use transfers::{
    Priority, TransferDescriptor, TransferHandle, TransferOrchestrator, TransferRequest,
    TransferState,
};
pub use upload::{LocalAsset, UploadManager, UploadPlan};
