//! Shared fixtures for the sync engine integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use glamour_client::config::RetrySettings;
use glamour_client::{
    ContentCache, DownloadManagerFactory, Mediator, MemoryRelay, Message, MessageKind,
    SessionToken, StaticCredentials, Subscriber, SyncConfig, TransferOrchestrator,
};
use glamour_common::{ContentHash, Manifest, ManifestEntry, PeerId};
use tempfile::TempDir;

/// A running engine wired to an in-memory relay
pub struct Engine {
    pub dir: TempDir,
    pub config: SyncConfig,
    pub relay: Arc<MemoryRelay>,
    pub credentials: Arc<StaticCredentials>,
    pub cache: Arc<ContentCache>,
    pub mediator: Mediator,
    pub orchestrator: TransferOrchestrator,
}

impl Engine {
    pub fn downloads(&self) -> DownloadManagerFactory {
        DownloadManagerFactory::new(
            self.orchestrator.clone(),
            self.cache.clone(),
            self.mediator.clone(),
            self.config.downloads.clone(),
        )
    }
}

/// Config with millisecond backoff so retry tests stay fast
pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.retry = RetrySettings {
        base_delay_ms: 1,
        max_delay_ms: 10,
        jitter: 0.0,
        ..Default::default()
    };
    config.downloads.progress_interval_ms = 5;
    config
}

/// Build and start an engine; `configure` adjusts the test config first
pub fn engine(relay: MemoryRelay, configure: impl FnOnce(&mut SyncConfig)) -> Engine {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = test_config();
    configure(&mut config);

    let relay = Arc::new(relay);
    let credentials = Arc::new(StaticCredentials::new(SessionToken::new("session")));
    let cache = Arc::new(ContentCache::open(dir.path().join("cache")).expect("open cache"));
    let mediator = Mediator::new(&config.mediator);
    let orchestrator = TransferOrchestrator::new(
        &config,
        relay.clone(),
        credentials.clone(),
        cache.clone(),
        mediator.clone(),
    );
    mediator.start();
    orchestrator.start();

    Engine {
        dir,
        config,
        relay,
        credentials,
        cache,
        mediator,
        orchestrator,
    }
}

/// Manifest whose entries are `blobs` in order
pub fn manifest(peer: &str, blobs: &[&[u8]]) -> Manifest {
    let entries = blobs
        .iter()
        .enumerate()
        .map(|(i, data)| {
            ManifestEntry::new(
                format!("chara/{peer}/{i}.mdl"),
                ContentHash::of(data),
                data.len() as u64,
            )
        })
        .collect();
    Manifest::new(PeerId::new(peer), entries)
}

/// Collects every message of the given kinds
pub struct Recorder {
    messages: Arc<Mutex<Vec<Message>>>,
    _subscriber: Subscriber,
}

impl Recorder {
    pub fn new(mediator: &Mediator, kinds: &[MessageKind]) -> Self {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let subscriber = mediator.register("recorder");
        for kind in kinds {
            let sink = messages.clone();
            subscriber.subscribe(*kind, move |message: &Message| {
                sink.lock().unwrap().push(message.clone());
            });
        }
        Self {
            messages,
            _subscriber: subscriber,
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }
}
