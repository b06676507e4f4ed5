//! End-to-end manifest downloads against the in-memory relay
//!
//! These tests drive `DownloadManager` through the orchestrator and cache
//! and check what ends up on disk and on the message bus.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{Recorder, engine, manifest};
use glamour_client::{ManifestOutcome, MemoryRelay, Message, MessageKind, TransferState};
use glamour_common::{ContentHash, Manifest, ManifestEntry, PeerId, TransferErrorKind};

// ============================================================================
// Manifest diff
// ============================================================================

#[tokio::test]
async fn test_manifest_downloads_only_missing_hashes() {
    let e = engine(MemoryRelay::new().with_chunk_size(4), |_| {});
    let (a, b, c) = (&b"hair"[..], &b"body texture"[..], &b"face model"[..]);
    let (ha, hb, hc) = (e.relay.insert(a), e.relay.insert(b), e.relay.insert(c));
    e.cache.store(ha, a).await.unwrap();
    let recorder = Recorder::new(
        &e.mediator,
        &[MessageKind::ManifestCompleted, MessageKind::DownloadProgress],
    );

    let manager = e.downloads().create(PeerId::new("alice"));
    let plan = manager.apply_manifest(manifest("alice", &[a, b, c]));
    assert_eq!(plan.missing, vec![hb, hc]);
    assert_eq!(plan.present, 1);

    assert_eq!(
        manager.wait().await,
        Some(ManifestOutcome::Completed {
            downloaded: 2,
            total: 3
        })
    );
    assert_eq!(e.relay.download_calls_for(&ha), 0);
    assert!(e.cache.lookup(&hb).is_ok());
    assert!(e.cache.lookup(&hc).is_ok());

    let cached: HashSet<ContentHash> = e.cache.enumerate().map(|r| r.unwrap().hash).collect();
    assert_eq!(cached, HashSet::from([ha, hb, hc]));

    e.mediator.flush().await;
    let messages = recorder.messages();
    assert!(messages.iter().any(|m| matches!(
        m,
        Message::ManifestCompleted { peer, downloaded: 2, total: 3 } if peer.as_str() == "alice"
    )));
    assert!(
        messages
            .iter()
            .any(|m| matches!(m, Message::DownloadProgress { total: 2, .. }))
    );
}

// ============================================================================
// Verification
// ============================================================================

#[tokio::test]
async fn test_hash_mismatch_retries_once_then_fails() {
    let e = engine(MemoryRelay::new(), |_| {});
    let declared = ContentHash::of(b"the real asset");
    e.relay.insert_as(declared, b"a tampered asset".to_vec());
    let recorder = Recorder::new(&e.mediator, &[MessageKind::ManifestFailed]);

    let manager = e.downloads().create(PeerId::new("mallory"));
    manager.apply_manifest(Manifest::new(
        PeerId::new("mallory"),
        vec![ManifestEntry::new("chara/mallory/face.tex", declared, 14)],
    ));

    let Some(ManifestOutcome::Failed(failures)) = manager.wait().await else {
        panic!("expected manifest failure");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].hash, declared);
    assert_eq!(failures[0].kind, TransferErrorKind::HashMismatch);
    assert_eq!(e.relay.download_calls_for(&declared), 2);
    assert!(!e.cache.contains(&declared));
    assert_eq!(e.cache.stats().unwrap().entries, 0);

    e.mediator.flush().await;
    assert_eq!(recorder.messages().len(), 1);
}

// ============================================================================
// Coalescing
// ============================================================================

#[tokio::test]
async fn test_shared_hash_downloads_once() {
    let e = engine(
        MemoryRelay::new()
            .with_chunk_size(2)
            .with_latency(Duration::from_millis(10)),
        |_| {},
    );
    let shared = &b"shared outfit"[..];
    let hash = e.relay.insert(shared);
    e.relay.insert(&b"only bob"[..]);

    let factory = e.downloads();
    let alice = factory.create(PeerId::new("alice"));
    let bob = factory.create(PeerId::new("bob"));
    alice.apply_manifest(manifest("alice", &[shared]));
    bob.apply_manifest(manifest("bob", &[shared, b"only bob"]));

    assert!(matches!(
        alice.wait().await,
        Some(ManifestOutcome::Completed { downloaded: 1, .. })
    ));
    assert!(matches!(
        bob.wait().await,
        Some(ManifestOutcome::Completed { .. })
    ));
    assert_eq!(e.relay.download_calls_for(&hash), 1);
    assert_eq!(e.cache.stats().unwrap().entries, 2);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_peer_offline_cancels_only_that_peer() {
    let e = engine(
        MemoryRelay::new()
            .with_chunk_size(1)
            .with_latency(Duration::from_millis(20)),
        |_| {},
    );
    let slow = &b"twenty bytes of data"[..];
    let other = &b"another twenty bytes"[..];
    e.relay.insert(slow);
    let other_hash = e.relay.insert(other);

    let factory = e.downloads();
    let leaving = factory.create(PeerId::new("leaving"));
    let staying = factory.create(PeerId::new("staying"));
    leaving.apply_manifest(manifest("leaving", &[slow]));
    staying.apply_manifest(manifest("staying", &[other]));

    tokio::time::sleep(Duration::from_millis(50)).await;
    e.mediator.publish(Message::PeerOffline {
        peer: PeerId::new("leaving"),
    });

    assert_eq!(leaving.wait().await, Some(ManifestOutcome::Cancelled));
    let leaving_peer = PeerId::new("leaving");
    assert!(!e.orchestrator.snapshots().iter().any(|d| {
        d.peers.contains(&leaving_peer)
            && matches!(d.state, TransferState::Connecting | TransferState::Transferring)
    }));
    assert!(!e.cache.contains(&ContentHash::of(slow)));

    assert!(matches!(
        staying.wait().await,
        Some(ManifestOutcome::Completed { .. })
    ));
    assert!(e.cache.contains(&other_hash));
}

#[tokio::test]
async fn test_new_manifest_supersedes_previous() {
    let e = engine(
        MemoryRelay::new()
            .with_chunk_size(1)
            .with_latency(Duration::from_millis(20)),
        |c| c.transfers.parallel_transfers = 1,
    );
    let dropped = &b"outfit that was replaced"[..];
    let kept = &b"kept"[..];
    let added = &b"new"[..];
    for blob in [dropped, kept, added] {
        e.relay.insert(blob);
    }

    let manager = e.downloads().create(PeerId::new("alice"));
    manager.apply_manifest(manifest("alice", &[dropped, kept]));
    tokio::time::sleep(Duration::from_millis(30)).await;
    let plan = manager.apply_manifest(manifest("alice", &[kept, added]));
    assert_eq!(plan.missing.len(), 2);

    assert_eq!(
        manager.wait().await,
        Some(ManifestOutcome::Completed {
            downloaded: 2,
            total: 2
        })
    );
    assert!(e.cache.contains(&ContentHash::of(kept)));
    assert!(e.cache.contains(&ContentHash::of(added)));
    assert!(!e.cache.contains(&ContentHash::of(dropped)));
}

#[tokio::test]
async fn test_superseded_manifest_still_reports_and_releases_transfers() {
    let e = engine(
        MemoryRelay::new()
            .with_chunk_size(1)
            .with_latency(Duration::from_millis(10)),
        |_| {},
    );
    let old = &b"an outfit nobody wants any more"[..];
    let new = &b"current outfit"[..];
    e.relay.insert(old);
    e.relay.insert(new);
    let recorder = Recorder::new(
        &e.mediator,
        &[
            MessageKind::Event,
            MessageKind::ManifestCompleted,
            MessageKind::ManifestFailed,
        ],
    );

    let manager = e.downloads().create(PeerId::new("alice"));
    manager.apply_manifest(manifest("alice", &[old]));
    tokio::time::sleep(Duration::from_millis(30)).await;
    manager.apply_manifest(manifest("alice", &[new]));
    assert!(matches!(
        manager.wait().await,
        Some(ManifestOutcome::Completed { downloaded: 1, .. })
    ));

    let mut settled = false;
    for _ in 0..200 {
        if e.orchestrator.snapshots().is_empty() {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(settled, "descriptors left: {:?}", e.orchestrator.snapshots());

    e.mediator.flush().await;
    let finals = recorder.messages();
    assert_eq!(finals.len(), 2, "{finals:?}");
    assert!(finals.iter().any(|m| matches!(m, Message::Event(_))));
    assert!(
        finals
            .iter()
            .any(|m| matches!(m, Message::ManifestCompleted { .. }))
    );
    assert!(!e.cache.contains(&ContentHash::of(old)));
}

#[tokio::test]
async fn test_unauthorized_fails_manifest_and_signals_reauth() {
    let e = engine(MemoryRelay::new(), |_| {});
    e.credentials.clear();
    let data = &b"locked"[..];
    let hash = e.relay.insert(data);
    let recorder = Recorder::new(&e.mediator, &[MessageKind::AuthorizationFailed]);

    let manager = e.downloads().create(PeerId::new("alice"));
    manager.apply_manifest(manifest("alice", &[data]));

    let Some(ManifestOutcome::Failed(failures)) = manager.wait().await else {
        panic!("expected manifest failure");
    };
    assert_eq!(failures[0].kind, TransferErrorKind::Unauthorized);
    assert_eq!(e.relay.download_calls_for(&hash), 0);

    e.mediator.flush().await;
    assert!(matches!(
        recorder.messages().as_slice(),
        [Message::AuthorizationFailed { hash: Some(h), .. }] if *h == hash
    ));
}
