//! In-process relay
//!
//! Holds objects in memory and can be scripted to fail, corrupt or stall
//! individual calls. Used by the test suite and for local dry runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use glamour_common::ContentHash;

use super::{ByteStream, RelayTransport, SessionToken, UploadAck};
use crate::error::RelayError;

/// Default chunk size for served downloads (64KB)
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Scripted behaviour for one relay call on a hash
///
/// Faults are queued per hash and consumed one per call, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Behave normally
    Pass,
    /// Fail with `NetworkTransient`
    Transient,
    Unauthorized,
    NotFound,
    /// Serve (or accept) bytes with one byte flipped
    Corrupt,
    /// Serve this many bytes, then fail the stream with `NetworkTransient`
    FailAfter(usize),
    /// Wait before the first byte
    Stall(Duration),
}

#[derive(Default)]
struct State {
    objects: HashMap<ContentHash, Vec<u8>>,
    partial: HashMap<ContentHash, Vec<u8>>,
    faults: HashMap<ContentHash, VecDeque<Fault>>,
    download_calls: HashMap<ContentHash, usize>,
    upload_offsets: HashMap<ContentHash, Vec<u64>>,
}

#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

/// Counts a call as in flight until dropped
struct InFlight(Arc<Gauge>);

impl InFlight {
    fn enter(gauge: &Arc<Gauge>) -> Self {
        let now = gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
        gauge.max.fetch_max(now, Ordering::SeqCst);
        Self(gauge.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MemoryRelay {
    state: Mutex<State>,
    gauge: Arc<Gauge>,
    required_token: Option<SessionToken>,
    chunk_size: usize,
    latency: Duration,
    resume: bool,
    total_downloads: AtomicUsize,
    total_uploads: AtomicUsize,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            gauge: Arc::new(Gauge::default()),
            required_token: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            latency: Duration::ZERO,
            resume: false,
            total_downloads: AtomicUsize::new(0),
            total_uploads: AtomicUsize::new(0),
        }
    }

    /// Reject calls whose token differs from `token`
    pub fn with_required_token(mut self, token: SessionToken) -> Self {
        self.required_token = Some(token);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Delay applied to every served chunk and every upload call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Report partial uploads through `upload_offset`
    pub fn with_resume(mut self) -> Self {
        self.resume = true;
        self
    }

    /// Store `data` and return its hash
    pub fn insert(&self, data: impl Into<Vec<u8>>) -> ContentHash {
        let data = data.into();
        let hash = ContentHash::of(&data);
        self.lock().objects.insert(hash, data);
        hash
    }

    /// Store `data` under an arbitrary hash (simulates a tampered relay)
    pub fn insert_as(&self, hash: ContentHash, data: impl Into<Vec<u8>>) {
        self.lock().objects.insert(hash, data.into());
    }

    pub fn inject(&self, hash: ContentHash, faults: impl IntoIterator<Item = Fault>) {
        self.lock().faults.entry(hash).or_default().extend(faults);
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.lock().objects.contains_key(hash)
    }

    pub fn object(&self, hash: &ContentHash) -> Option<Vec<u8>> {
        self.lock().objects.get(hash).cloned()
    }

    pub fn download_calls(&self) -> usize {
        self.total_downloads.load(Ordering::SeqCst)
    }

    pub fn download_calls_for(&self, hash: &ContentHash) -> usize {
        self.lock().download_calls.get(hash).copied().unwrap_or(0)
    }

    pub fn upload_calls(&self) -> usize {
        self.total_uploads.load(Ordering::SeqCst)
    }

    /// Offsets of every `upload_chunk` call for `hash`, in call order
    pub fn upload_offsets(&self, hash: &ContentHash) -> Vec<u64> {
        self.lock()
            .upload_offsets
            .get(hash)
            .cloned()
            .unwrap_or_default()
    }

    pub fn in_flight(&self) -> usize {
        self.gauge.current.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent calls and open streams observed
    pub fn max_in_flight(&self) -> usize {
        self.gauge.max.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("memory relay state poisoned")
    }

    fn check_token(&self, token: &SessionToken) -> Result<(), RelayError> {
        match &self.required_token {
            Some(required) if required != token => {
                Err(RelayError::Unauthorized("session token rejected".to_string()))
            }
            _ => Ok(()),
        }
    }

    fn next_fault(&self, hash: &ContentHash) -> Fault {
        self.lock()
            .faults
            .get_mut(hash)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Fault::Pass)
    }
}

fn corrupt(bytes: &mut [u8]) {
    if let Some(first) = bytes.first_mut() {
        *first ^= 0xFF;
    }
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    async fn download_stream(
        &self,
        token: &SessionToken,
        hash: ContentHash,
    ) -> Result<ByteStream, RelayError> {
        self.total_downloads.fetch_add(1, Ordering::SeqCst);
        *self.lock().download_calls.entry(hash).or_default() += 1;
        self.check_token(token)?;

        let fault = self.next_fault(&hash);
        let mut data = match fault {
            Fault::Transient => {
                return Err(RelayError::NetworkTransient("injected failure".to_string()));
            }
            Fault::Unauthorized => {
                return Err(RelayError::Unauthorized("injected rejection".to_string()));
            }
            Fault::NotFound => return Err(RelayError::NotFound { hash }),
            _ => self
                .object(&hash)
                .ok_or(RelayError::NotFound { hash })?,
        };

        let mut stall = None;
        match fault {
            Fault::Corrupt => corrupt(&mut data),
            Fault::Stall(delay) => stall = Some(delay),
            _ => {}
        }

        let served = match fault {
            Fault::FailAfter(n) => n.min(data.len()),
            _ => data.len(),
        };
        let mut items: VecDeque<Result<Vec<u8>, RelayError>> = data[..served]
            .chunks(self.chunk_size)
            .map(|c| Ok(c.to_vec()))
            .collect();
        if matches!(fault, Fault::FailAfter(_)) {
            items.push_back(Err(RelayError::NetworkTransient(
                "connection reset".to_string(),
            )));
        }

        let guard = InFlight::enter(&self.gauge);
        let latency = self.latency;
        let stream = stream::unfold(
            (items, stall, guard),
            move |(mut items, mut stall, guard)| async move {
                if let Some(delay) = stall.take() {
                    tokio::time::sleep(delay).await;
                }
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                let item = items.pop_front()?;
                Some((item, (items, stall, guard)))
            },
        );
        Ok(stream.boxed())
    }

    async fn upload_chunk(
        &self,
        token: &SessionToken,
        hash: ContentHash,
        offset: u64,
        mut bytes: Vec<u8>,
        total_bytes: u64,
    ) -> Result<UploadAck, RelayError> {
        self.total_uploads.fetch_add(1, Ordering::SeqCst);
        self.lock()
            .upload_offsets
            .entry(hash)
            .or_default()
            .push(offset);
        self.check_token(token)?;

        let _guard = InFlight::enter(&self.gauge);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self.next_fault(&hash) {
            Fault::Transient | Fault::FailAfter(_) => {
                return Err(RelayError::NetworkTransient("injected failure".to_string()));
            }
            Fault::Unauthorized => {
                return Err(RelayError::Unauthorized("injected rejection".to_string()));
            }
            Fault::NotFound => return Err(RelayError::NotFound { hash }),
            Fault::Corrupt => corrupt(&mut bytes),
            Fault::Stall(delay) => tokio::time::sleep(delay).await,
            Fault::Pass => {}
        }

        let mut state = self.lock();
        if state.objects.contains_key(&hash) {
            return Ok(UploadAck {
                received_bytes: total_bytes,
                complete: true,
            });
        }

        let partial = state.partial.entry(hash).or_default();
        let offset = offset as usize;
        if offset > partial.len() {
            return Err(RelayError::NetworkTransient(format!(
                "upload gap: have {} bytes, got offset {offset}",
                partial.len()
            )));
        }
        partial.truncate(offset);
        partial.extend_from_slice(&bytes);
        let received = partial.len() as u64;

        if received < total_bytes {
            return Ok(UploadAck {
                received_bytes: received,
                complete: false,
            });
        }

        let data = state.partial.remove(&hash).unwrap_or_default();
        if ContentHash::of(&data) != hash {
            return Err(RelayError::NetworkTransient(
                "uploaded bytes failed verification".to_string(),
            ));
        }
        state.objects.insert(hash, data);
        Ok(UploadAck {
            received_bytes: received,
            complete: true,
        })
    }

    async fn upload_offset(
        &self,
        token: &SessionToken,
        hash: ContentHash,
    ) -> Result<Option<u64>, RelayError> {
        self.check_token(token)?;
        if !self.resume {
            return Ok(None);
        }
        let state = self.lock();
        Ok(Some(
            state.partial.get(&hash).map_or(0, |p| p.len() as u64),
        ))
    }

    async fn missing_hashes(
        &self,
        token: &SessionToken,
        hashes: &[ContentHash],
    ) -> Result<Vec<ContentHash>, RelayError> {
        self.check_token(token)?;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let state = self.lock();
        Ok(hashes
            .iter()
            .filter(|h| !state.objects.contains_key(*h))
            .copied()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> SessionToken {
        SessionToken::new("t")
    }

    async fn collect(stream: ByteStream) -> Result<Vec<u8>, RelayError> {
        let mut out = Vec::new();
        let mut stream = stream;
        while let Some(chunk) = stream.next().await {
            out.extend(chunk?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_download_in_chunks() {
        let relay = MemoryRelay::new().with_chunk_size(3);
        let hash = relay.insert(b"hello world".to_vec());

        let mut stream = relay.download_stream(&token(), hash).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), b"hel");
        assert_eq!(relay.in_flight(), 1);
        drop(stream);
        assert_eq!(relay.in_flight(), 0);

        let body = collect(relay.download_stream(&token(), hash).await.unwrap())
            .await
            .unwrap();
        assert_eq!(body, b"hello world");
        assert_eq!(relay.download_calls_for(&hash), 2);
    }

    #[tokio::test]
    async fn test_missing_object() {
        let relay = MemoryRelay::new();
        let hash = ContentHash::of(b"absent");
        assert!(matches!(
            relay.download_stream(&token(), hash).await,
            Err(RelayError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_faults_consumed_in_order() {
        let relay = MemoryRelay::new();
        let hash = relay.insert(b"data".to_vec());
        relay.inject(hash, [Fault::Transient, Fault::Corrupt, Fault::FailAfter(2)]);

        assert!(matches!(
            relay.download_stream(&token(), hash).await,
            Err(RelayError::NetworkTransient(_))
        ));

        let corrupted = collect(relay.download_stream(&token(), hash).await.unwrap())
            .await
            .unwrap();
        assert_ne!(ContentHash::of(&corrupted), hash);

        let truncated = collect(relay.download_stream(&token(), hash).await.unwrap()).await;
        assert!(matches!(truncated, Err(RelayError::NetworkTransient(_))));

        let clean = collect(relay.download_stream(&token(), hash).await.unwrap())
            .await
            .unwrap();
        assert_eq!(clean, b"data");
    }

    #[tokio::test]
    async fn test_required_token() {
        let relay = MemoryRelay::new().with_required_token(SessionToken::new("good"));
        let hash = relay.insert(b"x".to_vec());
        assert!(matches!(
            relay.download_stream(&SessionToken::new("bad"), hash).await,
            Err(RelayError::Unauthorized(_))
        ));
        assert!(
            relay
                .download_stream(&SessionToken::new("good"), hash)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_chunked_upload_and_resume_offset() {
        let relay = MemoryRelay::new().with_resume();
        let data = b"0123456789".to_vec();
        let hash = ContentHash::of(&data);

        let ack = relay
            .upload_chunk(&token(), hash, 0, data[..4].to_vec(), 10)
            .await
            .unwrap();
        assert_eq!(
            ack,
            UploadAck {
                received_bytes: 4,
                complete: false
            }
        );
        assert_eq!(relay.upload_offset(&token(), hash).await.unwrap(), Some(4));

        let ack = relay
            .upload_chunk(&token(), hash, 4, data[4..].to_vec(), 10)
            .await
            .unwrap();
        assert!(ack.complete);
        assert_eq!(relay.object(&hash), Some(data));
        assert!(relay.missing_hashes(&token(), &[hash]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_rejects_bad_content() {
        let relay = MemoryRelay::new();
        let hash = ContentHash::of(b"real");
        let result = relay
            .upload_chunk(&token(), hash, 0, b"fake".to_vec(), 4)
            .await;
        assert!(matches!(result, Err(RelayError::NetworkTransient(_))));
        assert!(!relay.contains(&hash));
    }
}
