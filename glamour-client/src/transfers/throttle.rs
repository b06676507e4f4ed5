//! Global bandwidth limit shared by all transfer workers

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Token bucket measured in bytes
///
/// Callers take tokens after moving a chunk; when the bucket runs into
/// deficit they sleep until it refills. Burst capacity is one second of
/// traffic. A rate of 0 disables throttling.
#[derive(Debug)]
pub struct Throttle {
    rate_bytes_per_sec: u64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    available: f64,
    last_refill: Instant,
}

impl Throttle {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        Self {
            rate_bytes_per_sec,
            bucket: Mutex::new(Bucket {
                available: rate_bytes_per_sec as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate_bytes_per_sec == 0
    }

    /// Account for `bytes` and wait if the budget is exhausted
    pub async fn consume(&self, bytes: usize) {
        let wait = self.reserve(bytes, Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    fn reserve(&self, bytes: usize, now: Instant) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }
        let rate = self.rate_bytes_per_sec as f64;
        let mut bucket = self.bucket.lock().expect("throttle lock poisoned");

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.available = (bucket.available + elapsed * rate).min(rate);
        bucket.last_refill = now;
        bucket.available -= bytes as f64;

        if bucket.available >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.available / rate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_waits() {
        let throttle = Throttle::unlimited();
        assert_eq!(throttle.reserve(usize::MAX, Instant::now()), Duration::ZERO);
    }

    #[test]
    fn test_burst_then_deficit() {
        let throttle = Throttle::new(1_000);
        let now = Instant::now();
        assert_eq!(throttle.reserve(1_000, now), Duration::ZERO);
        assert_eq!(throttle.reserve(500, now), Duration::from_millis(500));
    }

    #[test]
    fn test_refill_over_time() {
        let throttle = Throttle::new(1_000);
        let start = Instant::now();
        assert_eq!(throttle.reserve(1_000, start), Duration::ZERO);
        let later = start + Duration::from_millis(500);
        assert_eq!(throttle.reserve(500, later), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_consume_sleeps_on_deficit() {
        let throttle = Throttle::new(10_000);
        let start = Instant::now();
        throttle.consume(10_000).await;
        throttle.consume(2_000).await;
        assert!(start.elapsed() >= Duration::from_millis(150));
    }
}
