//! Retry ceilings and exponential backoff

use std::time::Duration;

use glamour_common::TransferErrorKind;
use rand::RngExt;

use crate::config::RetrySettings;

/// Per-kind attempt ceilings plus the backoff curve
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    max_hash_mismatch_attempts: u32,
    max_filesystem_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            max_hash_mismatch_attempts: settings.max_hash_mismatch_attempts.max(1),
            max_filesystem_attempts: settings.max_filesystem_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter: settings.jitter.clamp(0.0, 1.0),
        }
    }

    /// Attempts allowed for failures of `kind`, first attempt included
    pub fn ceiling(&self, kind: TransferErrorKind) -> u32 {
        match kind {
            TransferErrorKind::NetworkTransient => self.max_attempts,
            TransferErrorKind::HashMismatch => self.max_hash_mismatch_attempts,
            TransferErrorKind::Filesystem => self.max_filesystem_attempts,
            TransferErrorKind::NotFound
            | TransferErrorKind::Unauthorized
            | TransferErrorKind::Cancelled => 1,
        }
    }

    /// Whether another attempt is allowed after `failures` failures of `kind`
    pub fn should_retry(&self, kind: TransferErrorKind, failures: u32) -> bool {
        kind.is_retryable() && failures < self.ceiling(kind)
    }

    /// Delay before attempt number `attempt + 1`
    ///
    /// Doubles from `base_delay` per completed attempt, capped at
    /// `max_delay`, then jittered by up to `jitter` in either direction.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(31);
        let scaled = self.base_delay.as_millis().saturating_mul(1u128 << shift);
        let mut delay = Duration::from_millis(scaled.min(u128::from(u64::MAX)) as u64);
        if !self.max_delay.is_zero() {
            delay = delay.min(self.max_delay);
        }
        if self.jitter <= 0.0 {
            return delay;
        }

        let r: f64 = rand::rng().random();
        let factor = 1.0 - self.jitter + 2.0 * self.jitter * r;
        Duration::from_millis((delay.as_millis() as f64 * factor).round().max(0.0) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy::from_settings(&RetrySettings {
            max_attempts: 4,
            max_hash_mismatch_attempts: 2,
            max_filesystem_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter,
        })
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let p = policy(0.0);
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(p.delay_for_attempt(5), Duration::from_millis(1_000));
        assert_eq!(p.delay_for_attempt(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let p = policy(0.5);
        for _ in 0..100 {
            let d = p.delay_for_attempt(2).as_millis();
            assert!((100..=300).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn test_ceilings_per_kind() {
        let p = policy(0.0);
        assert!(p.should_retry(TransferErrorKind::NetworkTransient, 3));
        assert!(!p.should_retry(TransferErrorKind::NetworkTransient, 4));
        assert!(p.should_retry(TransferErrorKind::HashMismatch, 1));
        assert!(!p.should_retry(TransferErrorKind::HashMismatch, 2));
        assert!(p.should_retry(TransferErrorKind::Filesystem, 2));
        assert!(!p.should_retry(TransferErrorKind::Filesystem, 3));
    }

    #[test]
    fn test_fatal_kinds_never_retry() {
        let p = policy(0.0);
        assert!(!p.should_retry(TransferErrorKind::NotFound, 0));
        assert!(!p.should_retry(TransferErrorKind::Unauthorized, 0));
        assert!(!p.should_retry(TransferErrorKind::Cancelled, 0));
    }

    #[test]
    fn test_zero_base_delay() {
        let mut settings = RetrySettings::default();
        settings.base_delay_ms = 0;
        let p = RetryPolicy::from_settings(&settings);
        assert_eq!(p.delay_for_attempt(3), Duration::ZERO);
    }
}
