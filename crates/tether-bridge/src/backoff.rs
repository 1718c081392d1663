//! Exponential backoff with jitter, shared by reconnects and storage retries.

use std::time::Duration;

use tether_shared::constants::{
    DEFAULT_RECONNECT_BASE_MS, DEFAULT_RECONNECT_MAX_ATTEMPTS, DEFAULT_RECONNECT_MAX_MS,
};

/// Default jitter factor (0.0-1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Attempts before giving up (the first try counts).
    pub max_attempts: u32,
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_RECONNECT_BASE_MS,
            max_delay_ms: DEFAULT_RECONNECT_MAX_MS,
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl BackoffConfig {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay_ms: u64::try_from(base.as_millis()).unwrap_or(u64::MAX),
            max_delay_ms: u64::try_from(max.as_millis()).unwrap_or(u64::MAX),
            max_attempts,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }

    /// Delay before retry number `attempt` (zero-based), with random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(backoff_delay_ms(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_factor,
            rand::random::<f64>(),
        ))
    }
}

/// `min(max, base * 2^attempt)`, varied by `+-jitter` using `random` in `[0, 1)`.
/// Never exceeds `max_delay_ms`.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn backoff_delay_ms(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    let capped = exponential.min(max_delay_ms);

    let jitter = jitter_factor.clamp(0.0, 1.0);
    let factor = 1.0 + jitter * (random.clamp(0.0, 1.0) * 2.0 - 1.0);
    let jittered = ((capped as f64) * factor).round() as u64;

    jittered.min(max_delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_until_capped() {
        let d = |attempt| backoff_delay_ms(attempt, 1_000, 60_000, 0.0, 0.5);
        assert_eq!(d(0), 1_000);
        assert_eq!(d(1), 2_000);
        assert_eq!(d(3), 8_000);
        assert_eq!(d(6), 60_000);
        assert_eq!(d(40), 60_000);
    }

    #[test]
    fn jitter_stays_within_range() {
        assert_eq!(backoff_delay_ms(2, 1_000, 60_000, 0.2, 0.0), 3_200);
        assert_eq!(backoff_delay_ms(2, 1_000, 60_000, 0.2, 0.5), 4_000);
        assert_eq!(backoff_delay_ms(2, 1_000, 60_000, 0.2, 1.0), 4_800);
        // Jitter never pushes past the cap.
        assert_eq!(backoff_delay_ms(10, 1_000, 60_000, 0.2, 1.0), 60_000);
    }

    #[test]
    fn delay_uses_config() {
        let config = BackoffConfig::new(Duration::from_millis(10), Duration::from_millis(15), 3);
        assert!(config.delay(5) <= Duration::from_millis(15));
    }
}
