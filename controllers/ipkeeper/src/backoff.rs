//! # Exponential Backoff
//!
//! Per-item retry delays for the work queues. The delay doubles with every
//! consecutive failure of the same item and is capped, so a persistently
//! failing item settles at the maximum while others keep flowing.
//!
//! Sequence with the queue defaults (200ms base, 30s max):
//! 200ms, 400ms, 800ms, 1.6s, 3.2s, ... 30s (max).

use std::time::Duration;

/// Exponential backoff calculator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Delay after the first failure
    base: Duration,
    /// Upper bound on any delay
    max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(30))
    }
}

impl ExponentialBackoff {
    /// Create a new backoff with the given first delay and cap
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Calculate the delay for an item that has already failed `failures` times (stateless)
    ///
    /// `failures` is 0-indexed: the first retry waits `base`.
    #[must_use]
    pub fn for_failures(&self, failures: u32) -> Duration {
        // Shifts past 31 bits saturate, the cap applies either way
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(backoff.for_failures(0), Duration::from_millis(100));
        assert_eq!(backoff.for_failures(1), Duration::from_millis(200));
        assert_eq!(backoff.for_failures(2), Duration::from_millis(400));
        assert_eq!(backoff.for_failures(3), Duration::from_millis(800));
        assert_eq!(backoff.for_failures(6), Duration::from_millis(6400));
    }

    #[test]
    fn test_exponential_backoff_max_cap() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10));

        // 100ms * 2^7 = 12.8s, capped at 10s
        assert_eq!(backoff.for_failures(7), Duration::from_secs(10));
        // Should stay at max, including shift overflow
        assert_eq!(backoff.for_failures(40), Duration::from_secs(10));
        assert_eq!(backoff.for_failures(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_default_sequence() {
        let backoff = ExponentialBackoff::default();
        assert_eq!(backoff.for_failures(0), Duration::from_millis(200));
        assert_eq!(backoff.for_failures(4), Duration::from_millis(3200));
        assert_eq!(backoff.for_failures(20), Duration::from_secs(30));
    }
}
