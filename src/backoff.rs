//! Exponential backoff used by the retry scheduler.
//!
//! Retry semantics: retry index `0` represents the initial call (no delay), and retries start
//! at `retry = 1`. The base delay for retry `n` is `initial * 2^(n-1)`, capped at `max`.
//! Delays saturate at [`MAX_BACKOFF`] to avoid overflow.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use exporthelper::ExponentialBackoff;
//!
//! let backoff =
//!     ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(2)).unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO); // initial call
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(6), Duration::from_secs(2)); // capped
//! ```

use crate::error::ConfigError;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Doubling backoff with a ceiling. The sequence of base delays is non-decreasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Returns an error if `initial` is zero or `max < initial`.
    pub fn new(initial: Duration, max: Duration) -> Result<Self, ConfigError> {
        if initial.is_zero() {
            return Err(ConfigError::ZeroInitialInterval);
        }
        if max < initial {
            return Err(ConfigError::MaxIntervalBelowInitial { initial, max });
        }
        Ok(Self { initial, max })
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Base (pre-jitter) delay before retry number `retry` (1-based; 0 = initial call).
    pub fn delay(&self, retry: usize) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = retry.saturating_sub(1).min(u32::MAX as usize) as u32;
        let multiplier = 2u128.saturating_pow(exponent);
        let base_nanos = self.initial.as_nanos().saturating_mul(multiplier);
        let exp_delay = Duration::from_nanos(base_nanos.min(MAX_BACKOFF.as_nanos()) as u64);
        exp_delay.min(self.max).min(MAX_BACKOFF)
    }
}
