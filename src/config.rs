//! Configuration consumed by the delivery core.
//!
//! Defaults follow the usual collector exporter settings: a 5000-slot queue drained by 10
//! consumers, retries starting at 5s and capped at 30s with a 5 minute budget, and a 5s
//! per-attempt timeout. Validation happens once, at construction; nothing is re-checked at
//! runtime.
//!
//! With the `serde` feature every struct (de)serializes, durations as integer milliseconds:
//!
//! ```rust
//! use exporthelper::ExporterConfig;
//! use std::time::Duration;
//!
//! let cfg = ExporterConfig::default()
//!     .with_timeout(Duration::from_secs(10));
//! assert!(cfg.validate().is_ok());
//! assert_eq!(cfg.queue.consumer_count, 10);
//! ```

use crate::backoff::ExponentialBackoff;
use crate::error::ConfigError;
use crate::jitter::Jitter;
use std::time::Duration;

/// Upper bound accepted for any duration setting.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn check_duration(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value > MAX_DURATION {
        return Err(ConfigError::DurationTooLarge { field, value, max: MAX_DURATION });
    }
    Ok(())
}

/// Queue sizing and admission.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct QueueConfig {
    /// When false, `submit` sends inline on the caller's task.
    pub enabled: bool,
    /// Upper bound on requests held at once (queued, in flight, or waiting for retry).
    pub capacity: usize,
    /// Number of concurrent workers, and therefore of concurrent sends.
    pub consumer_count: usize,
    /// How long `submit` may wait for a free slot before failing with `Full`. Zero fails fast.
    #[cfg_attr(feature = "serde", serde(with = "duration_ms", rename = "admission_wait_ms"))]
    pub admission_wait: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { enabled: true, capacity: 5000, consumer_count: 10, admission_wait: Duration::ZERO }
    }
}

impl QueueConfig {
    /// Queueing disabled: every submit is sent inline.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.consumer_count == 0 {
            return Err(ConfigError::ZeroConsumers);
        }
        check_duration("queue.admission_wait", self.admission_wait)
    }
}

/// Retry policy settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RetryConfig {
    pub enabled: bool,
    /// Delay before the first retry.
    #[cfg_attr(feature = "serde", serde(with = "duration_ms", rename = "initial_interval_ms"))]
    pub initial_interval: Duration,
    /// Ceiling for the (pre-jitter) delay.
    #[cfg_attr(feature = "serde", serde(with = "duration_ms", rename = "max_interval_ms"))]
    pub max_interval: Duration,
    /// Total retry budget measured from the first attempt. Zero means unbounded.
    #[cfg_attr(feature = "serde", serde(with = "duration_ms", rename = "max_elapsed_time_ms"))]
    pub max_elapsed_time: Duration,
    /// Symmetric jitter factor in `[0, 1]`.
    pub randomization_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: Duration::from_secs(300),
            randomization_factor: 0.5,
        }
    }
}

impl RetryConfig {
    /// Retry disabled: the first failure is terminal.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    /// Intervals are only checked when retry is enabled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.randomization_factor) {
            return Err(ConfigError::InvalidRandomizationFactor(self.randomization_factor));
        }
        if !self.enabled {
            return Ok(());
        }
        check_duration("retry.max_elapsed_time", self.max_elapsed_time)?;
        ExponentialBackoff::new(self.initial_interval, self.max_interval).map(|_| ())
    }

    pub(crate) fn backoff(&self) -> Result<ExponentialBackoff, ConfigError> {
        ExponentialBackoff::new(self.initial_interval, self.max_interval)
    }

    pub(crate) fn jitter(&self) -> Jitter {
        Jitter::with_factor(self.randomization_factor)
    }
}

/// Per-attempt deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TimeoutConfig {
    /// Zero disables the deadline.
    #[cfg_attr(feature = "serde", serde(with = "duration_ms", rename = "timeout_ms"))]
    pub timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(5) }
    }
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_duration("timeout.timeout", self.timeout)
    }
}

/// Full configuration surface of the delivery core.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ExporterConfig {
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub timeout: TimeoutConfig,
}

impl ExporterConfig {
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = TimeoutConfig { timeout };
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate()?;
        self.retry.validate()?;
        self.timeout.validate()
    }
}

#[cfg(feature = "serde")]
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
