//! Error types for the delivery core.
//!
//! Errors are split by where they surface:
//! - [`ConfigError`]: invalid settings, reported at construction.
//! - [`SendError`]: what an [`Exporter`](crate::Exporter) reports for a single send.
//! - [`AttemptError`]: the result of one guarded attempt (send error, timeout, or cancellation).
//! - [`SubmitError`]: synchronous admission failures returned to `submit` callers.
//! - [`LifecycleError`]: illegal lifecycle transitions.
//! - [`StorageError`]: durable queue storage failures.
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration detected while constructing the core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Queue capacity must be > 0 when queueing is enabled.
    #[error("queue capacity must be greater than zero")]
    ZeroCapacity,
    /// Consumer count must be > 0 when queueing is enabled.
    #[error("consumer count must be greater than zero")]
    ZeroConsumers,
    /// Retry initial interval must be > 0 when retry is enabled.
    #[error("retry initial interval must be greater than zero")]
    ZeroInitialInterval,
    /// `max_interval` must not be lower than `initial_interval`.
    #[error("retry max interval ({max:?}) must be >= initial interval ({initial:?})")]
    MaxIntervalBelowInitial { initial: Duration, max: Duration },
    /// Jitter randomization factor must lie in `[0, 1]`.
    #[error("retry randomization factor must be within [0, 1] (got {0})")]
    InvalidRandomizationFactor(f64),
    /// A duration setting exceeds [`MAX_DURATION`](crate::config::MAX_DURATION).
    #[error("{field} ({value:?}) exceeds the maximum of {max:?}")]
    DurationTooLarge { field: &'static str, value: Duration, max: Duration },
}

/// Failure reported by the sink for a single send.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Transient condition; the request may be retried.
    #[error("retryable send failure: {0}")]
    Retryable(String),
    /// The sink asked the caller to back off for a specific duration.
    #[error("sink throttled request, retry after {retry_after:?}: {message}")]
    Throttled { retry_after: Duration, message: String },
    /// The sink rejected the payload; retrying cannot help.
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

impl SendError {
    /// Transient failure from any displayable cause.
    pub fn retryable(cause: impl std::fmt::Display) -> Self {
        SendError::Retryable(cause.to_string())
    }

    /// Non-retryable failure from any displayable cause.
    pub fn permanent(cause: impl std::fmt::Display) -> Self {
        SendError::Permanent(cause.to_string())
    }

    /// Throttling response carrying the delay the sink asked for.
    pub fn throttled(retry_after: Duration, cause: impl std::fmt::Display) -> Self {
        SendError::Throttled { retry_after, message: cause.to_string() }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, SendError::Permanent(_))
    }

    /// Delay requested by the sink, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SendError::Throttled { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Result of one guarded send attempt that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptError {
    /// The per-attempt deadline elapsed before the sink answered.
    #[error("attempt timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },
    /// The sink answered with an error.
    #[error(transparent)]
    Send(#[from] SendError),
    /// The attempt was aborted by a forced shutdown.
    #[error("attempt cancelled by shutdown")]
    Cancelled,
}

impl AttemptError {
    /// Timeouts and transient sink errors are retryable; permanent errors and
    /// shutdown cancellation are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Timeout { .. } => true,
            AttemptError::Send(e) => e.is_retryable(),
            AttemptError::Cancelled => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AttemptError::Timeout { .. })
    }

    /// Access timeout details as `(elapsed, timeout)`.
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            AttemptError::Timeout { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }
}

/// Failure of the durable queue backing store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("storage i/o failed: {0}")]
    Io(String),
    #[error("stored request {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

/// Synchronous admission failure returned from `submit`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The queue is at capacity.
    #[error("queue is full ({held}/{capacity} requests held)")]
    Full { held: usize, capacity: usize },
    /// The controller is not running (never started, draining, or stopped).
    #[error("delivery core is not accepting requests")]
    NotRunning,
    /// The request could not be written to durable storage.
    #[error("failed to persist request: {0}")]
    Storage(#[from] StorageError),
}

impl SubmitError {
    pub fn is_full(&self) -> bool {
        matches!(self, SubmitError::Full { .. })
    }
}

/// Illegal or failed lifecycle transition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("controller already started")]
    AlreadyStarted,
    #[error("controller is stopped")]
    Stopped,
    #[error("failed to recover persisted requests: {0}")]
    Storage(#[from] StorageError),
}
