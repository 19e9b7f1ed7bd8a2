//! Units of work flowing through the core and the outcomes they end in.

use crate::error::{AttemptError, SendError, SubmitError};
use crate::retry::RetryState;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Identifier assigned at admission; increases monotonically per controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque, already-encoded telemetry payload. Cloning shares the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    payload: Arc<[u8]>,
    items: usize,
}

impl Batch {
    /// `items` is the number of telemetry records encoded in `payload`; used for logging only.
    pub fn new(payload: impl Into<Arc<[u8]>>, items: usize) -> Self {
        Self { payload: payload.into(), items }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn items(&self) -> usize {
        self.items
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl From<Vec<u8>> for Batch {
    fn from(payload: Vec<u8>) -> Self {
        Batch::new(payload, 1)
    }
}

impl From<&'static str> for Batch {
    fn from(payload: &'static str) -> Self {
        Batch::new(payload.as_bytes(), 1)
    }
}

/// A batch plus the delivery metadata the scheduler needs.
///
/// The batch itself never changes; only the attempt bookkeeping does, and only while the
/// request is exclusively owned by one worker or by the scheduler.
#[derive(Debug, Clone)]
pub struct Request {
    id: RequestId,
    batch: Batch,
    enqueued_at: Instant,
    attempts: u32,
    first_attempt_at: Option<Instant>,
    state: RetryState,
}

impl Request {
    pub fn new(id: RequestId, batch: Batch, enqueued_at: Instant) -> Self {
        Self { id, batch, enqueued_at, attempts: 0, first_attempt_at: None, state: RetryState::Fresh }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn first_attempt_at(&self) -> Option<Instant> {
        self.first_attempt_at
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub(crate) fn begin_attempt(&mut self, now: Instant) {
        self.attempts = self.attempts.saturating_add(1);
        self.first_attempt_at.get_or_insert(now);
        self.state = RetryState::Attempting;
    }

    pub(crate) fn set_state(&mut self, state: RetryState) {
        self.state = state;
    }
}

/// Why a request ended without being delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The sink rejected the payload as unsendable.
    Permanent(SendError),
    /// Retry budget (or retry itself) ran out; carries the last underlying error.
    Exhausted { attempts: u32, last_error: AttemptError },
    /// The request was still queued, in flight, or waiting for retry when the grace period ended.
    Shutdown,
}

impl FailureCause {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, FailureCause::Shutdown)
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, FailureCause::Exhausted { .. })
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Permanent(e) => write!(f, "{}", e),
            FailureCause::Exhausted { attempts, last_error } => {
                write!(f, "exhausted after {} attempts; last error: {}", attempts, last_error)
            }
            FailureCause::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// What happened to a request. Every request produces exactly one terminal outcome
/// (anything but `RetryScheduled`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Delivered { attempts: u32 },
    RetryScheduled(Duration),
    PermanentlyFailed(FailureCause),
    DroppedAtAdmission(SubmitError),
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::RetryScheduled(_))
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Outcome::Delivered { .. })
    }

    /// Failure cause for `PermanentlyFailed`, if any.
    pub fn failure(&self) -> Option<&FailureCause> {
        match self {
            Outcome::PermanentlyFailed(cause) => Some(cause),
            _ => None,
        }
    }
}
