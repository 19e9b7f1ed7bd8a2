use crate::error::SubmitError;
use crate::health::HealthState;
use crate::lifecycle::ControllerState;
use crate::request::RequestId;
use std::fmt;
use std::time::Duration;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

/// Event emitted by the delivery core.
///
/// Every event carries the health state current when it was emitted, so a sink can render
/// both "what happened" and "how the endpoint looked" without querying the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryEvent {
    pub health: HealthState,
    pub kind: EventKind,
}

impl DeliveryEvent {
    pub fn new(health: HealthState, kind: EventKind) -> Self {
        Self { health, kind }
    }

    /// The request this event settles, when it is a terminal outcome.
    ///
    /// Exactly one event per admitted or rejected request returns `Some`.
    pub fn terminal_request(&self) -> Option<RequestId> {
        match &self.kind {
            EventKind::Queue(QueueEvent::AdmissionRejected { id, .. }) => Some(*id),
            EventKind::Attempt(AttemptEvent::PermanentFailure { id, .. }) => Some(*id),
            EventKind::Outcome(o) => Some(o.id()),
            _ => None,
        }
    }

    /// Request the event is about, if any.
    pub fn request_id(&self) -> Option<RequestId> {
        match &self.kind {
            EventKind::Queue(e) => Some(e.id()),
            EventKind::Attempt(e) => Some(e.id()),
            EventKind::Outcome(e) => Some(e.id()),
            EventKind::Lifecycle(_) => None,
        }
    }
}

/// Event payload grouped by the component that emits it.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Queue(QueueEvent),
    Attempt(AttemptEvent),
    Outcome(OutcomeEvent),
    Lifecycle(LifecycleEvent),
}

impl EventKind {
    /// Coarse grouping used as a metric label.
    pub fn category(&self) -> &'static str {
        match self {
            EventKind::Queue(_) => "queue",
            EventKind::Attempt(_) => "attempt",
            EventKind::Outcome(_) => "outcome",
            EventKind::Lifecycle(_) => "lifecycle",
        }
    }

    /// Stable snake_case event name used as a metric label and JSON `kind`.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Queue(QueueEvent::Enqueued { .. }) => "request_enqueued",
            EventKind::Queue(QueueEvent::AdmissionRejected { .. }) => "admission_rejected",
            EventKind::Attempt(AttemptEvent::Started { .. }) => "attempt_started",
            EventKind::Attempt(AttemptEvent::TimedOut { .. }) => "attempt_timed_out",
            EventKind::Attempt(AttemptEvent::RetryableFailure { .. }) => "attempt_retryable_failure",
            EventKind::Attempt(AttemptEvent::PermanentFailure { .. }) => "attempt_permanent_failure",
            EventKind::Outcome(OutcomeEvent::Delivered { .. }) => "request_delivered",
            EventKind::Outcome(OutcomeEvent::Exhausted { .. }) => "request_exhausted",
            EventKind::Outcome(OutcomeEvent::ShutdownForced { .. }) => "shutdown_forced_failure",
            EventKind::Lifecycle(LifecycleEvent::StateChanged { .. }) => "state_changed",
            EventKind::Lifecycle(LifecycleEvent::Recovered { .. }) => "requests_recovered",
        }
    }
}

/// Admission events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// A request was admitted; `depth` is the FIFO length right after insertion.
    Enqueued { id: RequestId, depth: usize },
    /// A request was refused at admission. Terminal for that request.
    AdmissionRejected { id: RequestId, cause: SubmitError },
}

impl QueueEvent {
    pub fn id(&self) -> RequestId {
        match self {
            QueueEvent::Enqueued { id, .. } | QueueEvent::AdmissionRejected { id, .. } => *id,
        }
    }
}

/// Events describing a single send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptEvent {
    Started { id: RequestId, attempt: u32 },
    /// The attempt hit its deadline. Followed by either a retry or exhaustion.
    TimedOut { id: RequestId, attempt: u32, timeout: Duration },
    /// A retry was scheduled after `next_delay`.
    RetryableFailure { id: RequestId, attempt: u32, next_delay: Duration },
    /// The sink rejected the request as unsendable. Terminal for that request.
    PermanentFailure { id: RequestId, attempt: u32, reason: String },
}

impl AttemptEvent {
    pub fn id(&self) -> RequestId {
        match self {
            AttemptEvent::Started { id, .. }
            | AttemptEvent::TimedOut { id, .. }
            | AttemptEvent::RetryableFailure { id, .. }
            | AttemptEvent::PermanentFailure { id, .. } => *id,
        }
    }
}

/// Terminal outcomes other than admission rejection and permanent failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeEvent {
    /// `duration` runs from admission to the successful attempt.
    Delivered { id: RequestId, attempts: u32, duration: Duration },
    Exhausted { id: RequestId, attempts: u32 },
    /// Still queued, in flight, or parked when the shutdown grace period ran out.
    ShutdownForced { id: RequestId },
}

impl OutcomeEvent {
    pub fn id(&self) -> RequestId {
        match self {
            OutcomeEvent::Delivered { id, .. }
            | OutcomeEvent::Exhausted { id, .. }
            | OutcomeEvent::ShutdownForced { id } => *id,
        }
    }
}

/// Controller lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    StateChanged { from: ControllerState, to: ControllerState },
    /// Requests replayed from durable storage at start.
    Recovered { count: usize },
}

impl fmt::Display for DeliveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.kind, self.health)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Queue(event) => write!(f, "Queue::{}", event),
            EventKind::Attempt(event) => write!(f, "Attempt::{}", event),
            EventKind::Outcome(event) => write!(f, "Outcome::{}", event),
            EventKind::Lifecycle(event) => write!(f, "Lifecycle::{}", event),
        }
    }
}

impl fmt::Display for QueueEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueEvent::Enqueued { id, depth } => write!(f, "Enqueued(#{}, depth={})", id, depth),
            QueueEvent::AdmissionRejected { id, cause } => {
                write!(f, "AdmissionRejected(#{}, {})", id, cause)
            }
        }
    }
}

impl fmt::Display for AttemptEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptEvent::Started { id, attempt } => write!(f, "Started(#{}, attempt={})", id, attempt),
            AttemptEvent::TimedOut { id, attempt, timeout } => {
                write!(f, "TimedOut(#{}, attempt={}, timeout={:?})", id, attempt, timeout)
            }
            AttemptEvent::RetryableFailure { id, attempt, next_delay } => {
                write!(f, "RetryableFailure(#{}, attempt={}, next_delay={:?})", id, attempt, next_delay)
            }
            AttemptEvent::PermanentFailure { id, attempt, reason } => {
                write!(f, "PermanentFailure(#{}, attempt={}, {})", id, attempt, reason)
            }
        }
    }
}

impl fmt::Display for OutcomeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeEvent::Delivered { id, attempts, duration } => {
                write!(f, "Delivered(#{}, attempts={}, duration={:?})", id, attempts, duration)
            }
            OutcomeEvent::Exhausted { id, attempts } => {
                write!(f, "Exhausted(#{}, attempts={})", id, attempts)
            }
            OutcomeEvent::ShutdownForced { id } => write!(f, "ShutdownForced(#{})", id),
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::StateChanged { from, to } => write!(f, "StateChanged({} -> {})", from, to),
            LifecycleEvent::Recovered { count } => write!(f, "Recovered({})", count),
        }
    }
}

#[cfg_attr(not(feature = "telemetry-json"), allow(dead_code))]
#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a DeliveryEvent into a JSON value for sinks.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &DeliveryEvent) -> serde_json::Value {
    let mut value = match &event.kind {
        EventKind::Queue(q) => match q {
            QueueEvent::Enqueued { id, depth } => json!({ "request_id": id.0, "depth": *depth }),
            QueueEvent::AdmissionRejected { id, cause } => {
                json!({ "request_id": id.0, "cause": cause.to_string() })
            }
        },
        EventKind::Attempt(a) => match a {
            AttemptEvent::Started { id, attempt } => json!({ "request_id": id.0, "attempt": *attempt }),
            AttemptEvent::TimedOut { id, attempt, timeout } => json!({
                "request_id": id.0,
                "attempt": *attempt,
                "timeout_ms": clamp_u64(timeout.as_millis()),
            }),
            AttemptEvent::RetryableFailure { id, attempt, next_delay } => json!({
                "request_id": id.0,
                "attempt": *attempt,
                "next_delay_ms": clamp_u64(next_delay.as_millis()),
            }),
            AttemptEvent::PermanentFailure { id, attempt, reason } => json!({
                "request_id": id.0,
                "attempt": *attempt,
                "reason": reason,
            }),
        },
        EventKind::Outcome(o) => match o {
            OutcomeEvent::Delivered { id, attempts, duration } => json!({
                "request_id": id.0,
                "attempts": *attempts,
                "duration_ms": clamp_u64(duration.as_millis()),
            }),
            OutcomeEvent::Exhausted { id, attempts } => {
                json!({ "request_id": id.0, "attempts": *attempts })
            }
            OutcomeEvent::ShutdownForced { id } => json!({ "request_id": id.0 }),
        },
        EventKind::Lifecycle(l) => match l {
            LifecycleEvent::StateChanged { from, to } => {
                json!({ "from": from.as_str(), "to": to.as_str() })
            }
            LifecycleEvent::Recovered { count } => json!({ "count": *count }),
        },
    };
    if let Some(obj) = value.as_object_mut() {
        obj.insert("kind".into(), event.kind.name().into());
        obj.insert("category".into(), event.kind.category().into());
        obj.insert("health".into(), event.health.as_str().into());
    }
    value
}
