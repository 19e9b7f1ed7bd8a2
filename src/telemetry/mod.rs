//! Delivery events and the sinks that consume them.
//!
//! Every component of the core reports through one [`DeliveryEvent`] type:
//!
//! - **Queue**: `Enqueued`, `AdmissionRejected`
//! - **Attempt**: `Started`, `TimedOut`, `RetryableFailure`, `PermanentFailure`
//! - **Outcome**: `Delivered`, `Exhausted`, `ShutdownForced`
//! - **Lifecycle**: `StateChanged`, `Recovered`
//!
//! Sinks are `tower::Service<DeliveryEvent>` implementations. Emission is best-effort: a sink
//! that fails or lags never fails a delivery.

pub mod events;
pub mod sinks;

pub use events::{
    AttemptEvent, DeliveryEvent, EventKind, LifecycleEvent, OutcomeEvent, QueueEvent,
};
#[cfg(feature = "telemetry-json")]
pub use events::event_to_json;
pub use sinks::{
    emit_best_effort, ComposedSinkError, FilterSink, LogSink, MemorySink, MulticastSink, NullSink,
    StreamingSink, TelemetrySink,
};

use crate::health::HealthTracker;
use std::sync::{Arc, Mutex, PoisonError};
use tower::util::BoxCloneService;
use tower::ServiceExt;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type BoxedSink = BoxCloneService<DeliveryEvent, (), BoxError>;

/// Type-erased sink handle shared by every component of one controller.
///
/// Stamps each event with the current health state before handing it to the sink.
#[derive(Clone)]
pub(crate) struct Emitter {
    sink: Arc<Mutex<BoxedSink>>,
    health: HealthTracker,
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter").field("health", &self.health.get()).finish_non_exhaustive()
    }
}

impl Emitter {
    pub(crate) fn new<S>(sink: S, health: HealthTracker) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        let boxed = BoxCloneService::new(sink.map_err(|e| -> BoxError { Box::new(e) }));
        Self { sink: Arc::new(Mutex::new(boxed)), health }
    }

    pub(crate) fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub(crate) async fn emit(&self, kind: EventKind) {
        let event = DeliveryEvent::new(self.health.get(), kind);
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        emit_best_effort(sink, event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthState;
    use crate::request::RequestId;

    #[tokio::test]
    async fn emitter_stamps_current_health() {
        let memory = MemorySink::new();
        let health = HealthTracker::new();
        let emitter = Emitter::new(memory.clone(), health.clone());

        emitter.emit(EventKind::Queue(QueueEvent::Enqueued { id: RequestId(1), depth: 1 })).await;
        health.transition(HealthState::Connected);
        emitter.emit(EventKind::Attempt(AttemptEvent::Started { id: RequestId(1), attempt: 1 })).await;

        let events = memory.events();
        assert_eq!(events[0].health, HealthState::Starting);
        assert_eq!(events[1].health, HealthState::Connected);
    }
}
