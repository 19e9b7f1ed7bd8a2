//! Prometheus metrics sink for `exporthelper`.
//! Bring your own `prometheus::Registry`; metrics are registered and updated per event.
//!
//! - `exporthelper_events_total{category, event}` counts every delivery event.
//! - `exporthelper_health_state` holds the health code carried by the latest event.
//! - `exporthelper_attempt_timeouts_total` counts attempts cut off by the per-attempt timeout.

use exporthelper::telemetry::{AttemptEvent, DeliveryEvent, EventKind, TelemetrySink};
use prometheus::{IntCounter, IntCounterVec, IntGauge, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    events: IntCounterVec,
    health: IntGauge,
    timeouts: IntCounter,
}

impl PrometheusSink {
    /// Create a sink and register its metrics into the provided registry.
    ///
    /// # Errors
    /// Returns an error if a metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let events = IntCounterVec::new(
            prometheus::Opts::new("exporthelper_events_total", "Delivery events"),
            &["category", "event"],
        )?;
        let health = IntGauge::new(
            "exporthelper_health_state",
            "Health of the export endpoint (0 starting .. 5 terminated)",
        )?;
        let timeouts = IntCounter::new(
            "exporthelper_attempt_timeouts_total",
            "Send attempts cut off by the per-attempt timeout",
        )?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(health.clone()))?;
        registry.register(Box::new(timeouts.clone()))?;
        tracing::debug!("registered exporthelper metrics");
        Ok(Self { registry, events, health, timeouts })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl tower_service::Service<DeliveryEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DeliveryEvent) -> Self::Future {
        self.events.with_label_values(&[event.kind.category(), event.kind.name()]).inc();
        self.health.set(i64::from(event.health.code()));
        if let EventKind::Attempt(AttemptEvent::TimedOut { .. }) = event.kind {
            self.timeouts.inc();
        }
        ready(Ok(()))
    }
}

impl TelemetrySink for PrometheusSink {
    type SinkError = Infallible;
}
