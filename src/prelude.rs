//! Convenient re-exports for wiring up an exporter.
pub use crate::{
    config::{ExporterConfig, QueueConfig, RetryConfig, TimeoutConfig},
    error::{ConfigError, LifecycleError, SendError, SubmitError},
    exporter::{exporter_fn, Exporter, SendContext},
    lifecycle::{ControllerState, LifecycleController, ShutdownReport, Submission},
    request::{Batch, FailureCause, Outcome, RequestId},
    storage::{MemoryStorage, QueueStorage},
    telemetry::{DeliveryEvent, EventKind, LogSink, MemorySink, TelemetrySink},
    HealthState,
};
