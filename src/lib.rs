#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # exporthelper
//!
//! Reliable-delivery core for telemetry exporters: a bounded request queue drained by a fixed
//! pool of workers, per-attempt timeouts, exponential-backoff retries, and graceful shutdown.
//!
//! ## Features
//!
//! - **Bounded queue** whose capacity covers queued, in-flight, and retry-waiting requests
//! - **Consumer pool** capping concurrent sends at the worker count
//! - **Timeouts** per attempt, cancelling the exporter's work through its [`SendContext`]
//! - **Retries** with jittered exponential backoff, a total elapsed budget, and throttle hints
//! - **Graceful shutdown** that drains within a grace period and then fails the rest
//! - **Optional persistence** replaying unfinished requests after a restart
//!
//! ## Quick Start
//!
//! ```rust
//! use exporthelper::{exporter_fn, Batch, ExporterConfig, LifecycleController, SendContext, SendError};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let exporter = exporter_fn(|batch: Batch, _ctx: SendContext| async move {
//!         if batch.is_empty() {
//!             return Err(SendError::permanent("empty batch"));
//!         }
//!         Ok(())
//!     });
//!
//!     let controller = LifecycleController::new(ExporterConfig::default(), exporter).unwrap();
//!     controller.start().await.unwrap();
//!     controller.submit(Batch::from("payload")).await.unwrap();
//!     controller.shutdown(Duration::from_secs(5)).await;
//! }
//! ```

pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod exporter;
pub mod health;
pub mod jitter;
pub mod lifecycle;
mod pipeline;
pub mod pool;
pub mod prelude;
pub mod queue;
pub mod request;
pub mod retry;
pub mod sleeper;
pub mod storage;
pub mod telemetry;
pub mod timeout;

// Re-exports
pub use backoff::{ExponentialBackoff, MAX_BACKOFF};
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{ExporterConfig, QueueConfig, RetryConfig, TimeoutConfig, MAX_DURATION};
pub use error::{AttemptError, ConfigError, LifecycleError, SendError, StorageError, SubmitError};
pub use exporter::{exporter_fn, Exporter, FnExporter, SendContext, ServiceExporter};
pub use health::{HealthState, HealthTracker};
pub use jitter::Jitter;
pub use lifecycle::{
    ControllerBuilder, ControllerState, LifecycleController, ShutdownReport, Submission,
};
pub use pool::ConsumerPool;
pub use queue::RequestQueue;
pub use request::{Batch, FailureCause, Outcome, Request, RequestId};
pub use retry::{RetryDecision, RetryScheduler, RetryState};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
#[cfg(feature = "file-storage")]
pub use storage::FileStorage;
pub use storage::{MemoryStorage, QueueStorage};
pub use telemetry::{
    DeliveryEvent, EventKind, FilterSink, LogSink, MemorySink, MulticastSink, NullSink,
    StreamingSink, TelemetrySink,
};
pub use timeout::TimeoutGuard;
