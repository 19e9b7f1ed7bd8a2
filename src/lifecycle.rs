//! Start, submit, and shut down the delivery core.
//!
//! States run `NotStarted -> Running -> Draining -> Stopped`; nothing leaves `Stopped`.
//!
//! ```rust
//! use exporthelper::{exporter_fn, Batch, ExporterConfig, LifecycleController, SendContext, Submission};
//! use std::time::Duration;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let exporter = exporter_fn(|_batch: Batch, _ctx: SendContext| async { Ok(()) });
//! let controller = LifecycleController::new(ExporterConfig::default(), exporter).unwrap();
//! controller.start().await.unwrap();
//!
//! let submission = controller.submit(Batch::from("span data")).await.unwrap();
//! assert!(matches!(submission, Submission::Accepted(_)));
//!
//! let report = controller.shutdown(Duration::from_secs(5)).await;
//! assert!(report.drained);
//! # });
//! ```

use crate::clock::{Clock, TokioClock};
use crate::config::ExporterConfig;
use crate::error::{ConfigError, LifecycleError, SubmitError};
use crate::exporter::Exporter;
use crate::health::{HealthState, HealthTracker};
use crate::pipeline::Pipeline;
use crate::pool::ConsumerPool;
use crate::queue::RequestQueue;
use crate::request::{Batch, Outcome, Request, RequestId};
use crate::retry::RetryScheduler;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::storage::QueueStorage;
use crate::telemetry::{Emitter, EventKind, LifecycleEvent, NullSink, QueueEvent, TelemetrySink};
use crate::timeout::TimeoutGuard;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Controller lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    NotStarted,
    Running,
    Draining,
    Stopped,
}

impl ControllerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ControllerState::NotStarted => "not_started",
            ControllerState::Running => "running",
            ControllerState::Draining => "draining",
            ControllerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful `submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Queued; the outcome is reported through events.
    Accepted(RequestId),
    /// Sent inline (queue disabled); this is the terminal outcome.
    Completed(Outcome),
}

impl Submission {
    pub fn id(&self) -> Option<RequestId> {
        match self {
            Submission::Accepted(id) => Some(*id),
            Submission::Completed(_) => None,
        }
    }
}

/// What a shutdown call observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    /// Everything resolved within the grace period.
    pub drained: bool,
    /// Requests failed with cause `Shutdown`.
    pub forced_failures: usize,
}

/// Builder for [`LifecycleController`].
pub struct ControllerBuilder {
    config: ExporterConfig,
    exporter: Arc<dyn Exporter>,
    health: HealthTracker,
    emitter: Option<Emitter>,
    storage: Option<Arc<dyn QueueStorage>>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    rng_seed: Option<u64>,
}

impl ControllerBuilder {
    /// Route delivery events to `sink`. Defaults to [`NullSink`].
    pub fn with_sink<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        self.emitter = Some(Emitter::new(sink, self.health.clone()));
        self
    }

    /// Persist admitted requests and replay leftovers at `start`. Ignored when queueing is
    /// disabled.
    pub fn with_storage<S: QueueStorage>(mut self, storage: S) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    /// Sleeper used for retry delays.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Clock used for timestamps and the retry budget.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Seed retry jitter for reproducible delays.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<LifecycleController, ConfigError> {
        self.config.validate()?;

        let shutdown = CancellationToken::new();
        let emitter = match self.emitter {
            Some(emitter) => emitter,
            None => Emitter::new(NullSink, self.health.clone()),
        };

        let queue = if self.config.queue.enabled {
            let mut queue = RequestQueue::new(self.config.queue.capacity)
                .with_admission_wait(self.config.queue.admission_wait);
            if let Some(storage) = self.storage.clone() {
                queue = queue.with_storage(storage);
            }
            Some(Arc::new(queue))
        } else {
            if self.storage.is_some() {
                warn!("queue storage configured with queueing disabled; it will not be used");
            }
            None
        };

        let mut retry = RetryScheduler::new(&self.config.retry)?
            .with_sleeper(Arc::clone(&self.sleeper))
            .with_clock(Arc::clone(&self.clock))
            .with_cancellation(shutdown.clone());
        if let Some(seed) = self.rng_seed {
            retry = retry.with_rng_seed(seed);
        }
        let retry = Arc::new(retry);

        let pipeline = Arc::new(Pipeline {
            exporter: self.exporter,
            guard: TimeoutGuard::new(self.config.timeout.timeout),
            retry: Arc::clone(&retry),
            sleeper: self.sleeper,
            clock: Arc::clone(&self.clock),
            emitter: emitter.clone(),
            shutdown: shutdown.clone(),
            forced: AtomicUsize::new(0),
        });

        let storage = if queue.is_some() { self.storage } else { None };
        Ok(LifecycleController {
            config: self.config,
            state: Mutex::new(ControllerState::NotStarted),
            transitions: tokio::sync::Mutex::new(()),
            health: self.health,
            emitter,
            queue,
            storage,
            retry,
            pipeline,
            pool: Mutex::new(None),
            inline: TaskTracker::new(),
            clock: self.clock,
            next_id: AtomicU64::new(1),
            shutdown,
        })
    }
}

/// Owns the queue, workers, and retry scheduler of one exporter.
pub struct LifecycleController {
    config: ExporterConfig,
    state: Mutex<ControllerState>,
    transitions: tokio::sync::Mutex<()>,
    health: HealthTracker,
    emitter: Emitter,
    queue: Option<Arc<RequestQueue>>,
    storage: Option<Arc<dyn QueueStorage>>,
    retry: Arc<RetryScheduler>,
    pipeline: Arc<Pipeline>,
    pool: Mutex<Option<Arc<ConsumerPool>>>,
    inline: TaskTracker,
    clock: Arc<dyn Clock>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleController")
            .field("state", &self.state())
            .field("health", &self.health())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LifecycleController {
    /// Validate `config` and build a controller with default collaborators.
    pub fn new<E: Exporter>(config: ExporterConfig, exporter: E) -> Result<Self, ConfigError> {
        Self::builder(config, exporter).build()
    }

    pub fn builder<E: Exporter>(config: ExporterConfig, exporter: E) -> ControllerBuilder {
        ControllerBuilder {
            config,
            exporter: Arc::new(exporter),
            health: HealthTracker::new(),
            emitter: None,
            storage: None,
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(TokioClock),
            rng_seed: None,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ControllerState {
        *self.lock_state()
    }

    pub fn health(&self) -> HealthState {
        self.health.get()
    }

    pub fn config(&self) -> &ExporterConfig {
        &self.config
    }

    /// Requests waiting in the FIFO (0 when queueing is disabled).
    pub fn queue_len(&self) -> usize {
        self.queue.as_ref().map_or(0, |q| q.len())
    }

    /// Requests held anywhere in the core: queued, in flight, or waiting for retry.
    pub fn held(&self) -> usize {
        self.queue.as_ref().map_or(0, |q| q.held())
    }

    /// Queued requests currently being attempted by a worker.
    pub fn in_flight(&self) -> usize {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner).as_ref().map_or(0, |p| p.in_flight())
    }

    /// Requests parked until their retry timer fires.
    pub fn waiting_for_retry(&self) -> usize {
        self.retry.waiting_len()
    }

    async fn set_state(&self, next: ControllerState) {
        let from = std::mem::replace(&mut *self.lock_state(), next);
        if from != next {
            info!(%from, to = %next, "exporter state changed");
            self.emitter.emit(EventKind::Lifecycle(LifecycleEvent::StateChanged { from, to: next })).await;
        }
    }

    /// Replay persisted requests, launch the workers, and start accepting submissions.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let _serial = self.transitions.lock().await;
        match self.state() {
            ControllerState::NotStarted => {}
            ControllerState::Running | ControllerState::Draining => {
                return Err(LifecycleError::AlreadyStarted)
            }
            ControllerState::Stopped => return Err(LifecycleError::Stopped),
        }
        self.config.validate()?;
        self.health.transition(HealthState::Connecting);

        if let Some(queue) = &self.queue {
            if let Some(storage) = &self.storage {
                self.recover(queue, storage.as_ref()).await?;
            }
            let pool = ConsumerPool::start(
                self.config.queue.consumer_count,
                Arc::clone(queue),
                Arc::clone(&self.pipeline),
                self.shutdown.clone(),
            );
            *self.pool.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(pool));
        }

        self.set_state(ControllerState::Running).await;
        Ok(())
    }

    async fn recover(&self, queue: &RequestQueue, storage: &dyn QueueStorage) -> Result<(), LifecycleError> {
        let recovered = storage.recover().await?;
        if recovered.is_empty() {
            return Ok(());
        }
        let mut restored = 0;
        let mut highest = 0;
        for (id, batch) in recovered {
            highest = highest.max(id.0);
            match queue.restore(Request::new(id, batch, self.clock.now())) {
                Ok(depth) => {
                    restored += 1;
                    self.emitter.emit(EventKind::Queue(QueueEvent::Enqueued { id, depth })).await;
                }
                Err(cause) => {
                    warn!(request_id = %id, error = %cause, "dropping recovered request");
                    if let Err(e) = storage.release(id).await {
                        warn!(request_id = %id, error = %e, "failed to delete dropped request");
                    }
                    self.emitter.emit(EventKind::Queue(QueueEvent::AdmissionRejected { id, cause })).await;
                }
            }
        }
        self.next_id.fetch_max(highest.saturating_add(1), Ordering::AcqRel);
        info!(restored, "replayed persisted requests");
        self.emitter.emit(EventKind::Lifecycle(LifecycleEvent::Recovered { count: restored })).await;
        Ok(())
    }

    /// Hand a batch to the core.
    ///
    /// With queueing enabled this returns once the request is admitted; with it disabled the
    /// batch is delivered on the caller's task and the terminal outcome is returned.
    pub async fn submit(&self, batch: impl Into<Batch>) -> Result<Submission, SubmitError> {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::AcqRel));
        // taken before the state check so a concurrent shutdown waits for this submit
        let _inline = self.inline.token();

        if self.state() != ControllerState::Running {
            return Err(self.reject(id, SubmitError::NotRunning).await);
        }
        let request = Request::new(id, batch.into(), self.clock.now());

        let Some(queue) = &self.queue else {
            let outcome = self.pipeline.process_inline(request).await;
            return Ok(Submission::Completed(outcome));
        };

        match queue.enqueue(request).await {
            Ok(depth) => {
                self.emitter.emit(EventKind::Queue(QueueEvent::Enqueued { id, depth })).await;
                Ok(Submission::Accepted(id))
            }
            Err(cause) => Err(self.reject(id, cause).await),
        }
    }

    async fn reject(&self, id: RequestId, cause: SubmitError) -> SubmitError {
        warn!(request_id = %id, error = %cause, "request rejected at admission");
        self.emitter
            .emit(EventKind::Queue(QueueEvent::AdmissionRejected { id, cause: cause.clone() }))
            .await;
        cause
    }

    /// Stop accepting, drain for up to `grace`, then fail whatever is left.
    ///
    /// Idempotent: concurrent callers are serialized and later calls return an empty report.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let _serial = self.transitions.lock().await;
        match self.state() {
            ControllerState::Stopped => return ShutdownReport { drained: true, forced_failures: 0 },
            ControllerState::NotStarted => {
                self.shutdown.cancel();
                self.health.transition(HealthState::Terminated);
                self.set_state(ControllerState::Stopped).await;
                return ShutdownReport { drained: true, forced_failures: 0 };
            }
            ControllerState::Running | ControllerState::Draining => {}
        }

        self.health.transition(HealthState::Terminating);
        self.set_state(ControllerState::Draining).await;
        if let Some(queue) = &self.queue {
            queue.close();
        }
        self.inline.close();

        let drain = async {
            if let Some(queue) = &self.queue {
                queue.wait_idle().await;
            }
            self.inline.wait().await;
        };
        let drained = tokio::time::timeout(grace, drain).await.is_ok();
        if !drained {
            warn!(?grace, held = self.held(), "grace period elapsed, forcing shutdown");
        }

        self.shutdown.cancel();
        let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pool) = pool {
            pool.join().await;
        }
        self.inline.wait().await;
        self.retry.wait_timers().await;

        if let Some(queue) = &self.queue {
            let mut leftovers = self.retry.drain_waiting();
            leftovers.extend(queue.drain());
            for request in leftovers {
                self.pipeline.fail_for_shutdown(request.id()).await;
                queue.abandon(request.id());
            }
        }

        self.health.transition(HealthState::Terminated);
        self.set_state(ControllerState::Stopped).await;
        ShutdownReport { drained, forced_failures: self.pipeline.forced_failures() }
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
