//! The attempt -> classify -> decide path shared by queued workers and inline submits.

use crate::clock::Clock;
use crate::exporter::Exporter;
use crate::health::HealthState;
use crate::queue::RequestQueue;
use crate::request::{FailureCause, Outcome, Request, RequestId};
use crate::retry::{RetryDecision, RetryScheduler};
use crate::sleeper::Sleeper;
use crate::telemetry::{AttemptEvent, Emitter, EventKind, OutcomeEvent};
use crate::timeout::TimeoutGuard;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of one attempt, before the caller settles the request.
enum Step {
    Delivered,
    Retry(Duration),
    Failed(FailureCause),
}

pub(crate) struct Pipeline {
    pub(crate) exporter: Arc<dyn Exporter>,
    pub(crate) guard: TimeoutGuard,
    pub(crate) retry: Arc<RetryScheduler>,
    pub(crate) sleeper: Arc<dyn Sleeper>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) emitter: Emitter,
    pub(crate) shutdown: CancellationToken,
    pub(crate) forced: AtomicUsize,
}

impl Pipeline {
    /// Run one attempt for a dequeued request and settle it: release its slot on a terminal
    /// outcome, or park it for retry.
    pub(crate) async fn process(&self, mut request: Request, queue: &Arc<RequestQueue>) -> Outcome {
        let id = request.id();
        let step = self.attempt_once(&mut request).await;
        let outcome = match step {
            Step::Retry(delay) => {
                self.retry.park(request, delay, Arc::clone(queue));
                return Outcome::RetryScheduled(delay);
            }
            Step::Delivered => {
                queue.release(id).await;
                Outcome::Delivered { attempts: request.attempts() }
            }
            Step::Failed(cause) => {
                if cause.is_shutdown() {
                    queue.abandon(id);
                } else {
                    queue.release(id).await;
                }
                Outcome::PermanentlyFailed(cause)
            }
        };

        if queue.held() == 0 {
            self.emitter.health().transition(HealthState::Idle);
        }
        outcome
    }

    /// Deliver on the caller's task, sleeping between retries.
    pub(crate) async fn process_inline(&self, mut request: Request) -> Outcome {
        loop {
            match self.attempt_once(&mut request).await {
                Step::Retry(delay) => {
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => {
                            self.fail_for_shutdown(request.id()).await;
                            return Outcome::PermanentlyFailed(FailureCause::Shutdown);
                        }
                        _ = self.sleeper.sleep(delay) => {}
                    }
                }
                step => return self.settle_inline(step, &request),
            }
        }
    }

    fn settle_inline(&self, step: Step, request: &Request) -> Outcome {
        match step {
            Step::Delivered => Outcome::Delivered { attempts: request.attempts() },
            Step::Retry(delay) => Outcome::RetryScheduled(delay),
            Step::Failed(cause) => Outcome::PermanentlyFailed(cause),
        }
    }

    async fn attempt_once(&self, request: &mut Request) -> Step {
        let id = request.id();
        let attempt = self.retry.begin_attempt(request);
        let health = self.emitter.health();
        if health.get() == HealthState::Idle {
            health.transition(HealthState::Connected);
        }
        self.emitter.emit(EventKind::Attempt(AttemptEvent::Started { id, attempt })).await;

        let result = self.guard.attempt(&*self.exporter, request.batch(), attempt, &self.shutdown).await;
        let error = match result {
            Ok(()) => {
                self.retry.on_success(request);
                health.transition(HealthState::Connected);
                let duration = self.clock.now().saturating_duration_since(request.enqueued_at());
                debug!(request_id = %id, attempt, ?duration, "request delivered");
                self.emitter
                    .emit(EventKind::Outcome(OutcomeEvent::Delivered { id, attempts: attempt, duration }))
                    .await;
                return Step::Delivered;
            }
            Err(error) => error,
        };

        if let Some((_, timeout)) = error.timeout_details() {
            self.emitter.emit(EventKind::Attempt(AttemptEvent::TimedOut { id, attempt, timeout })).await;
        }

        match self.retry.on_failure(request, error.clone()) {
            RetryDecision::Retry { delay } => {
                debug!(request_id = %id, attempt, ?delay, error = %error, "attempt failed, retrying");
                self.emitter
                    .emit(EventKind::Attempt(AttemptEvent::RetryableFailure { id, attempt, next_delay: delay }))
                    .await;
                Step::Retry(delay)
            }
            RetryDecision::GiveUp(cause) => {
                match &cause {
                    FailureCause::Permanent(e) => {
                        warn!(request_id = %id, attempt, error = %e, "dropping request after permanent failure");
                        self.emitter
                            .emit(EventKind::Attempt(AttemptEvent::PermanentFailure {
                                id,
                                attempt,
                                reason: e.to_string(),
                            }))
                            .await;
                    }
                    FailureCause::Exhausted { attempts, last_error } => {
                        warn!(request_id = %id, attempts, error = %last_error, "dropping request, retries exhausted");
                        self.emitter
                            .emit(EventKind::Outcome(OutcomeEvent::Exhausted { id, attempts: *attempts }))
                            .await;
                    }
                    FailureCause::Shutdown => self.fail_for_shutdown(id).await,
                }
                Step::Failed(cause)
            }
        }
    }

    /// Report a request failed by a forced shutdown.
    pub(crate) async fn fail_for_shutdown(&self, id: RequestId) {
        self.forced.fetch_add(1, Ordering::Relaxed);
        warn!(request_id = %id, "request failed by forced shutdown");
        self.emitter.emit(EventKind::Outcome(OutcomeEvent::ShutdownForced { id })).await;
    }

    pub(crate) fn forced_failures(&self) -> usize {
        self.forced.load(Ordering::Relaxed)
    }
}
