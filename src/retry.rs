//! Retry scheduling for failed delivery attempts.
//!
//! Semantics:
//! - States run `Fresh -> Attempting -> {Succeeded | WaitingForRetry -> Attempting | Exhausted}`.
//! - Timeouts, retryable and throttled send errors are retried. Permanent errors and
//!   shutdown cancellation are not, and consume no retry budget.
//! - The delay before retry `n` (1-based) is the exponential base delay with symmetric jitter.
//!   A throttled error's `retry_after` raises the delay to at least the hint, which may
//!   exceed `max_interval`; the sink's hint wins over the cap.
//! - With a nonzero `max_elapsed_time`, a retry whose delay would end past the budget
//!   (measured from the first attempt) is not scheduled; the request is exhausted instead.
//! - Retry disabled: the first retryable failure exhausts the request.
//!
//! Waiting is passive: a parked request sits in a mutex-guarded map while a timer task sleeps
//! through the injected [`Sleeper`], then moves it back to the tail of the queue. No worker is
//! occupied while a request waits.

use crate::backoff::ExponentialBackoff;
use crate::clock::{Clock, TokioClock};
use crate::config::RetryConfig;
use crate::error::{AttemptError, ConfigError, SendError};
use crate::jitter::Jitter;
use crate::queue::RequestQueue;
use crate::request::{FailureCause, Request, RequestId};
use crate::sleeper::{Sleeper, TokioSleeper};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::trace;

/// Where a request stands in its retry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Fresh,
    Attempting,
    WaitingForRetry { delay: Duration },
    Succeeded,
    Exhausted,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp(FailureCause),
}

type WaitingMap = Arc<Mutex<HashMap<RequestId, Request>>>;

/// Decides retries and holds requests while they wait.
pub struct RetryScheduler {
    backoff: Option<ExponentialBackoff>,
    jitter: Jitter,
    max_elapsed: Option<Duration>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    rng: Option<Mutex<StdRng>>,
    waiting: WaitingMap,
    timers: TaskTracker,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("max_elapsed", &self.max_elapsed)
            .field("sleeper", &"<sleeper>")
            .field("waiting", &self.waiting_len())
            .finish()
    }
}

impl RetryScheduler {
    /// Build a scheduler from validated settings. When retry is disabled no backoff is kept.
    pub fn new(config: &RetryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let backoff = if config.enabled { Some(config.backoff()?) } else { None };
        Ok(Self {
            backoff,
            jitter: config.jitter(),
            max_elapsed: (!config.max_elapsed_time.is_zero()).then_some(config.max_elapsed_time),
            clock: Arc::new(TokioClock),
            sleeper: Arc::new(TokioSleeper),
            rng: None,
            waiting: Arc::new(Mutex::new(HashMap::new())),
            timers: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Provide a custom sleeper for retry timers.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Provide the clock used for the elapsed-time budget.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Seed jitter for reproducible delays.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Some(Mutex::new(StdRng::seed_from_u64(seed)));
        self
    }

    /// Timers stop early (leaving their request parked) once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.backoff.is_some()
    }

    /// Mark the start of an attempt; returns the 1-based attempt number.
    pub fn begin_attempt(&self, request: &mut Request) -> u32 {
        request.begin_attempt(self.clock.now());
        request.attempts()
    }

    pub fn on_success(&self, request: &mut Request) {
        request.set_state(RetryState::Succeeded);
    }

    /// Classify a failed attempt and pick the next step.
    pub fn on_failure(&self, request: &mut Request, error: AttemptError) -> RetryDecision {
        let error = match error {
            AttemptError::Cancelled => return give_up(request, FailureCause::Shutdown),
            AttemptError::Send(e @ SendError::Permanent(_)) => {
                return give_up(request, FailureCause::Permanent(e))
            }
            retryable => retryable,
        };

        let Some(backoff) = self.backoff else {
            return give_up(request, exhausted(request, error));
        };

        let jittered = self.jittered(backoff.delay(request.attempts() as usize));
        let delay = match &error {
            AttemptError::Send(e) => e.retry_after().map_or(jittered, |hint| hint.max(jittered)),
            _ => jittered,
        };

        if let (Some(budget), Some(first)) = (self.max_elapsed, request.first_attempt_at()) {
            let spent = self.clock.now().saturating_duration_since(first);
            if spent.saturating_add(delay) > budget {
                trace!(request_id = %request.id(), ?spent, ?delay, "retry budget exceeded");
                return give_up(request, exhausted(request, error));
            }
        }

        request.set_state(RetryState::WaitingForRetry { delay });
        RetryDecision::Retry { delay }
    }

    fn jittered(&self, base: Duration) -> Duration {
        match &self.rng {
            Some(rng) => {
                let mut rng = rng.lock().unwrap_or_else(PoisonError::into_inner);
                self.jitter.apply_with_rng(base, &mut *rng)
            }
            None => self.jitter.apply(base),
        }
    }

    /// Hold `request` for `delay`, then put it back at the tail of `queue`.
    pub fn park(&self, request: Request, delay: Duration, queue: Arc<RequestQueue>) {
        let id = request.id();
        self.lock_waiting().insert(id, request);

        let waiting = Arc::clone(&self.waiting);
        let sleep = self.sleeper.sleep(delay);
        let cancel = self.cancel.clone();
        self.timers.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = sleep => {
                    let parked = waiting.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
                    if let Some(request) = parked {
                        trace!(request_id = %id, "retry timer fired");
                        queue.requeue(request);
                    }
                }
            }
        });
    }

    /// Requests currently waiting for a retry timer.
    pub fn waiting_len(&self) -> usize {
        self.lock_waiting().len()
    }

    /// Wait for every timer task to finish. Call after cancellation to make sure no timer is
    /// still about to requeue.
    pub async fn wait_timers(&self) {
        self.timers.close();
        self.timers.wait().await;
    }

    /// Take every parked request out of the map.
    pub fn drain_waiting(&self) -> Vec<Request> {
        let mut drained: Vec<Request> = self.lock_waiting().drain().map(|(_, r)| r).collect();
        drained.sort_by_key(Request::id);
        drained
    }

    fn lock_waiting(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, Request>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn give_up(request: &mut Request, cause: FailureCause) -> RetryDecision {
    request.set_state(RetryState::Exhausted);
    RetryDecision::GiveUp(cause)
}

fn exhausted(request: &Request, last_error: AttemptError) -> FailureCause {
    FailureCause::Exhausted { attempts: request.attempts(), last_error }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::request::Batch;
    use crate::sleeper::TrackingSleeper;
    use tokio::time::Instant;

    fn config(initial_ms: u64, max_ms: u64, budget_ms: u64) -> RetryConfig {
        RetryConfig {
            enabled: true,
            initial_interval: Duration::from_millis(initial_ms),
            max_interval: Duration::from_millis(max_ms),
            max_elapsed_time: Duration::from_millis(budget_ms),
            randomization_factor: 0.0,
        }
    }

    fn request(id: u64) -> Request {
        Request::new(RequestId(id), Batch::from("payload"), Instant::now())
    }

    fn retryable() -> AttemptError {
        AttemptError::Send(SendError::retryable("503"))
    }

    #[test]
    fn base_delays_double_and_cap() {
        let scheduler = RetryScheduler::new(&config(100, 400, 0)).unwrap();
        let mut req = request(1);
        let mut delays = Vec::new();
        for _ in 0..5 {
            scheduler.begin_attempt(&mut req);
            match scheduler.on_failure(&mut req, retryable()) {
                RetryDecision::Retry { delay } => delays.push(delay.as_millis()),
                other => panic!("expected retry, got {:?}", other),
            }
        }
        assert_eq!(delays, vec![100, 200, 400, 400, 400]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(req.state(), RetryState::WaitingForRetry { delay: Duration::from_millis(400) });
    }

    #[test]
    fn permanent_error_gives_up_immediately() {
        let scheduler = RetryScheduler::new(&config(100, 400, 0)).unwrap();
        let mut req = request(1);
        scheduler.begin_attempt(&mut req);
        let decision =
            scheduler.on_failure(&mut req, AttemptError::Send(SendError::permanent("400 bad request")));
        assert_eq!(
            decision,
            RetryDecision::GiveUp(FailureCause::Permanent(SendError::permanent("400 bad request")))
        );
        assert_eq!(req.state(), RetryState::Exhausted);
    }

    #[test]
    fn cancellation_is_a_shutdown_failure() {
        let scheduler = RetryScheduler::new(&config(100, 400, 0)).unwrap();
        let mut req = request(1);
        scheduler.begin_attempt(&mut req);
        assert_eq!(
            scheduler.on_failure(&mut req, AttemptError::Cancelled),
            RetryDecision::GiveUp(FailureCause::Shutdown)
        );
    }

    #[test]
    fn disabled_retry_exhausts_after_first_failure() {
        let scheduler = RetryScheduler::new(&RetryConfig::disabled()).unwrap();
        assert!(!scheduler.is_enabled());
        let mut req = request(1);
        scheduler.begin_attempt(&mut req);
        let decision = scheduler.on_failure(&mut req, retryable());
        assert_eq!(
            decision,
            RetryDecision::GiveUp(FailureCause::Exhausted { attempts: 1, last_error: retryable() })
        );
    }

    #[test]
    fn elapsed_budget_stops_retries() {
        let clock = ManualClock::new();
        let scheduler = RetryScheduler::new(&config(100, 1_000, 250))
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        let mut req = request(1);

        scheduler.begin_attempt(&mut req);
        assert_eq!(
            scheduler.on_failure(&mut req, retryable()),
            RetryDecision::Retry { delay: Duration::from_millis(100) }
        );
        clock.advance(Duration::from_millis(100));

        scheduler.begin_attempt(&mut req);
        // 100ms spent + 200ms delay > 250ms budget
        match scheduler.on_failure(&mut req, retryable()) {
            RetryDecision::GiveUp(FailureCause::Exhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[test]
    fn throttle_delay_overrides_backoff() {
        let scheduler = RetryScheduler::new(&config(100, 400, 0)).unwrap();
        let mut req = request(1);
        scheduler.begin_attempt(&mut req);
        let throttled = AttemptError::Send(SendError::throttled(Duration::from_secs(3), "429"));
        assert_eq!(
            scheduler.on_failure(&mut req, throttled),
            RetryDecision::Retry { delay: Duration::from_secs(3) }
        );
    }

    #[test]
    fn short_throttle_hint_never_undercuts_backoff() {
        let scheduler = RetryScheduler::new(&config(100, 400, 0)).unwrap();
        let mut req = request(1);
        for _ in 0..3 {
            scheduler.begin_attempt(&mut req);
            assert!(matches!(scheduler.on_failure(&mut req, retryable()), RetryDecision::Retry { .. }));
        }
        // Fourth retry backs off 400ms; a 10ms hint must not shorten it.
        scheduler.begin_attempt(&mut req);
        let throttled = AttemptError::Send(SendError::throttled(Duration::from_millis(10), "429"));
        assert_eq!(
            scheduler.on_failure(&mut req, throttled),
            RetryDecision::Retry { delay: Duration::from_millis(400) }
        );
    }

    #[test]
    fn throttle_delay_still_bounded_by_budget() {
        let scheduler = RetryScheduler::new(&config(100, 400, 1_000)).unwrap().with_clock(Arc::new(ManualClock::new()));
        let mut req = request(1);
        scheduler.begin_attempt(&mut req);
        let throttled = AttemptError::Send(SendError::throttled(Duration::from_secs(3), "429"));
        assert!(matches!(scheduler.on_failure(&mut req, throttled), RetryDecision::GiveUp(_)));
    }

    #[test]
    fn timeouts_are_retried() {
        let scheduler = RetryScheduler::new(&config(100, 400, 0)).unwrap();
        let mut req = request(1);
        scheduler.begin_attempt(&mut req);
        let timeout = AttemptError::Timeout {
            elapsed: Duration::from_millis(50),
            timeout: Duration::from_millis(50),
        };
        assert!(matches!(scheduler.on_failure(&mut req, timeout), RetryDecision::Retry { .. }));
    }

    #[test]
    fn seeded_jitter_is_reproducible_and_bounded() {
        let cfg = RetryConfig { randomization_factor: 0.5, ..config(1_000, 10_000, 0) };
        let delays = |seed| {
            let scheduler = RetryScheduler::new(&cfg).unwrap().with_rng_seed(seed);
            let mut req = request(1);
            scheduler.begin_attempt(&mut req);
            match scheduler.on_failure(&mut req, retryable()) {
                RetryDecision::Retry { delay } => delay,
                other => panic!("expected retry, got {:?}", other),
            }
        };
        let first = delays(7);
        assert_eq!(first, delays(7));
        assert!(first >= Duration::from_millis(500) && first <= Duration::from_millis(1_500));
    }

    #[tokio::test]
    async fn parked_request_returns_to_queue_tail() {
        let sleeper = TrackingSleeper::new();
        let scheduler = RetryScheduler::new(&config(100, 400, 0))
            .unwrap()
            .with_sleeper(Arc::new(sleeper.clone()));
        let queue = Arc::new(RequestQueue::new(4));
        queue.enqueue(request(1)).await.unwrap();
        queue.enqueue(request(2)).await.unwrap();

        let mut first = queue.dequeue().await.unwrap();
        scheduler.begin_attempt(&mut first);
        let RetryDecision::Retry { delay } = scheduler.on_failure(&mut first, retryable()) else {
            panic!("expected retry");
        };
        scheduler.park(first, delay, queue.clone());
        scheduler.wait_timers().await;

        assert_eq!(sleeper.calls(), vec![Duration::from_millis(100)]);
        assert_eq!(scheduler.waiting_len(), 0);
        assert_eq!(queue.dequeue().await.unwrap().id(), RequestId(2));
        let retried = queue.dequeue().await.unwrap();
        assert_eq!(retried.id(), RequestId(1));
        assert_eq!(retried.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timers_leave_requests_parked() {
        let cancel = CancellationToken::new();
        let scheduler =
            RetryScheduler::new(&config(100, 400, 0)).unwrap().with_cancellation(cancel.clone());
        let queue = Arc::new(RequestQueue::new(4));
        queue.enqueue(request(1)).await.unwrap();
        let req = queue.dequeue().await.unwrap();

        scheduler.park(req, Duration::from_secs(60), queue.clone());
        assert_eq!(scheduler.waiting_len(), 1);

        cancel.cancel();
        scheduler.wait_timers().await;
        let drained = scheduler.drain_waiting();
        assert_eq!(drained.len(), 1);
        assert!(queue.is_empty());
        assert_eq!(queue.held(), 1, "slot stays held until the caller settles the request");
    }
}
