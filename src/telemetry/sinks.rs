use super::events::DeliveryEvent;
use crate::request::RequestId;
use futures::future::{self, BoxFuture};
use std::collections::{HashSet, VecDeque};
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tower::Service;

type SinkFuture<E> = BoxFuture<'static, Result<(), E>>;

/// A telemetry sink that consumes delivery events.
pub trait TelemetrySink:
    tower::Service<DeliveryEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + Sync + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: DeliveryEvent)
where
    S: tower::Service<DeliveryEvent, Response = ()> + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<DeliveryEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: DeliveryEvent) -> Self::Future {
        Box::pin(future::ok(()))
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<DeliveryEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DeliveryEvent) -> Self::Future {
        tracing::info!(
            category = event.kind.category(),
            event = event.kind.name(),
            health = %event.health,
            request_id = event.request_id().map(|id| id.0),
            "{}",
            event.kind
        );
        Box::pin(future::ok(()))
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps delivery events in memory for assertions and debugging.
///
/// Bounded: once `capacity` events are held the oldest is evicted and counted.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<DeliveryEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn unbounded() -> Self {
        Self::with_capacity(usize::MAX)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DeliveryEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn matching(&self, keep: impl Fn(&DeliveryEvent) -> bool) -> Vec<DeliveryEvent> {
        self.lock().iter().filter(|&e| keep(e)).cloned().collect()
    }

    pub fn events(&self) -> Vec<DeliveryEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Events whose name (see [`EventKind::name`](super::EventKind::name)) equals `name`.
    pub fn named(&self, name: &str) -> Vec<DeliveryEvent> {
        self.matching(|e| e.kind.name() == name)
    }

    /// Every event about request `id`, in emission order.
    pub fn for_request(&self, id: RequestId) -> Vec<DeliveryEvent> {
        self.matching(|e| e.request_id() == Some(id))
    }

    /// Events that settled a request: delivery, exhaustion, forced shutdown, or rejection.
    pub fn terminal(&self) -> Vec<DeliveryEvent> {
        self.matching(|e| e.terminal_request().is_some())
    }

    /// Ids that reached a terminal event more than once. Empty in a healthy run.
    pub fn settled_twice(&self) -> Vec<RequestId> {
        let mut seen = HashSet::new();
        let mut twice = Vec::new();
        for id in self.lock().iter().filter_map(DeliveryEvent::terminal_request) {
            if !seen.insert(id) && !twice.contains(&id) {
                twice.push(id);
            }
        }
        twice
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<DeliveryEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DeliveryEvent) -> Self::Future {
        let mut events = self.lock();
        if events.len() >= self.capacity && events.pop_front().is_some() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event);
        Box::pin(future::ok(()))
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Broadcasts events to any number of live subscribers over a tokio channel.
///
/// Slow subscribers lag (see `broadcast::error::RecvError::Lagged`); events published with
/// no subscriber attached are counted as dropped.
#[derive(Clone, Debug)]
pub struct StreamingSink {
    sender: broadcast::Sender<DeliveryEvent>,
    published: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl StreamingSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, published: Arc::new(AtomicU64::new(0)), dropped: Arc::new(AtomicU64::new(0)) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events handed to at least one subscriber.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Events sent while nobody was subscribed.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Service<DeliveryEvent> for StreamingSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DeliveryEvent) -> Self::Future {
        let counter = match self.sender.send(event) {
            Ok(_) => &self.published,
            Err(_) => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Box::pin(future::ok(()))
    }
}

impl TelemetrySink for StreamingSink {
    type SinkError = Infallible;
}

type Predicate = Arc<dyn Fn(&DeliveryEvent) -> bool + Send + Sync>;

/// Forwards only the events accepted by a predicate; the rest complete immediately.
#[derive(Clone)]
pub struct FilterSink<S> {
    inner: S,
    keep: Predicate,
}

impl<S> FilterSink<S> {
    pub fn new(inner: S, keep: impl Fn(&DeliveryEvent) -> bool + Send + Sync + 'static) -> Self {
        Self { inner, keep: Arc::new(keep) }
    }

    /// Only events that settle a request.
    pub fn terminal(inner: S) -> Self {
        Self::new(inner, |e| e.terminal_request().is_some())
    }

    /// Only events of one category (`queue`, `attempt`, `outcome`, `lifecycle`).
    pub fn category(inner: S, category: &'static str) -> Self {
        Self::new(inner, move |e| e.kind.category() == category)
    }

    /// Only events about request `id`.
    pub fn request(inner: S, id: RequestId) -> Self {
        Self::new(inner, move |e| e.request_id() == Some(id))
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: fmt::Debug> fmt::Debug for FilterSink<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterSink").field("inner", &self.inner).finish_non_exhaustive()
    }
}

impl<S> Service<DeliveryEvent> for FilterSink<S>
where
    S: Service<DeliveryEvent, Response = ()>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = ();
    type Error = S::Error;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, event: DeliveryEvent) -> Self::Future {
        if (self.keep)(&event) {
            Box::pin(self.inner.call(event))
        } else {
            Box::pin(future::ok(()))
        }
    }
}

impl<S> TelemetrySink for FilterSink<S>
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    type SinkError = S::SinkError;
}

/// Failure of one branch of a [`MulticastSink`].
#[derive(Debug, thiserror::Error)]
#[error("telemetry sink error: {0}")]
pub struct ComposedSinkError(#[source] Box<dyn std::error::Error + Send + Sync>);

impl ComposedSinkError {
    fn wrap(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Box::new(e))
    }
}

/// Delivers every event to two sinks concurrently.
///
/// Both branches always run; if both fail, the first error is returned and the second is
/// logged at debug.
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    primary: A,
    secondary: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(primary: A, secondary: B) -> Self {
        Self { primary, secondary }
    }
}

impl<A, B> Service<DeliveryEvent> for MulticastSink<A, B>
where
    A: Service<DeliveryEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: Service<DeliveryEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = ComposedSinkError;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DeliveryEvent) -> Self::Future {
        use tower::ServiceExt;

        let primary = self.primary.clone().oneshot(event.clone());
        let secondary = self.secondary.clone().oneshot(event);
        Box::pin(async move {
            match tokio::join!(primary, secondary) {
                (Ok(()), Ok(())) => Ok(()),
                (Err(e), Ok(())) => Err(ComposedSinkError::wrap(e)),
                (Ok(()), Err(e)) => Err(ComposedSinkError::wrap(e)),
                (Err(first), Err(second)) => {
                    tracing::debug!(error = %second, "secondary telemetry sink also failed");
                    Err(ComposedSinkError::wrap(first))
                }
            }
        })
    }
}

impl<A, B> TelemetrySink for MulticastSink<A, B>
where
    A: Service<DeliveryEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: Service<DeliveryEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type SinkError = ComposedSinkError;
}
