//! Fixed set of symmetric workers draining the request queue.
//!
//! Each worker loops `dequeue -> attempt -> settle`. Because a worker runs one attempt at a
//! time, the number of concurrent sends never exceeds the worker count. Retry waits happen in
//! the scheduler's timers, not on a worker.

use crate::pipeline::Pipeline;
use crate::queue::RequestQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, Instrument};

/// Handle to the running workers.
#[derive(Debug)]
pub struct ConsumerPool {
    workers: TaskTracker,
    size: usize,
    in_flight: Arc<AtomicUsize>,
}

/// Decrements the in-flight gauge when an attempt finishes, even if it unwinds.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::AcqRel);
        Self(gauge)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ConsumerPool {
    /// Spawn `consumer_count` workers. They stop when the queue is closed and idle, or when
    /// `shutdown` is cancelled.
    pub(crate) fn start(
        consumer_count: usize,
        queue: Arc<RequestQueue>,
        pipeline: Arc<Pipeline>,
        shutdown: CancellationToken,
    ) -> Self {
        let workers = TaskTracker::new();
        let in_flight = Arc::new(AtomicUsize::new(0));

        for worker in 0..consumer_count {
            let queue = Arc::clone(&queue);
            let pipeline = Arc::clone(&pipeline);
            let shutdown = shutdown.clone();
            let in_flight = Arc::clone(&in_flight);
            let span = tracing::debug_span!("consumer", worker);
            workers.spawn(
                async move {
                    debug!("worker started");
                    loop {
                        let request = tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => break,
                            next = queue.dequeue() => match next {
                                Some(request) => request,
                                None => break,
                            },
                        };
                        let _gauge = InFlight::enter(&in_flight);
                        pipeline.process(request, &queue).await;
                    }
                    debug!("worker stopped");
                }
                .instrument(span),
            );
        }
        workers.close();

        Self { workers, size: consumer_count, in_flight }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Requests currently being attempted.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Resolves once every worker has exited.
    pub async fn join(&self) {
        self.workers.wait().await;
    }

    pub fn is_finished(&self) -> bool {
        self.workers.is_closed() && self.workers.is_empty()
    }
}
