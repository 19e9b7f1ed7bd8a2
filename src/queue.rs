//! Bounded FIFO of requests awaiting a worker.
//!
//! Semantics:
//! - Capacity bounds every request the core holds, not just the ones sitting in the FIFO: a
//!   slot is taken at admission and given back only when the request reaches a terminal
//!   outcome (`release` / `abandon`). In-flight and retry-parked requests keep their slot.
//! - `requeue` puts a retried request back at the tail without a capacity check.
//! - After `close`, admission fails but `dequeue` keeps serving queued and re-queued items
//!   until the core holds nothing, then returns `None`.
//!
//! All state lives behind one mutex; wake-ups go through `Notify`, using the
//! enable-then-check pattern so no notification is lost between the check and the await.

use crate::error::SubmitError;
use crate::request::{Request, RequestId};
use crate::storage::QueueStorage;
use std::collections::VecDeque;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Request>,
    held: usize,
    closed: bool,
}

/// Bounded request queue with optional write-through storage.
#[derive(Debug)]
pub struct RequestQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    admission_wait: Duration,
    storage: Option<Arc<dyn QueueStorage>>,
    items_available: Notify,
    space_available: Notify,
    idle: Notify,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity,
            admission_wait: Duration::ZERO,
            storage: None,
            items_available: Notify::new(),
            space_available: Notify::new(),
            idle: Notify::new(),
        }
    }

    /// Let `enqueue` wait up to `wait` for a free slot instead of failing immediately.
    pub fn with_admission_wait(mut self, wait: Duration) -> Self {
        self.admission_wait = wait;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn QueueStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a new request. Returns the FIFO depth after insertion.
    ///
    /// The request is persisted (when storage is configured) before it becomes visible to
    /// workers; a storage failure gives the slot back and surfaces as `SubmitError::Storage`.
    pub async fn enqueue(&self, request: Request) -> Result<usize, SubmitError> {
        self.reserve().await?;
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.persist(request.id(), request.batch()).await {
                self.give_back_slot();
                return Err(e.into());
            }
        }
        Ok(self.push(request))
    }

    /// Admit a request recovered from storage. Never waits and never re-persists.
    pub(crate) fn restore(&self, request: Request) -> Result<usize, SubmitError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(SubmitError::NotRunning);
            }
            if state.held >= self.capacity {
                return Err(SubmitError::Full { held: state.held, capacity: self.capacity });
            }
            state.held += 1;
        }
        Ok(self.push(request))
    }

    /// Put a retried request back at the tail. Its slot is still held, so this cannot fail.
    pub fn requeue(&self, request: Request) {
        self.push(request);
    }

    fn push(&self, request: Request) -> usize {
        let depth = {
            let mut state = self.lock();
            state.items.push_back(request);
            state.items.len()
        };
        self.items_available.notify_one();
        depth
    }

    async fn reserve(&self) -> Result<(), SubmitError> {
        let deadline = Instant::now().checked_add(self.admission_wait);
        loop {
            let mut notified = pin!(self.space_available.notified());
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.closed {
                    return Err(SubmitError::NotRunning);
                }
                if state.held < self.capacity {
                    state.held += 1;
                    return Ok(());
                }
                if self.admission_wait.is_zero() || deadline.is_some_and(|at| Instant::now() >= at) {
                    return Err(SubmitError::Full { held: state.held, capacity: self.capacity });
                }
            }
            // On timeout the next pass re-checks once and reports `Full`.
            match deadline {
                Some(at) => {
                    let _ = tokio::time::timeout_at(at, notified).await;
                }
                None => notified.await,
            }
        }
    }

    fn give_back_slot(&self) {
        let (held, closed) = {
            let mut state = self.lock();
            state.held = state.held.saturating_sub(1);
            (state.held, state.closed)
        };
        self.space_available.notify_one();
        if held == 0 {
            self.idle.notify_waiters();
            if closed {
                self.items_available.notify_waiters();
            }
        }
    }

    /// Wait for the next request. `None` once the queue is closed and nothing is held.
    ///
    /// Cancel-safe: dropping the future never loses a request.
    pub async fn dequeue(&self) -> Option<Request> {
        loop {
            let mut notified = pin!(self.items_available.notified());
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(request) = state.items.pop_front() {
                    if !state.items.is_empty() {
                        self.items_available.notify_one();
                    }
                    return Some(request);
                }
                if state.closed && state.held == 0 {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Give back the slot of a request that reached a terminal outcome and delete its
    /// persisted copy.
    pub async fn release(&self, id: RequestId) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.release(id).await {
                warn!(request_id = %id, error = %e, "failed to delete persisted request");
            }
        }
        self.give_back_slot();
    }

    /// Give back the slot but keep the persisted copy, so the request is replayed on the
    /// next start. Used for requests failed by a forced shutdown.
    pub fn abandon(&self, id: RequestId) {
        if self.storage.is_some() {
            debug!(request_id = %id, "keeping persisted copy for replay");
        }
        self.give_back_slot();
    }

    /// Stop admitting. Idempotent.
    pub fn close(&self) {
        let idle = {
            let mut state = self.lock();
            state.closed = true;
            state.held == 0
        };
        self.space_available.notify_waiters();
        if idle {
            self.items_available.notify_waiters();
        }
    }

    /// Resolves once the core holds no requests.
    pub async fn wait_idle(&self) {
        loop {
            let mut notified = pin!(self.idle.notified());
            notified.as_mut().enable();
            if self.lock().held == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Remove every request still waiting in the FIFO. Their slots stay held until the caller
    /// releases or abandons them.
    pub fn drain(&self) -> Vec<Request> {
        self.lock().items.drain(..).collect()
    }

    /// Requests waiting in the FIFO.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Requests held anywhere in the core (queued, in flight, or parked for retry).
    pub fn held(&self) -> usize {
        self.lock().held
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
