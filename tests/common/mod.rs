#![allow(dead_code)]

use exporthelper::telemetry::{EventKind, OutcomeEvent};
use exporthelper::{
    exporter_fn, Batch, DeliveryEvent, Exporter, MemorySink, RequestId, SendContext, SendError,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Exporter that replays a fixed script of results, then succeeds.
pub fn scripted(script: Vec<Result<(), SendError>>) -> (impl Exporter, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let script = Arc::new(Mutex::new(VecDeque::from(script)));
    let counter = Arc::clone(&calls);
    let exporter = exporter_fn(move |_batch: Batch, _ctx: SendContext| {
        let script = Arc::clone(&script);
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    });
    (exporter, calls)
}

/// Exporter that always fails with `error`.
pub fn always_failing(error: SendError) -> (impl Exporter, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let exporter = exporter_fn(move |_batch: Batch, _ctx: SendContext| {
        let counter = Arc::clone(&counter);
        let error = error.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(error)
        }
    });
    (exporter, calls)
}

/// Exporter that signals `started` and then never returns.
pub fn hanging() -> (impl Exporter, Arc<Notify>) {
    let started = Arc::new(Notify::new());
    let signal = Arc::clone(&started);
    let exporter = exporter_fn(move |_batch: Batch, _ctx: SendContext| {
        let signal = Arc::clone(&signal);
        async move {
            signal.notify_one();
            std::future::pending::<()>().await;
            Ok(())
        }
    });
    (exporter, started)
}

/// Exporter that sleeps for `delay` and tracks the peak number of concurrent sends.
pub fn slow(delay: Duration) -> (impl Exporter, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
    let exporter = exporter_fn(move |_batch: Batch, _ctx: SendContext| {
        let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
        async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    });
    (exporter, active, peak)
}

/// Terminal outcome events for `id`.
pub fn terminal_events(sink: &MemorySink, id: RequestId) -> Vec<DeliveryEvent> {
    sink.events().into_iter().filter(|e| e.terminal_request() == Some(id)).collect()
}

pub fn delivered_ids(sink: &MemorySink) -> Vec<RequestId> {
    sink.events()
        .into_iter()
        .filter_map(|e| match e.kind {
            EventKind::Outcome(OutcomeEvent::Delivered { id, .. }) => Some(id),
            _ => None,
        })
        .collect()
}
