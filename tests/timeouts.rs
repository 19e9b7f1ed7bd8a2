mod common;

use common::hanging;
use exporthelper::telemetry::{AttemptEvent, EventKind, OutcomeEvent};
use exporthelper::{
    exporter_fn, Batch, ConfigError, ExporterConfig, LifecycleController, MemorySink, QueueConfig,
    RetryConfig, SendContext, SendError, TrackingSleeper, MAX_DURATION,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn hung_attempt_times_out_and_counts_as_retryable() {
    let sink = MemorySink::new();
    let (exporter, _started) = hanging();
    let config = ExporterConfig::default()
        .with_timeout(Duration::from_millis(50))
        .with_retry(RetryConfig::disabled());
    let controller =
        LifecycleController::builder(config, exporter).with_sink(sink.clone()).build().unwrap();
    controller.start().await.unwrap();

    let id = controller.submit(Batch::from("x")).await.unwrap().id().unwrap();
    assert!(controller.shutdown(Duration::from_secs(5)).await.drained);

    let timed_out = sink.named("attempt_timed_out");
    assert_eq!(timed_out.len(), 1);
    assert_eq!(
        timed_out[0].kind,
        EventKind::Attempt(AttemptEvent::TimedOut { id, attempt: 1, timeout: Duration::from_millis(50) })
    );
    assert!(sink
        .events()
        .iter()
        .any(|e| e.kind == EventKind::Outcome(OutcomeEvent::Exhausted { id, attempts: 1 })));
}

#[tokio::test(start_paused = true)]
async fn timeout_cancels_the_exporters_token() {
    let observed_cancel = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&observed_cancel);
    let exporter = exporter_fn(move |_b: Batch, ctx: SendContext| {
        let seen = Arc::clone(&seen);
        async move {
            let token = ctx.cancel.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                seen.fetch_add(1, Ordering::SeqCst);
            });
            std::future::pending::<()>().await;
            Ok(())
        }
    });
    let config = ExporterConfig::default()
        .with_timeout(Duration::from_millis(20))
        .with_retry(RetryConfig::disabled());
    let controller = LifecycleController::new(config, exporter).unwrap();
    controller.start().await.unwrap();
    controller.submit(Batch::from("x")).await.unwrap();
    assert!(controller.shutdown(Duration::from_secs(1)).await.drained);
    tokio::task::yield_now().await;
    assert_eq!(observed_cancel.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn throttle_hint_extends_backoff_delay_inline() {
    let sleeper = TrackingSleeper::new();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let exporter = exporter_fn(move |_b: Batch, _c: SendContext| {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(SendError::throttled(Duration::from_secs(2), "429"))
            } else {
                Ok(())
            }
        }
    });
    let config = ExporterConfig::default()
        .with_queue(QueueConfig::disabled())
        .with_retry(RetryConfig {
            initial_interval: Duration::from_millis(100),
            max_elapsed_time: Duration::ZERO,
            ..RetryConfig::default()
        });
    let controller =
        LifecycleController::builder(config, exporter).with_sleeper(sleeper.clone()).build().unwrap();
    controller.start().await.unwrap();

    let submission = controller.submit(Batch::from("x")).await.unwrap();
    assert_eq!(
        submission,
        exporthelper::Submission::Completed(exporthelper::Outcome::Delivered { attempts: 2 })
    );
    assert_eq!(sleeper.calls(), vec![Duration::from_secs(2)]);
    controller.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn oversized_durations_are_refused_at_build() {
    let ok = || exporter_fn(|_b: Batch, _c: SendContext| async { Ok(()) });

    let err = LifecycleController::new(ExporterConfig::default().with_timeout(Duration::MAX), ok()).unwrap_err();
    assert!(matches!(err, ConfigError::DurationTooLarge { field: "timeout.timeout", .. }));

    let queue = QueueConfig { admission_wait: Duration::MAX, ..QueueConfig::default() };
    let err = LifecycleController::new(ExporterConfig::default().with_queue(queue), ok()).unwrap_err();
    assert!(matches!(err, ConfigError::DurationTooLarge { field: "queue.admission_wait", .. }));
}

#[tokio::test(start_paused = true)]
async fn longest_accepted_durations_still_deliver() {
    let exporter = exporter_fn(|_b: Batch, ctx: SendContext| async move {
        assert!(ctx.deadline.is_some());
        Ok(())
    });
    let config = ExporterConfig::default()
        .with_timeout(MAX_DURATION)
        .with_queue(QueueConfig { admission_wait: MAX_DURATION, ..QueueConfig::default() });
    let controller = LifecycleController::new(config, exporter).unwrap();
    controller.start().await.unwrap();

    let id = controller.submit(Batch::from("x")).await.unwrap().id();
    assert!(id.is_some());
    assert!(controller.shutdown(Duration::from_secs(1)).await.drained);
}
