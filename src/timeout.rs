//! Per-attempt deadline around a single exporter send.

use crate::error::AttemptError;
use crate::exporter::{Exporter, SendContext};
use crate::request::Batch;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Runs one send attempt under a deadline and the core's shutdown token.
///
/// When the deadline passes or shutdown is forced, the send future is dropped and the
/// attempt's own cancellation token (handed to the exporter in [`SendContext`]) is cancelled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutGuard {
    timeout: Option<Duration>,
}

impl TimeoutGuard {
    /// A zero duration disables the deadline.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout: (!timeout.is_zero()).then_some(timeout) }
    }

    pub fn disabled() -> Self {
        Self { timeout: None }
    }

    /// Inspect the configured deadline.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub async fn attempt<E>(
        &self,
        exporter: &E,
        batch: &Batch,
        attempt: u32,
        shutdown: &CancellationToken,
    ) -> Result<(), AttemptError>
    where
        E: Exporter + ?Sized,
    {
        let start = Instant::now();
        // A deadline past the clock's range is no deadline at all.
        let limit = self.timeout.and_then(|t| start.checked_add(t).map(|at| (at, t)));
        let ctx = SendContext::new(attempt, limit.map(|(at, _)| at));
        let attempt_token = ctx.cancel.clone();

        let deadline = async {
            match limit {
                Some((at, timeout)) => {
                    tokio::time::sleep_until(at).await;
                    timeout
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                attempt_token.cancel();
                Err(AttemptError::Cancelled)
            }
            result = exporter.send(batch, ctx) => result.map_err(AttemptError::from),
            timeout = deadline => {
                attempt_token.cancel();
                Err(AttemptError::Timeout { elapsed: start.elapsed(), timeout })
            }
        }
    }
}
