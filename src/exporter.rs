//! The downstream seam: whatever actually ships a batch to the backend.
//!
//! Implement [`Exporter`] directly, wrap a closure with [`exporter_fn`], or adapt an existing
//! `tower::Service<Batch>` with [`ServiceExporter`].

use crate::error::SendError;
use crate::request::Batch;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-attempt information handed to the exporter.
#[derive(Debug, Clone)]
pub struct SendContext {
    /// 1-based attempt number for this request.
    pub attempt: u32,
    /// Absolute deadline for this attempt, when a timeout is configured.
    pub deadline: Option<Instant>,
    /// Cancelled when the attempt is abandoned (timeout or forced shutdown).
    pub cancel: CancellationToken,
}

impl SendContext {
    pub(crate) fn new(attempt: u32, deadline: Option<Instant>) -> Self {
        Self { attempt, deadline, cancel: CancellationToken::new() }
    }
}

/// Sends one batch downstream.
///
/// The future may be dropped at any await point when the attempt times out or the core shuts
/// down; `ctx.cancel` fires just before that for implementations that spawn their own work.
#[async_trait]
pub trait Exporter: Send + Sync + 'static {
    async fn send(&self, batch: &Batch, ctx: SendContext) -> Result<(), SendError>;
}

#[async_trait]
impl<E: Exporter + ?Sized> Exporter for Arc<E> {
    async fn send(&self, batch: &Batch, ctx: SendContext) -> Result<(), SendError> {
        (**self).send(batch, ctx).await
    }
}

/// Exporter backed by a closure; see [`exporter_fn`].
#[derive(Clone)]
pub struct FnExporter<F> {
    f: F,
}

impl<F> std::fmt::Debug for FnExporter<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnExporter").finish_non_exhaustive()
    }
}

/// Build an [`Exporter`] from a closure.
///
/// ```rust
/// use exporthelper::{exporter_fn, Batch, SendContext, SendError};
///
/// let exporter = exporter_fn(|batch: Batch, _ctx: SendContext| async move {
///     if batch.is_empty() {
///         Err(SendError::permanent("empty batch"))
///     } else {
///         Ok(())
///     }
/// });
/// # let _ = exporter;
/// ```
pub fn exporter_fn<F, Fut>(f: F) -> FnExporter<F>
where
    F: Fn(Batch, SendContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SendError>> + Send + 'static,
{
    FnExporter { f }
}

#[async_trait]
impl<F, Fut> Exporter for FnExporter<F>
where
    F: Fn(Batch, SendContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SendError>> + Send + 'static,
{
    async fn send(&self, batch: &Batch, ctx: SendContext) -> Result<(), SendError> {
        (self.f)(batch.clone(), ctx).await
    }
}

/// Adapts a cloneable `tower::Service<Batch>` into an [`Exporter`].
///
/// Each send clones the service and drives it through `ready` before calling, so backpressure
/// from the service is honored per attempt.
#[derive(Debug, Clone)]
pub struct ServiceExporter<S> {
    inner: S,
}

impl<S> ServiceExporter<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S> Exporter for ServiceExporter<S>
where
    S: tower::Service<Batch, Response = (), Error = SendError> + Clone + Send + Sync + 'static,
    S::Future: Send,
{
    async fn send(&self, batch: &Batch, _ctx: SendContext) -> Result<(), SendError> {
        use tower::ServiceExt;
        self.inner.clone().oneshot(batch.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn closure_exporter_receives_batch_and_attempt() {
        let seen = Arc::new(AtomicU32::new(0));
        let seen_clone = seen.clone();
        let exporter = exporter_fn(move |batch: Batch, ctx: SendContext| {
            let seen = seen_clone.clone();
            async move {
                assert_eq!(batch.payload(), b"metrics");
                seen.store(ctx.attempt, Ordering::SeqCst);
                Ok(())
            }
        });

        exporter.send(&Batch::from("metrics"), SendContext::new(3, None)).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn service_exporter_forwards_errors() {
        let svc = tower::service_fn(|batch: Batch| async move {
            if batch.is_empty() {
                Err(SendError::permanent("empty"))
            } else {
                Ok(())
            }
        });
        let exporter = ServiceExporter::new(svc);

        assert!(exporter.send(&Batch::from("x"), SendContext::new(1, None)).await.is_ok());
        let err = exporter.send(&Batch::new(Vec::new(), 0), SendContext::new(1, None)).await;
        assert_eq!(err, Err(SendError::permanent("empty")));
    }

    #[tokio::test]
    async fn arc_exporter_delegates() {
        let exporter: Arc<dyn Exporter> =
            Arc::new(exporter_fn(|_b: Batch, _c: SendContext| async { Err(SendError::retryable("busy")) }));
        let err = exporter.send(&Batch::from("x"), SendContext::new(1, None)).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
