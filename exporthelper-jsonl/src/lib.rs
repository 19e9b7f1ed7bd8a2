//! JSONL sink for `exporthelper`. Writes one delivery event per line.
//! Always appends; bring your own path.

use exporthelper::telemetry::{event_to_json, DeliveryEvent, TelemetrySink};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Mutex;

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: Arc<PathBuf>,
    // serializes appends so concurrent workers never interleave partial lines
    write_lock: Arc<Mutex<()>>,
}

impl JsonlSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: Arc::new(path.into()), write_lock: Arc::new(Mutex::new(())) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl tower_service::Service<DeliveryEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DeliveryEvent) -> Self::Future {
        let path = Arc::clone(&self.path);
        let write_lock = Arc::clone(&self.write_lock);
        let line = event_to_json(&event).to_string() + "\n";
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let _guard = write_lock.lock().await;
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path.as_path())
                .await
            {
                Ok(file) => file,
                Err(e) => {
                    tracing::debug!(error = %e, path = %path.display(), "jsonl sink open failed");
                    return Err(e);
                }
            };
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            Ok(())
        })
    }
}

impl TelemetrySink for JsonlSink {
    type SinkError = io::Error;
}
