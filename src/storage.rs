//! Durable backing store for the request queue.
//!
//! A request is persisted when it is admitted and released once it reaches a terminal
//! outcome. Anything still persisted at startup is replayed into the queue with fresh retry
//! metadata, so delivery across a crash is at-least-once.

use crate::error::StorageError;
use crate::request::{Batch, RequestId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Storage backend for queued requests.
#[async_trait]
pub trait QueueStorage: Send + Sync + std::fmt::Debug + 'static {
    /// Durably record an admitted request. Called before the request becomes visible to workers.
    async fn persist(&self, id: RequestId, batch: &Batch) -> Result<(), StorageError>;

    /// Forget a request that reached a terminal outcome. Unknown ids are not an error.
    async fn release(&self, id: RequestId) -> Result<(), StorageError>;

    /// Everything persisted and not yet released, ordered by id.
    async fn recover(&self) -> Result<Vec<(RequestId, Batch)>, StorageError>;
}

/// In-memory storage. Clones share contents, so a clone kept by a test survives the controller
/// and can be handed to a new one to simulate a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<BTreeMap<RequestId, Batch>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.lock().contains_key(&id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<RequestId, Batch>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl QueueStorage for MemoryStorage {
    async fn persist(&self, id: RequestId, batch: &Batch) -> Result<(), StorageError> {
        self.lock().insert(id, batch.clone());
        Ok(())
    }

    async fn release(&self, id: RequestId) -> Result<(), StorageError> {
        self.lock().remove(&id);
        Ok(())
    }

    async fn recover(&self) -> Result<Vec<(RequestId, Batch)>, StorageError> {
        Ok(self.lock().iter().map(|(id, batch)| (*id, batch.clone())).collect())
    }
}

#[cfg(feature = "file-storage")]
pub use file::FileStorage;

#[cfg(feature = "file-storage")]
mod file {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine;
    use std::path::{Path, PathBuf};
    use tracing::warn;

    const EXTENSION: &str = "json";

    #[derive(serde::Serialize, serde::Deserialize)]
    struct StoredRequest {
        id: u64,
        items: usize,
        payload: String,
    }

    /// One JSON file per request under a directory, named by zero-padded id so a directory
    /// listing sorts in admission order. Writes go to a temp file and are renamed into place.
    #[derive(Debug, Clone)]
    pub struct FileStorage {
        dir: PathBuf,
    }

    impl FileStorage {
        /// Open (creating if needed) a storage directory.
        pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
            let dir = dir.as_ref().to_path_buf();
            tokio::fs::create_dir_all(&dir).await?;
            Ok(Self { dir })
        }

        pub fn dir(&self) -> &Path {
            &self.dir
        }

        fn path_for(&self, id: RequestId) -> PathBuf {
            self.dir.join(format!("{:020}.{EXTENSION}", id.0))
        }
    }

    #[async_trait]
    impl QueueStorage for FileStorage {
        async fn persist(&self, id: RequestId, batch: &Batch) -> Result<(), StorageError> {
            let record = StoredRequest {
                id: id.0,
                items: batch.items(),
                payload: BASE64_STANDARD.encode(batch.payload()),
            };
            let body = serde_json::to_vec(&record)
                .map_err(|e| StorageError::Corrupt { id: id.to_string(), reason: e.to_string() })?;

            let path = self.path_for(id);
            let tmp = path.with_extension("tmp");
            tokio::fs::write(&tmp, body).await?;
            tokio::fs::rename(&tmp, &path).await?;
            Ok(())
        }

        async fn release(&self, id: RequestId) -> Result<(), StorageError> {
            match tokio::fs::remove_file(self.path_for(id)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        }

        async fn recover(&self) -> Result<Vec<(RequestId, Batch)>, StorageError> {
            let mut recovered = Vec::new();
            let mut entries = tokio::fs::read_dir(&self.dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                    continue;
                }
                let body = tokio::fs::read(&path).await?;
                match decode(&body) {
                    Ok(pair) => recovered.push(pair),
                    Err(reason) => {
                        warn!(path = %path.display(), %reason, "skipping unreadable persisted request");
                    }
                }
            }
            recovered.sort_by_key(|(id, _)| *id);
            Ok(recovered)
        }
    }

    fn decode(body: &[u8]) -> Result<(RequestId, Batch), String> {
        let record: StoredRequest = serde_json::from_slice(body).map_err(|e| e.to_string())?;
        let payload = BASE64_STANDARD.decode(record.payload.as_bytes()).map_err(|e| e.to_string())?;
        Ok((RequestId(record.id), Batch::new(payload, record.items)))
    }

}
