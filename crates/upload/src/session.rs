//! Application-scoped upload service.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};
use vaultline_crypto::ChunkProcessor;
use vaultline_protocol::TaskSnapshot;
use vaultline_scheduler::{RequestQueue, WorkerPool};
use vaultline_transfer::validate_upload_path;

use crate::config::UploadSettings;
use crate::error::UploadError;
use crate::manager::{Listener, UploadManager};
use crate::pipeline::EncryptedTransfer;
use crate::queue::ParallelUploadQueue;
use crate::sink::ChunkSink;
use crate::transfer::{KeyProvider, RandomKeyProvider, Transfer};
use crate::types::FileRef;

/// Owns one worker pool, one request queue and one upload queue for the
/// lifetime of an application session.
///
/// Construct it once and pass it to whatever needs to upload. Must be
/// created inside a Tokio runtime.
pub struct UploadSession {
    settings: UploadSettings,
    pool: Arc<WorkerPool<ChunkProcessor>>,
    requests: RequestQueue,
    queue: ParallelUploadQueue,
    transfer: Arc<dyn Transfer>,
    keys: Arc<dyn KeyProvider>,
    listener: Option<Listener>,
    uploads: Mutex<Vec<Arc<UploadManager>>>,
}

impl UploadSession {
    /// Builds the session from `settings`, encrypting into `sink`.
    pub fn new(settings: UploadSettings, sink: Arc<dyn ChunkSink>) -> Self {
        let settings = settings.normalized();
        let pool = Arc::new(WorkerPool::new(
            ChunkProcessor::new(),
            Some(settings.max_workers),
        ));
        let requests = RequestQueue::new(
            settings.max_concurrent_requests,
            settings.max_concurrent_low_priority,
        );
        let transfer = EncryptedTransfer::new(Arc::clone(&pool), requests.clone(), sink)
            .with_chunk_size(settings.chunk_size)
            .with_max_chunks_in_flight(settings.max_chunks_in_flight);
        let queue = ParallelUploadQueue::new(settings.concurrency_limit).with_worker_support(true);

        info!(
            concurrency = settings.concurrency_limit,
            workers = settings.max_workers,
            chunk_size = settings.chunk_size,
            "upload session ready"
        );

        Self {
            settings,
            pool,
            requests,
            queue,
            transfer: Arc::new(transfer),
            keys: Arc::new(RandomKeyProvider),
            listener: None,
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn with_key_provider(mut self, keys: Arc<dyn KeyProvider>) -> Self {
        self.keys = keys;
        self
    }

    /// Listener attached to every upload created afterwards.
    pub fn with_listener(mut self, listener: impl Fn(TaskSnapshot) + Send + Sync + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    fn uploads_lock(&self) -> MutexGuard<'_, Vec<Arc<UploadManager>>> {
        self.uploads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `path` for upload into `destination`.
    pub fn upload_file(
        &self,
        path: impl Into<PathBuf>,
        destination: &str,
    ) -> Result<Arc<UploadManager>, UploadError> {
        validate_upload_path(destination)?;
        let file = FileRef::from_path(path)?;
        let id = uuid::Uuid::new_v4().to_string();
        debug!(upload = %id, file = %file.path.display(), destination, "creating upload");

        let mut manager = UploadManager::new(
            id,
            file,
            destination,
            Arc::clone(&self.transfer),
            Arc::clone(&self.keys),
        );
        if let Some(listener) = &self.listener {
            let listener = Arc::clone(listener);
            manager = manager.with_listener(move |snapshot| listener(snapshot));
        }

        let manager = Arc::new(manager);
        self.queue.enqueue(Arc::clone(&manager));
        let mut uploads = self.uploads_lock();
        // Settled uploads are only kept until the next one is created.
        uploads.retain(|m| !m.status().is_terminal());
        uploads.push(Arc::clone(&manager));
        Ok(manager)
    }

    pub fn queue(&self) -> &ParallelUploadQueue {
        &self.queue
    }

    pub fn requests(&self) -> &RequestQueue {
        &self.requests
    }

    pub fn pool(&self) -> &WorkerPool<ChunkProcessor> {
        &self.pool
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    /// Uploads created by this session in creation order. Settled ones
    /// are dropped when the next upload is created.
    pub fn uploads(&self) -> Vec<Arc<UploadManager>> {
        self.uploads_lock().clone()
    }

    /// Cancels everything, waits for active uploads to settle, then stops
    /// the request queue and the worker pool.
    pub async fn shutdown(&self) {
        self.queue.cancel_all();
        self.queue.wait_idle().await;
        self.requests.close();
        self.pool.terminate();
        let uploads = std::mem::take(&mut *self.uploads_lock());
        for manager in &uploads {
            manager.destroy();
        }
        info!(uploads = uploads.len(), "upload session shut down");
    }
}
