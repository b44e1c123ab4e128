//! Destinations for encrypted chunks.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tracing::debug;
use vaultline_protocol::{ChunkReceipt, UploadReceipt};
use vaultline_transfer::{ChunkStore, EncryptedChunk, validate_upload_path};

use crate::error::UploadError;

/// Accepts encrypted chunks for a task and records the final manifest.
pub trait ChunkSink: Send + Sync {
    /// Stores one chunk. Chunks of one task may arrive in any order.
    fn put_chunk<'a>(
        &'a self,
        destination: &'a str,
        task_id: &'a str,
        chunk: EncryptedChunk,
    ) -> Pin<Box<dyn Future<Output = Result<ChunkReceipt, UploadError>> + Send + 'a>>;

    /// Records the manifest once every chunk is stored.
    fn finish<'a>(
        &'a self,
        destination: &'a str,
        task_id: &'a str,
        receipt: &'a UploadReceipt,
    ) -> Pin<Box<dyn Future<Output = Result<(), UploadError>> + Send + 'a>>;
}

/// Writes chunks to `<root>/<destination>/<task_id>/<index:08>.chunk`
/// and the manifest next to them.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Chunk store for `destination`, rejecting names that would escape
    /// the root.
    pub fn store(&self, destination: &str) -> Result<ChunkStore, UploadError> {
        let relative = validate_upload_path(destination)?;
        Ok(ChunkStore::new(&self.root.join(relative)))
    }
}

impl ChunkSink for DirectorySink {
    fn put_chunk<'a>(
        &'a self,
        destination: &'a str,
        task_id: &'a str,
        chunk: EncryptedChunk,
    ) -> Pin<Box<dyn Future<Output = Result<ChunkReceipt, UploadError>> + Send + 'a>> {
        Box::pin(async move {
            let store = self.store(destination)?;
            let task_id = task_id.to_string();
            tokio::task::spawn_blocking(move || -> Result<ChunkReceipt, UploadError> {
                let written = store.write_chunk(&task_id, &chunk)?;
                debug!(task = %task_id, index = chunk.index, bytes = written, "chunk stored");
                Ok(ChunkReceipt {
                    index: chunk.index,
                    offset: chunk.offset,
                    plaintext_len: chunk.plaintext_len,
                    ciphertext_len: written,
                    nonce: chunk.nonce,
                    hash: chunk.hash,
                })
            })
            .await
            .map_err(|e| UploadError::Sink(e.to_string()))?
        })
    }

    fn finish<'a>(
        &'a self,
        destination: &'a str,
        task_id: &'a str,
        receipt: &'a UploadReceipt,
    ) -> Pin<Box<dyn Future<Output = Result<(), UploadError>> + Send + 'a>> {
        Box::pin(async move {
            let store = self.store(destination)?;
            let manifest = serde_json::to_vec_pretty(receipt)?;
            let owned_task_id = task_id.to_string();
            tokio::task::spawn_blocking(move || store.write_manifest(&owned_task_id, &manifest))
                .await
                .map_err(|e| UploadError::Sink(e.to_string()))??;
            debug!(task = %task_id, "manifest written");
            Ok::<_, UploadError>(())
        })
    }
}
