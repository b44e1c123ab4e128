//! Reference transfer: chunk, encrypt on the worker pool, ship through
//! the request queue.
//!
//! Per attempt:
//! 1. Before each chunk, stop on cancel or pause.
//! 2. Wait for an in-flight slot, read the next plaintext chunk.
//! 3. Encrypt it on a worker; the worker reply is matched by job id.
//! 4. Send the ciphertext to the sink at low priority.
//! 5. Collect receipts by chunk index and write the manifest.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinSet;
use tracing::{debug, warn};
use vaultline_crypto::ChunkProcessor;
use vaultline_protocol::{ChunkJob, ChunkReceipt, Priority, UploadReceipt};
use vaultline_scheduler::{RequestQueue, Semaphore, WorkerPool};
use vaultline_transfer::{ChunkReader, DEFAULT_CHUNK_SIZE, EncryptedChunk};
use zeroize::Zeroizing;

use crate::error::UploadError;
use crate::sink::ChunkSink;
use crate::transfer::Transfer;
use crate::types::{TransferOutcome, TransferRequest};

/// Default number of chunks one file keeps in flight.
pub const DEFAULT_MAX_CHUNKS_IN_FLIGHT: usize = 4;

/// Encrypts files chunk by chunk and hands the ciphertext to a
/// [`ChunkSink`].
#[derive(Clone)]
pub struct EncryptedTransfer {
    pool: Arc<WorkerPool<ChunkProcessor>>,
    requests: RequestQueue,
    sink: Arc<dyn ChunkSink>,
    chunk_size: usize,
    max_in_flight: usize,
    // Shared by clones so job ids stay unique across files and attempts.
    next_job_id: Arc<AtomicU64>,
}

/// What one chunk task needs; cloned per chunk.
#[derive(Clone)]
struct ChunkContext {
    pool: Arc<WorkerPool<ChunkProcessor>>,
    requests: RequestQueue,
    sink: Arc<dyn ChunkSink>,
    destination: Arc<str>,
    task_id: Arc<str>,
}

impl EncryptedTransfer {
    pub fn new(
        pool: Arc<WorkerPool<ChunkProcessor>>,
        requests: RequestQueue,
        sink: Arc<dyn ChunkSink>,
    ) -> Self {
        Self {
            pool,
            requests,
            sink,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_in_flight: DEFAULT_MAX_CHUNKS_IN_FLIGHT,
            next_job_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Plaintext chunk size; 0 selects the default.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        self
    }

    pub fn with_max_chunks_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    async fn run(&self, request: TransferRequest) -> TransferOutcome {
        let TransferRequest {
            task_id,
            file,
            destination,
            key,
            progress,
            cancel,
            pause,
        } = request;

        let opened = tokio::task::spawn_blocking({
            let path = file.path.clone();
            let chunk_size = self.chunk_size;
            move || ChunkReader::new(&path, chunk_size)
        })
        .await;
        let mut reader = match opened {
            Ok(Ok(reader)) => reader,
            Ok(Err(e)) => return TransferOutcome::Failed(format!("cannot read {}: {e}", file.name)),
            Err(e) => return TransferOutcome::Failed(format!("reader task failed: {e}")),
        };
        let total = reader.file_size();
        let encoded_key = Zeroizing::new(key.encode());
        let ctx = ChunkContext {
            pool: Arc::clone(&self.pool),
            requests: self.requests.clone(),
            sink: Arc::clone(&self.sink),
            destination: Arc::from(destination.as_str()),
            task_id: Arc::from(task_id.as_str()),
        };
        let gate = Arc::new(Semaphore::new(self.max_in_flight));
        let mut done = 0u64;
        let mut receipts = BTreeMap::new();
        // Dropping the set aborts chunk tasks still in flight.
        let mut in_flight: JoinSet<Result<ChunkReceipt, UploadError>> = JoinSet::new();

        debug!(
            upload = %task_id,
            bytes = total,
            chunks = reader.chunk_count(),
            chunk_size = self.chunk_size,
            "transfer starting"
        );

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(reason) = collect(joined, &mut receipts, &mut done, total, &progress) {
                    return TransferOutcome::Failed(reason);
                }
            }
            if cancel.is_cancelled() {
                return TransferOutcome::Cancelled;
            }
            if pause.is_paused() {
                debug!(upload = %task_id, "pause observed, stopping chunk dispatch");
                return TransferOutcome::Paused;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return TransferOutcome::Cancelled,
                Some(joined) = in_flight.join_next() => {
                    if let Err(reason) = collect(joined, &mut receipts, &mut done, total, &progress) {
                        return TransferOutcome::Failed(reason);
                    }
                    continue;
                }
                _ = gate.acquire() => {}
            }

            let read = tokio::task::spawn_blocking(move || {
                let next = reader.next_chunk();
                (reader, next)
            })
            .await;
            let next = match read {
                Ok((returned, next)) => {
                    reader = returned;
                    next
                }
                Err(e) => return TransferOutcome::Failed(format!("reader task failed: {e}")),
            };
            let chunk = match next {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    gate.release();
                    break;
                }
                Err(e) => return TransferOutcome::Failed(e.to_string()),
            };

            let job = ChunkJob {
                job_id: self.next_job_id.fetch_add(1, Ordering::Relaxed),
                chunk_index: chunk.index,
                key: encoded_key.to_string(),
                data: chunk.data,
            };
            let ctx = ctx.clone();
            let gate = Arc::clone(&gate);
            let offset = chunk.offset;
            in_flight.spawn(async move {
                let result = send_chunk(ctx, job, offset).await;
                gate.release();
                result
            });
        }

        while !in_flight.is_empty() {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => return TransferOutcome::Cancelled,
                joined = in_flight.join_next() => joined,
            };
            let Some(joined) = joined else { break };
            if let Err(reason) = collect(joined, &mut receipts, &mut done, total, &progress) {
                return TransferOutcome::Failed(reason);
            }
        }

        let receipt = UploadReceipt {
            task_id: task_id.clone(),
            file_name: file.name.clone(),
            destination: destination.clone(),
            total_bytes: total,
            chunk_size: self.chunk_size as u64,
            chunks: receipts.into_values().collect(),
        };

        let sink = Arc::clone(&self.sink);
        let manifest = receipt.clone();
        let finished = self
            .requests
            .enqueue(Priority::Normal, move || async move {
                sink.finish(&destination, &task_id, &manifest).await
            })
            .await;
        match finished {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return TransferOutcome::Failed(e.to_string()),
            Err(e) => return TransferOutcome::Failed(e.to_string()),
        }

        if cancel.is_cancelled() {
            return TransferOutcome::Cancelled;
        }
        progress(1.0);
        TransferOutcome::Completed(receipt)
    }
}

impl Transfer for EncryptedTransfer {
    fn transfer(
        &self,
        request: TransferRequest,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = TransferOutcome> + Send + '_>> {
        Box::pin(self.run(request))
    }
}

/// Encrypts one chunk and stores the ciphertext.
async fn send_chunk(
    ctx: ChunkContext,
    job: ChunkJob,
    offset: u64,
) -> Result<ChunkReceipt, UploadError> {
    let (job_id, index) = (job.job_id, job.chunk_index);
    let plaintext_len = job.data.len() as u64;

    let result = ctx.pool.execute(job).await?;
    if let Some(reason) = result.error {
        return Err(UploadError::Chunk { index, reason });
    }
    if result.job_id != job_id || result.chunk_index != index {
        return Err(UploadError::Chunk {
            index,
            reason: format!("worker answered job {} for job {job_id}", result.job_id),
        });
    }
    if result.hash.is_empty() {
        return Err(UploadError::Chunk {
            index,
            reason: "worker returned no content hash".into(),
        });
    }

    let chunk = EncryptedChunk {
        index,
        offset,
        plaintext_len,
        ciphertext: result.ciphertext,
        nonce: result.nonce,
        hash: result.hash,
    };
    let ChunkContext {
        requests,
        sink,
        destination,
        task_id,
        ..
    } = ctx;
    requests
        .enqueue(Priority::Low, move || async move {
            sink.put_chunk(&destination, &task_id, chunk).await
        })
        .await?
}

/// Records a finished chunk task and reports progress.
fn collect(
    joined: Result<Result<ChunkReceipt, UploadError>, tokio::task::JoinError>,
    receipts: &mut BTreeMap<u32, ChunkReceipt>,
    done: &mut u64,
    total: u64,
    progress: &crate::types::ProgressFn,
) -> Result<(), String> {
    let receipt = match joined {
        Ok(Ok(receipt)) => receipt,
        Ok(Err(e)) => {
            warn!(error = %e, "chunk failed");
            return Err(e.to_string());
        }
        Err(e) => return Err(format!("chunk task failed: {e}")),
    };
    *done += receipt.plaintext_len;
    receipts.insert(receipt.index, receipt);
    if total > 0 {
        progress(*done as f64 / total as f64);
    }
    Ok(())
}
