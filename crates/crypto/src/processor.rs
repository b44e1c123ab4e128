use vaultline_protocol::{ChunkJob, ChunkResult};
use vaultline_scheduler::JobHandler;
use vaultline_transfer::checksum_bytes;

use crate::cipher::seal_chunk;
use crate::key::ContentKey;

/// Worker-side chunk encryption.
///
/// Runs on a [`vaultline_scheduler::WorkerPool`] thread. Errors never
/// escape as panics: every job produces a [`ChunkResult`], with `error`
/// set on failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChunkProcessor;

impl ChunkProcessor {
    pub fn new() -> Self {
        Self
    }

    fn process(job: ChunkJob) -> ChunkResult {
        let key = match ContentKey::decode(&job.key) {
            Ok(key) => key,
            Err(e) => return ChunkResult::failed(job.job_id, job.chunk_index, e.to_string()),
        };

        match seal_chunk(&key, job.chunk_index, &job.data) {
            Ok((ciphertext, nonce)) => {
                let hash = checksum_bytes(&ciphertext);
                ChunkResult {
                    job_id: job.job_id,
                    chunk_index: job.chunk_index,
                    ciphertext,
                    nonce: nonce.to_vec(),
                    hash,
                    error: None,
                }
            }
            Err(e) => ChunkResult::failed(job.job_id, job.chunk_index, e.to_string()),
        }
    }
}

impl JobHandler for ChunkProcessor {
    type Request = ChunkJob;
    type Response = ChunkResult;

    fn handle(&self, job: ChunkJob) -> ChunkResult {
        let (job_id, chunk_index, len) = (job.job_id, job.chunk_index, job.data.len());
        let result = Self::process(job);
        match &result.error {
            None => tracing::trace!(job_id, chunk_index, len, "chunk encrypted"),
            Some(error) => tracing::warn!(job_id, chunk_index, error = %error, "chunk encryption failed"),
        }
        result
    }
}
