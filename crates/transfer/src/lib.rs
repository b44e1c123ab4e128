//! File chunking, checksums and chunk storage for encrypted uploads.
//!
//! Plaintext is read in fixed-size [`Chunk`]s, encrypted elsewhere, and
//! the resulting [`EncryptedChunk`]s are checksummed over their
//! ciphertext before they are stored.

mod chunked;
mod progress;
mod types;
mod validation;

pub use chunked::{ChunkReader, ChunkStore, MANIFEST_FILE, checksum_bytes};
pub use progress::SpeedCalculator;
pub use types::{Chunk, EncryptedChunk};
pub use validation::validate_upload_path;

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch for chunk {0}")]
    ChecksumMismatch(u32),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("file too large: {0} chunks exceed the chunk index range")]
    TooManyChunks(u64),
}
