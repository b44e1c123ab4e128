use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::types::{Chunk, EncryptedChunk};
use crate::{DEFAULT_CHUNK_SIZE, TransferError};

/// File name of the manifest written next to a task's chunks.
pub const MANIFEST_FILE: &str = "manifest.json";

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads a file front to back in fixed-size, indexed chunks.
pub struct ChunkReader {
    file: std::fs::File,
    chunk_size: usize,
    offset: u64,
    next_index: u32,
    file_size: u64,
}

impl ChunkReader {
    /// Opens `path` for chunked reading.
    ///
    /// If `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] is used. Files that
    /// would need more than `u32::MAX` chunks are rejected up front.
    pub fn new(path: &Path, chunk_size: usize) -> Result<Self, TransferError> {
        let file = std::fs::File::open(path)?;
        let file_size = file.metadata()?.len();
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        let chunks = file_size.div_ceil(chunk_size as u64);
        if chunks > u64::from(u32::MAX) {
            return Err(TransferError::TooManyChunks(chunks));
        }
        Ok(Self {
            file,
            chunk_size,
            offset: 0,
            next_index: 0,
            file_size,
        })
    }

    /// Reads the next chunk. Returns `None` at EOF.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(None);
        }

        let read_size = std::cmp::min(remaining, self.chunk_size as u64) as usize;
        let mut buf = vec![0u8; read_size];
        let mut filled = 0;
        while filled < read_size {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);

        let chunk = Chunk {
            index: self.next_index,
            offset: self.offset,
            data: buf,
        };
        self.offset += filled as u64;
        self.next_index += 1;
        Ok(Some(chunk))
    }

    /// Current byte offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Bytes remaining to read.
    pub fn remaining(&self) -> u64 {
        self.file_size.saturating_sub(self.offset)
    }

    /// Chunk size in bytes.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks the whole file splits into.
    pub fn chunk_count(&self) -> u64 {
        self.file_size.div_ceil(self.chunk_size as u64)
    }
}

// ---------------------------------------------------------------------------
// ChunkStore
// ---------------------------------------------------------------------------

/// Stores encrypted chunks on disk, one file per chunk index.
///
/// Layout: `<base>/<prefix>/<index:08>.chunk` plus an optional
/// `<base>/<prefix>/manifest.json`.
pub struct ChunkStore {
    base_path: PathBuf,
}

impl ChunkStore {
    /// Creates a store rooted at `base_path`.
    pub fn new(base_path: &Path) -> Self {
        Self {
            base_path: base_path.to_path_buf(),
        }
    }

    /// Writes one encrypted chunk under `prefix`.
    ///
    /// - Rejects prefixes that escape the base directory.
    /// - Verifies the ciphertext checksum if `hash` is non-empty.
    /// - Creates intermediate directories as needed.
    ///
    /// Returns the number of bytes written.
    pub fn write_chunk(&self, prefix: &str, chunk: &EncryptedChunk) -> Result<u64, TransferError> {
        crate::validate_upload_path(prefix)?;

        if !chunk.hash.is_empty() && checksum_bytes(&chunk.ciphertext) != chunk.hash {
            return Err(TransferError::ChecksumMismatch(chunk.index));
        }

        let full_path = self.chunk_path(prefix, chunk.index);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full_path, &chunk.ciphertext)?;
        Ok(chunk.ciphertext.len() as u64)
    }

    /// Reads back the ciphertext of chunk `index` under `prefix`.
    pub fn read_chunk(&self, prefix: &str, index: u32) -> Result<Vec<u8>, TransferError> {
        crate::validate_upload_path(prefix)?;
        Ok(std::fs::read(self.chunk_path(prefix, index))?)
    }

    /// Writes the manifest for `prefix`, replacing any previous one.
    pub fn write_manifest(&self, prefix: &str, contents: &[u8]) -> Result<(), TransferError> {
        crate::validate_upload_path(prefix)?;
        let dir = self.base_path.join(prefix);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(MANIFEST_FILE), contents)?;
        Ok(())
    }

    /// Path of chunk `index` under `prefix`.
    pub fn chunk_path(&self, prefix: &str, index: u32) -> PathBuf {
        self.base_path.join(prefix).join(format!("{index:08}.chunk"))
    }

    /// Returns the base output path.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}
