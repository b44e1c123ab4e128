/// A plaintext slice of a file, read by [`ChunkReader`](crate::ChunkReader).
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Zero-based position of this chunk within the file.
    pub index: u32,
    /// Byte offset within the file.
    pub offset: u64,
    /// Raw chunk data.
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// An encrypted chunk ready to leave the device.
#[derive(Debug, Clone)]
pub struct EncryptedChunk {
    pub index: u32,
    /// Offset of the plaintext this chunk was produced from.
    pub offset: u64,
    pub plaintext_len: u64,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    /// SHA-256 hex checksum of `ciphertext`.
    pub hash: String,
}
