//! Chunk encryption for the upload pipeline.
//!
//! Each file has its own [`ContentKey`]. Chunks are sealed with
//! XChaCha20-Poly1305 under a fresh random nonce, and the content hash is
//! SHA-256 over the ciphertext so the destination can verify what it
//! stores without holding the key.

mod cipher;
mod error;
mod key;
mod processor;

pub use cipher::{NONCE_SIZE, TAG_SIZE, open_chunk, seal_chunk};
pub use error::CryptoError;
pub use key::{ContentKey, KEY_SIZE};
pub use processor::ChunkProcessor;
