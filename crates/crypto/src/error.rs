//! Error types for chunk encryption.

/// Errors produced while encoding keys or sealing/opening chunks.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid key encoding: {0}")]
    InvalidKeyEncoding(#[from] base64::DecodeError),

    #[error("invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    #[error("chunk encryption failed")]
    EncryptFailed,

    /// Authentication failed or the ciphertext is malformed.
    #[error("chunk decryption failed")]
    DecryptFailed,
}
