//! Upload error types.

/// Errors produced while preparing or running an upload.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] vaultline_transfer::TransferError),

    #[error("crypto error: {0}")]
    Crypto(#[from] vaultline_crypto::CryptoError),

    #[error("worker error: {0}")]
    Pool(#[from] vaultline_scheduler::PoolError),

    #[error("request error: {0}")]
    Request(#[from] vaultline_scheduler::RequestQueueError),

    #[error("chunk {index} failed: {reason}")]
    Chunk { index: u32, reason: String },

    #[error("key unavailable: {0}")]
    Key(String),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("not a regular file: {0}")]
    NotAFile(String),
}
