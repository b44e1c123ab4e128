use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Worker boundary
// ---------------------------------------------------------------------------

/// A chunk handed to a background worker for encryption.
///
/// `data` is moved into the worker; the sender keeps no copy. `key` is the
/// content-encryption key in its transport encoding (standard base64).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkJob {
    pub job_id: u64,
    pub chunk_index: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub key: String,
}

/// Worker reply for a [`ChunkJob`], correlated by `job_id`.
///
/// On failure `error` is set and `ciphertext`, `nonce` and `hash` are
/// empty. Always check `error` first: an empty ciphertext alone says
/// nothing about success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResult {
    pub job_id: u64,
    pub chunk_index: u32,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    /// Hex SHA-256 over `ciphertext`.
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChunkResult {
    /// Builds the failure shape for `job_id`.
    pub fn failed(job_id: u64, chunk_index: u32, error: impl Into<String>) -> Self {
        Self {
            job_id,
            chunk_index,
            ciphertext: Vec::new(),
            nonce: Vec::new(),
            hash: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

// ---------------------------------------------------------------------------
// Upload receipts
// ---------------------------------------------------------------------------

/// Record of one encrypted chunk accepted by the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    pub index: u32,
    pub offset: u64,
    pub plaintext_len: u64,
    pub ciphertext_len: u64,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    pub hash: String,
}

/// Metadata produced by a completed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub task_id: String,
    pub file_name: String,
    pub destination: String,
    pub total_bytes: u64,
    pub chunk_size: u64,
    /// Ordered by `index`.
    pub chunks: Vec<ChunkReceipt>,
}

/// Standard base64 for byte fields in JSON.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
