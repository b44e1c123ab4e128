use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use vaultline_crypto::ContentKey;
use vaultline_protocol::UploadReceipt;

use crate::error::UploadError;

/// A local file to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub path: PathBuf,
    /// Display name (the final path component).
    pub name: String,
    /// Plaintext size in bytes at the time the reference was taken.
    pub size: u64,
}

impl FileRef {
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        let path = path.into();
        let name = display_name(&path);
        Self { path, name, size }
    }

    /// Builds a reference from the file's current metadata.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, UploadError> {
        let path = path.into();
        let meta = std::fs::metadata(&path)?;
        if !meta.is_file() {
            return Err(UploadError::NotAFile(path.display().to_string()));
        }
        Ok(Self::new(path, meta.len()))
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Progress callback; receives the fraction of plaintext bytes done.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Read side of an attempt's pause flag.
///
/// Transfers poll this before dispatching each chunk and stop with
/// [`TransferOutcome::Paused`] once it is raised.
#[derive(Debug, Clone, Default)]
pub struct PauseProbe {
    flag: Arc<AtomicBool>,
}

impl PauseProbe {
    pub(crate) fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    /// A probe that never reports paused.
    pub fn never() -> Self {
        Self::default()
    }

    pub fn is_paused(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Everything one transfer attempt needs.
pub struct TransferRequest {
    pub task_id: String,
    pub file: FileRef,
    pub destination: String,
    pub key: ContentKey,
    pub progress: ProgressFn,
    /// Fires when the attempt is cancelled or superseded.
    pub cancel: CancellationToken,
    pub pause: PauseProbe,
}

impl std::fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRequest")
            .field("task_id", &self.task_id)
            .field("file", &self.file)
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}

/// How a transfer attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed(UploadReceipt),
    /// Stopped because the pause probe was raised; resumable.
    Paused,
    /// Stopped because the cancellation token fired.
    Cancelled,
    Failed(String),
}
