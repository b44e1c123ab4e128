//! Per-file upload state machine.
//!
//! ```text
//! pending --start--> uploading --ok--> completed
//!                    uploading --err-> failed --start--> uploading
//!                    uploading <-pause/resume-> paused
//! pending | uploading | paused --cancel--> cancelled
//! ```
//!
//! Every `start()`/`resume()` is one attempt with its own cancellation
//! token and pause flag. Resuming restarts the transfer from the first
//! byte; progress of the paused attempt is not reused.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vaultline_crypto::ContentKey;
use vaultline_protocol::{TaskSnapshot, UploadReceipt, UploadStatus};

use crate::error::UploadError;
use crate::transfer::{KeyProvider, Transfer};
use crate::types::{FileRef, PauseProbe, ProgressFn, TransferOutcome, TransferRequest};

/// Receives a snapshot on every status or progress change.
pub type Listener = Arc<dyn Fn(TaskSnapshot) + Send + Sync>;

#[derive(Clone)]
struct Attempt {
    number: u32,
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
}

struct TaskState {
    status: UploadStatus,
    progress: f64,
    error: Option<String>,
    receipt: Option<UploadReceipt>,
    current: Option<Attempt>,
    attempts: u32,
    destroyed: bool,
}

struct Shared {
    id: String,
    file_name: String,
    total_bytes: u64,
    status_tx: watch::Sender<UploadStatus>,
    state: Mutex<TaskState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot_of(&self, st: &TaskState) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id.clone(),
            file_name: self.file_name.clone(),
            status: st.status,
            progress: st.progress,
            total_bytes: self.total_bytes,
            error: st.error.clone(),
            attempt: st.attempts,
        }
    }

    /// Pushes the current status to watchers and returns the snapshot to
    /// hand to the listener once the lock is released.
    fn publish(&self, st: &TaskState) -> TaskSnapshot {
        self.status_tx.send_replace(st.status);
        self.snapshot_of(st)
    }

    fn record_progress(&self, attempt: u32, fraction: f64) -> Option<TaskSnapshot> {
        let mut st = self.lock();
        let is_current = st.current.as_ref().is_some_and(|a| a.number == attempt);
        if !is_current || !matches!(st.status, UploadStatus::Uploading | UploadStatus::Paused) {
            return None;
        }
        st.progress = fraction.clamp(0.0, 1.0);
        Some(self.snapshot_of(&st))
    }
}

/// Drives one file through its upload lifecycle.
///
/// The manager owns its task state exclusively. Collaborators only see
/// what the current attempt hands them through [`TransferRequest`].
pub struct UploadManager {
    shared: Arc<Shared>,
    file: FileRef,
    destination: String,
    transfer: Arc<dyn Transfer>,
    keys: Arc<dyn KeyProvider>,
    key: Mutex<Option<ContentKey>>,
    listener: Option<Listener>,
}

impl UploadManager {
    /// Creates a manager in `pending` state.
    pub fn new(
        id: impl Into<String>,
        file: FileRef,
        destination: impl Into<String>,
        transfer: Arc<dyn Transfer>,
        keys: Arc<dyn KeyProvider>,
    ) -> Self {
        let (status_tx, _) = watch::channel(UploadStatus::Pending);
        Self {
            shared: Arc::new(Shared {
                id: id.into(),
                file_name: file.name.clone(),
                total_bytes: file.size,
                status_tx,
                state: Mutex::new(TaskState {
                    status: UploadStatus::Pending,
                    progress: 0.0,
                    error: None,
                    receipt: None,
                    current: None,
                    attempts: 0,
                    destroyed: false,
                }),
            }),
            file,
            destination: destination.into(),
            transfer,
            keys,
            key: Mutex::new(None),
            listener: None,
        }
    }

    /// Uses `key` instead of asking the key provider.
    pub fn with_keys(mut self, key: ContentKey) -> Self {
        self.key = Mutex::new(Some(key));
        self
    }

    pub fn with_listener(mut self, listener: impl Fn(TaskSnapshot) + Send + Sync + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn file(&self) -> &FileRef {
        &self.file
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Runs a transfer attempt and returns the status it settled in.
    ///
    /// Only starts from `pending` or `failed`. In any other state, or
    /// after [`destroy`](Self::destroy), returns the current status
    /// without doing anything.
    pub async fn start(&self) -> UploadStatus {
        let (attempt, snapshot) = {
            let mut st = self.shared.lock();
            if st.destroyed {
                debug!(upload = %self.shared.id, "start ignored, manager destroyed");
                return st.status;
            }
            match st.status {
                UploadStatus::Pending | UploadStatus::Failed => {}
                status => {
                    debug!(upload = %self.shared.id, %status, "start ignored");
                    return status;
                }
            }
            let attempt = Self::begin_attempt(&mut st);
            (attempt, self.shared.publish(&st))
        };
        self.emit(snapshot);
        info!(upload = %self.shared.id, attempt = attempt.number, file = %self.file.name, "upload started");
        self.run(attempt).await
    }

    /// Marks an uploading task paused.
    ///
    /// The running attempt keeps its cancellation token; it is expected to
    /// notice the raised pause flag before its next chunk and stop.
    pub fn pause(&self) -> bool {
        let snapshot = {
            let mut st = self.shared.lock();
            if st.destroyed || st.status != UploadStatus::Uploading {
                return false;
            }
            if let Some(attempt) = &st.current {
                attempt.paused.store(true, Ordering::Release);
            }
            st.status = UploadStatus::Paused;
            self.shared.publish(&st)
        };
        self.emit(snapshot);
        info!(upload = %self.shared.id, "upload paused");
        true
    }

    /// Restarts a paused task from the beginning under a new attempt.
    ///
    /// The paused attempt's token is cancelled, so a lagging transfer
    /// from it stops and its outcome is discarded. Returns the status the
    /// new attempt settled in, or the current status if the task was not
    /// paused.
    pub async fn resume(&self) -> UploadStatus {
        let (attempt, snapshot) = {
            let mut st = self.shared.lock();
            if st.destroyed || st.status != UploadStatus::Paused {
                return st.status;
            }
            if let Some(old) = st.current.take() {
                old.cancel.cancel();
            }
            let attempt = Self::begin_attempt(&mut st);
            (attempt, self.shared.publish(&st))
        };
        self.emit(snapshot);
        info!(upload = %self.shared.id, attempt = attempt.number, "upload resumed, restarting transfer");
        self.run(attempt).await
    }

    /// Cancels a pending, uploading or paused task.
    pub fn cancel(&self) -> bool {
        let snapshot = {
            let mut st = self.shared.lock();
            if st.destroyed || !st.status.is_active() {
                return false;
            }
            st.status = UploadStatus::Cancelled;
            if let Some(attempt) = &st.current {
                attempt.cancel.cancel();
            }
            self.shared.publish(&st)
        };
        self.emit(snapshot);
        info!(upload = %self.shared.id, "upload cancelled");
        true
    }

    /// Tears the manager down. Any outstanding attempt is cancelled and
    /// every later call becomes a no-op.
    pub fn destroy(&self) {
        let snapshot = {
            let mut st = self.shared.lock();
            if st.destroyed {
                return;
            }
            st.destroyed = true;
            if let Some(attempt) = &st.current {
                attempt.cancel.cancel();
            }
            if st.status.is_active() {
                st.status = UploadStatus::Cancelled;
                Some(self.shared.publish(&st))
            } else {
                None
            }
        };
        if let Some(snapshot) = snapshot {
            self.emit(snapshot);
        }
        debug!(upload = %self.shared.id, "upload manager destroyed");
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let st = self.shared.lock();
        self.shared.snapshot_of(&st)
    }

    pub fn status(&self) -> UploadStatus {
        self.shared.lock().status
    }

    /// Number of attempts started so far.
    pub fn attempt(&self) -> u32 {
        self.shared.lock().attempts
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.lock().destroyed
    }

    /// Metadata of the completed upload, if any.
    pub fn receipt(&self) -> Option<UploadReceipt> {
        self.shared.lock().receipt.clone()
    }

    /// Cancellation token of the current attempt.
    pub fn cancel_token(&self) -> Option<CancellationToken> {
        self.shared.lock().current.as_ref().map(|a| a.cancel.clone())
    }

    /// Watches status changes.
    pub fn subscribe(&self) -> watch::Receiver<UploadStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Waits until the task reaches `completed`, `failed` or `cancelled`.
    pub async fn settled(&self) -> UploadStatus {
        let mut rx = self.subscribe();
        match rx.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        }
    }

    fn begin_attempt(st: &mut TaskState) -> Attempt {
        st.attempts += 1;
        let attempt = Attempt {
            number: st.attempts,
            cancel: CancellationToken::new(),
            paused: Arc::new(AtomicBool::new(false)),
        };
        st.current = Some(attempt.clone());
        st.status = UploadStatus::Uploading;
        st.progress = 0.0;
        st.error = None;
        st.receipt = None;
        attempt
    }

    fn emit(&self, snapshot: TaskSnapshot) {
        if let Some(listener) = &self.listener {
            listener(snapshot);
        }
    }

    async fn content_key(&self) -> Result<ContentKey, UploadError> {
        let cached = self
            .key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(key) = cached {
            return Ok(key);
        }
        let key = self.keys.content_key(&self.file).await?;
        *self.key.lock().unwrap_or_else(PoisonError::into_inner) = Some(key.clone());
        Ok(key)
    }

    fn progress_fn(&self, attempt: u32) -> ProgressFn {
        let shared = Arc::clone(&self.shared);
        let listener = self.listener.clone();
        Arc::new(move |fraction| {
            let Some(snapshot) = shared.record_progress(attempt, fraction) else {
                return;
            };
            if let Some(listener) = &listener {
                listener(snapshot);
            }
        })
    }

    async fn run(&self, attempt: Attempt) -> UploadStatus {
        let key = match self.content_key().await {
            Ok(key) => key,
            Err(e) => return self.settle(&attempt, TransferOutcome::Failed(e.to_string())),
        };
        if attempt.cancel.is_cancelled() {
            return self.settle(&attempt, TransferOutcome::Cancelled);
        }

        let request = TransferRequest {
            task_id: self.shared.id.clone(),
            file: self.file.clone(),
            destination: self.destination.clone(),
            key,
            progress: self.progress_fn(attempt.number),
            cancel: attempt.cancel.clone(),
            pause: PauseProbe::new(Arc::clone(&attempt.paused)),
        };
        let outcome = self.transfer.transfer(request).await;
        self.settle(&attempt, outcome)
    }

    /// Applies an attempt's outcome. Outcomes of superseded attempts are
    /// dropped; a fired token always wins over the reported variant.
    fn settle(&self, attempt: &Attempt, outcome: TransferOutcome) -> UploadStatus {
        let id = &self.shared.id;
        let snapshot = {
            let mut st = self.shared.lock();
            let is_current = st.current.as_ref().is_some_and(|a| a.number == attempt.number);
            if !is_current || st.destroyed {
                debug!(upload = %id, attempt = attempt.number, "discarding outcome of superseded attempt");
                return st.status;
            }

            let outcome = if attempt.cancel.is_cancelled() {
                TransferOutcome::Cancelled
            } else {
                outcome
            };
            match outcome {
                TransferOutcome::Completed(receipt) => {
                    info!(upload = %id, chunks = receipt.chunks.len(), bytes = receipt.total_bytes, "upload completed");
                    st.status = UploadStatus::Completed;
                    st.progress = 1.0;
                    st.receipt = Some(receipt);
                }
                TransferOutcome::Paused => {
                    debug!(upload = %id, attempt = attempt.number, "transfer stopped for pause");
                    st.status = UploadStatus::Paused;
                }
                TransferOutcome::Cancelled => {
                    debug!(upload = %id, attempt = attempt.number, "transfer stopped for cancel");
                    st.status = UploadStatus::Cancelled;
                }
                TransferOutcome::Failed(reason) => {
                    warn!(upload = %id, error = %reason, "upload failed");
                    st.status = UploadStatus::Failed;
                    st.error = Some(reason);
                }
            }
            self.shared.publish(&st)
        };
        let status = snapshot.status;
        self.emit(snapshot);
        status
    }
}

impl Drop for UploadManager {
    fn drop(&mut self) {
        if let Some(attempt) = &self.shared.lock().current {
            attempt.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for UploadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadManager")
            .field("id", &self.shared.id)
            .field("file", &self.file)
            .field("destination", &self.destination)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
