//! Fan-out scheduler for whole-file uploads.
//!
//! At most `concurrency_limit` managers hold an admission slot at once.
//! The rest wait in a FIFO backlog and are promoted one per settlement.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, info, warn};
use vaultline_protocol::{QueueEntryStatus, QueueStatus, UploadStatus};

use crate::manager::UploadManager;

/// Upper bound on concurrently uploading files.
pub const MAX_CONCURRENCY: usize = 6;

/// Default number of concurrently uploading files.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Settled entries kept for [`ParallelUploadQueue::entries`]; older ones
/// are forgotten first.
pub const FINISHED_HISTORY: usize = 64;

struct QueueState {
    backlog: VecDeque<Arc<UploadManager>>,
    active: Vec<Arc<UploadManager>>,
    finished: VecDeque<(String, QueueEntryStatus)>,
}

impl QueueState {
    fn contains(&self, id: &str) -> bool {
        self.backlog.iter().chain(self.active.iter()).any(|m| m.id() == id)
    }

    fn find_active(&self, id: &str) -> Option<Arc<UploadManager>> {
        self.active.iter().find(|m| m.id() == id).cloned()
    }

    fn is_idle(&self) -> bool {
        self.backlog.is_empty() && self.active.is_empty()
    }
}

struct Inner {
    limit: usize,
    has_worker_support: AtomicBool,
    state: Mutex<QueueState>,
    idle: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Promotes backlog heads while slots are free. The caller spawns
    /// the returned managers once the lock is released.
    fn admit(&self, st: &mut QueueState) -> Vec<Arc<UploadManager>> {
        let mut promoted = Vec::new();
        while st.active.len() < self.limit {
            let Some(manager) = st.backlog.pop_front() else {
                break;
            };
            debug!(
                upload = %manager.id(),
                active = st.active.len() + 1,
                queued = st.backlog.len(),
                "admitting upload"
            );
            st.active.push(Arc::clone(&manager));
            promoted.push(manager);
        }
        if st.is_idle() {
            self.idle.notify_waiters();
        }
        promoted
    }

    fn spawn_drivers(self: &Arc<Self>, managers: Vec<Arc<UploadManager>>) {
        for manager in managers {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                let mut status = manager.start().await;
                // Paused tasks keep their slot until they finish or are cancelled.
                if !status.is_terminal() {
                    status = manager.settled().await;
                }
                inner.settle(manager.id(), status);
            });
        }
    }

    fn settle(self: &Arc<Self>, id: &str, status: UploadStatus) {
        let promoted = {
            let mut st = self.lock();
            let Some(pos) = st.active.iter().position(|m| m.id() == id) else {
                return;
            };
            st.active.remove(pos);
            let entry = match status {
                UploadStatus::Completed => QueueEntryStatus::Completed,
                _ => QueueEntryStatus::Failed,
            };
            st.finished.push_back((id.to_string(), entry));
            while st.finished.len() > FINISHED_HISTORY {
                st.finished.pop_front();
            }
            debug!(upload = %id, %status, "upload settled, slot freed");
            self.admit(&mut st)
        };
        self.spawn_drivers(promoted);
    }
}

/// Runs up to `concurrency_limit` uploads at once.
///
/// Requires a Tokio runtime: every admitted manager is driven on its own
/// task. Cheap to clone; clones share the same backlog.
#[derive(Clone)]
pub struct ParallelUploadQueue {
    inner: Arc<Inner>,
}

impl Default for ParallelUploadQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl ParallelUploadQueue {
    /// Creates a queue; `concurrency_limit` is clamped to
    /// `1..=MAX_CONCURRENCY`.
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                limit: concurrency_limit.clamp(1, MAX_CONCURRENCY),
                has_worker_support: AtomicBool::new(true),
                state: Mutex::new(QueueState {
                    backlog: VecDeque::new(),
                    active: Vec::new(),
                    finished: VecDeque::new(),
                }),
                idle: Notify::new(),
            }),
        }
    }

    /// Records whether chunk work runs on background workers. Reported
    /// through [`status`](Self::status) only.
    pub fn with_worker_support(self, has_worker_support: bool) -> Self {
        self.inner
            .has_worker_support
            .store(has_worker_support, Ordering::Relaxed);
        self
    }

    /// Appends `manager` to the backlog and admits as many tasks as the
    /// limit allows. Returns `false` if a task with the same id is
    /// already queued or running.
    pub fn enqueue(&self, manager: Arc<UploadManager>) -> bool {
        let promoted = {
            let mut st = self.inner.lock();
            if st.contains(manager.id()) {
                warn!(upload = %manager.id(), "upload already queued, ignoring");
                return false;
            }
            st.finished.retain(|(id, _)| id != manager.id());
            debug!(upload = %manager.id(), queued = st.backlog.len() + 1, "upload queued");
            st.backlog.push_back(manager);
            self.inner.admit(&mut st)
        };
        self.inner.spawn_drivers(promoted);
        true
    }

    /// Pauses an active upload. Backlog entries are not affected.
    pub fn pause_upload(&self, id: &str) -> bool {
        let manager = self.inner.lock().find_active(id);
        manager.is_some_and(|m| m.pause())
    }

    /// Restarts a paused active upload from the beginning.
    pub fn resume_upload(&self, id: &str) -> bool {
        let Some(manager) = self.inner.lock().find_active(id) else {
            return false;
        };
        if manager.status() != UploadStatus::Paused {
            return false;
        }
        tokio::spawn(async move {
            manager.resume().await;
        });
        true
    }

    /// Cancels an upload. A backlog entry is dropped without ever being
    /// started; an active one is signalled and frees its slot once it
    /// settles.
    pub fn cancel_upload(&self, id: &str) -> bool {
        let (queued, active) = {
            let mut st = self.inner.lock();
            let pos = st.backlog.iter().position(|m| m.id() == id);
            let queued = pos.and_then(|pos| st.backlog.remove(pos));
            if queued.is_some() && st.is_idle() {
                self.inner.idle.notify_waiters();
            }
            let active = st.find_active(id);
            (queued, active)
        };

        if let Some(manager) = queued {
            info!(upload = %id, "queued upload cancelled before start");
            manager.cancel();
            return true;
        }
        active.is_some_and(|m| m.cancel())
    }

    /// Cancels every queued and active upload.
    pub fn cancel_all(&self) {
        let (queued, active) = {
            let mut st = self.inner.lock();
            let queued: Vec<_> = st.backlog.drain(..).collect();
            if st.is_idle() {
                self.inner.idle.notify_waiters();
            }
            (queued, st.active.clone())
        };
        info!(queued = queued.len(), active = active.len(), "cancelling all uploads");
        for manager in queued.iter().chain(active.iter()) {
            manager.cancel();
        }
    }

    pub fn status(&self) -> QueueStatus {
        let st = self.inner.lock();
        QueueStatus {
            queued: st.backlog.len(),
            active: st.active.len(),
            max_concurrency: self.inner.limit,
            has_worker_support: self.inner.has_worker_support.load(Ordering::Relaxed),
        }
    }

    /// Queue-level view of known tasks: the most recent
    /// [`FINISHED_HISTORY`] settled ones first, then active, then the
    /// backlog in admission order.
    pub fn entries(&self) -> Vec<(String, QueueEntryStatus)> {
        let st = self.inner.lock();
        st.finished
            .iter()
            .cloned()
            .chain(
                st.active
                    .iter()
                    .map(|m| (m.id().to_string(), QueueEntryStatus::Uploading)),
            )
            .chain(
                st.backlog
                    .iter()
                    .map(|m| (m.id().to_string(), QueueEntryStatus::Pending)),
            )
            .collect()
    }

    pub fn concurrency_limit(&self) -> usize {
        self.inner.limit
    }

    /// Waits until nothing is queued or active.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::manager::tests::{receipt_for, wait_until};
    use crate::transfer::{RandomKeyProvider, Transfer};
    use crate::types::{FileRef, TransferOutcome, TransferRequest};

    /// Each call completes once it takes a permit from `gate`.
    struct GateTransfer {
        gate: tokio::sync::Semaphore,
        calls: AtomicUsize,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl GateTransfer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: tokio::sync::Semaphore::new(0),
                calls: AtomicUsize::new(0),
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        fn release(&self, n: usize) {
            self.gate.add_permits(n);
        }
    }

    impl Transfer for GateTransfer {
        fn transfer(
            &self,
            req: TransferRequest,
        ) -> Pin<Box<dyn Future<Output = TransferOutcome> + Send + '_>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);

                let outcome = loop {
                    if req.cancel.is_cancelled() {
                        break TransferOutcome::Cancelled;
                    }
                    if req.pause.is_paused() {
                        break TransferOutcome::Paused;
                    }
                    if let Ok(permit) = self.gate.try_acquire() {
                        permit.forget();
                        break TransferOutcome::Completed(receipt_for(&req));
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                };
                self.current.fetch_sub(1, Ordering::SeqCst);
                outcome
            })
        }
    }

    fn managers(transfer: &Arc<GateTransfer>, n: usize) -> Vec<Arc<UploadManager>> {
        (0..n)
            .map(|i| {
                Arc::new(UploadManager::new(
                    format!("file-{i}"),
                    FileRef::new(format!("/data/file-{i}.bin"), 100),
                    "dest",
                    Arc::clone(transfer) as Arc<dyn Transfer>,
                    Arc::new(RandomKeyProvider),
                ))
            })
            .collect()
    }

    fn count(managers: &[Arc<UploadManager>], status: UploadStatus) -> usize {
        managers.iter().filter(|m| m.status() == status).count()
    }

    #[tokio::test]
    async fn ten_files_limit_three_admit_one_per_settle() {
        let transfer = GateTransfer::new();
        let queue = ParallelUploadQueue::new(3);
        let tasks = managers(&transfer, 10);
        for m in &tasks {
            assert!(queue.enqueue(Arc::clone(m)));
        }

        let status = queue.status();
        assert_eq!((status.active, status.queued), (3, 7));
        wait_until(|| count(&tasks, UploadStatus::Uploading) == 3).await;
        assert_eq!(count(&tasks, UploadStatus::Pending), 7);

        for done in 1..=10 {
            transfer.release(1);
            let running = 3.min(10 - done);
            wait_until(|| {
                count(&tasks, UploadStatus::Completed) == done
                    && count(&tasks, UploadStatus::Uploading) == running
            })
            .await;
            assert_eq!(count(&tasks, UploadStatus::Pending), 10 - done - running);
        }

        queue.wait_idle().await;
        assert_eq!(transfer.calls.load(Ordering::SeqCst), 10);
        assert!(transfer.peak.load(Ordering::SeqCst) <= 3);
        assert!(
            queue
                .entries()
                .iter()
                .all(|(_, s)| *s == QueueEntryStatus::Completed)
        );
    }

    #[tokio::test]
    async fn never_more_than_limit_uploading() {
        let transfer = GateTransfer::new();
        let queue = ParallelUploadQueue::new(2);
        let tasks = managers(&transfer, 8);
        for m in &tasks {
            queue.enqueue(Arc::clone(m));
        }

        transfer.release(8);
        queue.wait_idle().await;
        assert_eq!(count(&tasks, UploadStatus::Completed), 8);
        assert!(transfer.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancelling_backlog_task_never_transfers() {
        let transfer = GateTransfer::new();
        let queue = ParallelUploadQueue::new(1);
        let tasks = managers(&transfer, 3);
        for m in &tasks {
            queue.enqueue(Arc::clone(m));
        }
        wait_until(|| tasks[0].status() == UploadStatus::Uploading).await;

        assert!(queue.cancel_upload("file-1"));
        assert_eq!(tasks[1].status(), UploadStatus::Cancelled);
        assert_eq!(queue.status().queued, 1);

        transfer.release(3);
        queue.wait_idle().await;
        assert_eq!(transfer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(tasks[1].attempt(), 0);
        assert_eq!(tasks[2].status(), UploadStatus::Completed);
    }

    #[tokio::test]
    async fn paused_task_keeps_its_slot() {
        let transfer = GateTransfer::new();
        let queue = ParallelUploadQueue::new(1);
        let tasks = managers(&transfer, 2);
        for m in &tasks {
            queue.enqueue(Arc::clone(m));
        }
        wait_until(|| tasks[0].status() == UploadStatus::Uploading).await;

        assert!(queue.pause_upload("file-0"));
        wait_until(|| transfer.current.load(Ordering::SeqCst) == 0).await;
        assert_eq!(tasks[0].status(), UploadStatus::Paused);
        assert_eq!(tasks[1].status(), UploadStatus::Pending);
        assert_eq!(queue.status().active, 1);

        assert!(queue.resume_upload("file-0"));
        wait_until(|| tasks[0].attempt() == 2 && tasks[0].status() == UploadStatus::Uploading)
            .await;

        transfer.release(2);
        queue.wait_idle().await;
        assert_eq!(count(&tasks, UploadStatus::Completed), 2);
    }

    #[tokio::test]
    async fn cancelling_paused_task_frees_its_slot() {
        let transfer = GateTransfer::new();
        let queue = ParallelUploadQueue::new(1);
        let tasks = managers(&transfer, 2);
        for m in &tasks {
            queue.enqueue(Arc::clone(m));
        }
        wait_until(|| tasks[0].status() == UploadStatus::Uploading).await;
        queue.pause_upload("file-0");

        assert!(queue.cancel_upload("file-0"));
        wait_until(|| tasks[1].status() == UploadStatus::Uploading).await;
        assert_eq!(tasks[0].status(), UploadStatus::Cancelled);

        transfer.release(1);
        queue.wait_idle().await;
        assert_eq!(
            queue.entries(),
            vec![
                ("file-0".to_string(), QueueEntryStatus::Failed),
                ("file-1".to_string(), QueueEntryStatus::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn cancel_all_stops_everything() {
        let transfer = GateTransfer::new();
        let queue = ParallelUploadQueue::new(2);
        let tasks = managers(&transfer, 5);
        for m in &tasks {
            queue.enqueue(Arc::clone(m));
        }
        wait_until(|| count(&tasks, UploadStatus::Uploading) == 2).await;

        queue.cancel_all();
        queue.wait_idle().await;
        assert_eq!(count(&tasks, UploadStatus::Cancelled), 5);
        assert_eq!(transfer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn settled_history_is_bounded() {
        let transfer = GateTransfer::new();
        let queue = ParallelUploadQueue::new(MAX_CONCURRENCY);
        let total = FINISHED_HISTORY + 10;
        let tasks = managers(&transfer, total);
        for m in &tasks {
            queue.enqueue(Arc::clone(m));
        }

        transfer.release(total);
        queue.wait_idle().await;
        assert_eq!(count(&tasks, UploadStatus::Completed), total);

        let entries = queue.entries();
        assert_eq!(entries.len(), FINISHED_HISTORY);
        assert!(entries.iter().all(|(_, s)| *s == QueueEntryStatus::Completed));
    }

    #[tokio::test]
    async fn operations_ignore_unknown_and_backlog_ids() {
        let transfer = GateTransfer::new();
        let queue = ParallelUploadQueue::new(1);
        let tasks = managers(&transfer, 2);
        for m in &tasks {
            queue.enqueue(Arc::clone(m));
        }

        assert!(!queue.pause_upload("missing"));
        assert!(!queue.resume_upload("missing"));
        assert!(!queue.cancel_upload("missing"));
        assert!(!queue.pause_upload("file-1"));
        assert!(!queue.enqueue(Arc::clone(&tasks[0])));

        queue.cancel_all();
        queue.wait_idle().await;
    }

    #[tokio::test]
    async fn limit_is_clamped_and_reported() {
        assert_eq!(ParallelUploadQueue::new(0).status().max_concurrency, 1);
        assert_eq!(ParallelUploadQueue::new(99).status().max_concurrency, 6);

        let status = ParallelUploadQueue::new(4)
            .with_worker_support(false)
            .status();
        assert_eq!(
            status,
            QueueStatus {
                queued: 0,
                active: 0,
                max_concurrency: 4,
                has_worker_support: false,
            }
        );
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_empty() {
        let queue = ParallelUploadQueue::default();
        tokio::time::timeout(Duration::from_secs(1), queue.wait_idle())
            .await
            .unwrap();
    }
}
