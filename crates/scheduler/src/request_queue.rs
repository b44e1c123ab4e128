//! Priority-aware admission control for outbound network calls.
//!
//! Bulk chunk uploads go in as [`Priority::Low`]; interactive calls use
//! `High` or `Normal`. Once `max_concurrent_low_priority` requests are
//! active, only high/normal entries are admitted while any of them wait,
//! so interactive calls always find a slot within the overall
//! `max_concurrent` budget.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, trace};
use vaultline_protocol::{Priority, PriorityCounts, RequestStats};

use crate::error::RequestQueueError;

struct Waiting {
    id: u64,
    priority: Priority,
    go: oneshot::Sender<()>,
}

struct QueueState {
    /// High entries first (in arrival order), then normal/low in arrival order.
    backlog: VecDeque<Waiting>,
    /// Ids admitted and not yet settled.
    admitted: HashSet<u64>,
    next_id: u64,
    closed: bool,
}

struct Inner {
    max_concurrent: usize,
    max_concurrent_low_priority: usize,
    state: Mutex<QueueState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits as many waiting entries as the limits allow.
    fn pump(&self) {
        let mut st = self.lock();
        while st.admitted.len() < self.max_concurrent {
            let active = st.admitted.len();
            let low_capped = active >= self.max_concurrent_low_priority
                && st.backlog.iter().any(|w| w.priority != Priority::Low);

            let pos = if low_capped {
                st.backlog.iter().position(|w| w.priority != Priority::Low)
            } else if st.backlog.is_empty() {
                None
            } else {
                Some(0)
            };
            let Some(entry) = pos.and_then(|p| st.backlog.remove(p)) else {
                break;
            };

            // Caller dropped before admission; skip it.
            if entry.go.send(()).is_err() {
                continue;
            }
            trace!(id = entry.id, priority = ?entry.priority, active = active + 1, "request admitted");
            st.admitted.insert(entry.id);
        }
    }
}

/// Releases the request's slot (or its backlog entry) when dropped.
struct Ticket {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let was_active = {
            let mut st = self.inner.lock();
            if st.admitted.remove(&self.id) {
                true
            } else {
                st.backlog.retain(|w| w.id != self.id);
                false
            }
        };
        if was_active {
            self.inner.pump();
        }
    }
}

/// Priority request queue. Cheap to clone; clones share the same limits.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<Inner>,
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(
            crate::DEFAULT_MAX_CONCURRENT_REQUESTS,
            crate::DEFAULT_MAX_CONCURRENT_LOW_PRIORITY,
        )
    }
}

impl RequestQueue {
    /// Creates a queue. Both limits are raised to at least 1, and the
    /// low-priority cap never exceeds the overall cap.
    pub fn new(max_concurrent: usize, max_concurrent_low_priority: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            inner: Arc::new(Inner {
                max_concurrent,
                max_concurrent_low_priority: max_concurrent_low_priority.clamp(1, max_concurrent),
                state: Mutex::new(QueueState {
                    backlog: VecDeque::new(),
                    admitted: HashSet::new(),
                    next_id: 1,
                    closed: false,
                }),
            }),
        }
    }

    /// Queues `execute` under `priority`.
    ///
    /// The request is registered immediately, in call order. Admission
    /// happens when any registered request is first polled and whenever
    /// one settles. Dropping the returned future withdraws a waiting
    /// request or frees a running one's slot.
    pub fn enqueue<F, Fut, T>(
        &self,
        priority: Priority,
        execute: F,
    ) -> impl Future<Output = Result<T, RequestQueueError>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (go_tx, go_rx) = oneshot::channel();
        let ticket = {
            let mut st = self.inner.lock();
            if st.closed {
                None
            } else {
                let id = st.next_id;
                st.next_id += 1;
                let entry = Waiting {
                    id,
                    priority,
                    go: go_tx,
                };
                match priority {
                    Priority::High => {
                        let pos = st
                            .backlog
                            .iter()
                            .take_while(|w| w.priority == Priority::High)
                            .count();
                        st.backlog.insert(pos, entry);
                    }
                    Priority::Normal | Priority::Low => st.backlog.push_back(entry),
                }
                trace!(id, ?priority, queued = st.backlog.len(), "request queued");
                Some(Ticket {
                    inner: Arc::clone(&self.inner),
                    id,
                })
            }
        };

        async move {
            let Some(ticket) = ticket else {
                return Err(RequestQueueError::Closed);
            };
            ticket.inner.pump();
            if go_rx.await.is_err() {
                return Err(RequestQueueError::Closed);
            }
            let output = execute().await;
            drop(ticket);
            Ok(output)
        }
    }

    /// Rejects every waiting request and refuses new ones. Running
    /// requests finish normally.
    pub fn close(&self) {
        let drained = {
            let mut st = self.inner.lock();
            st.closed = true;
            std::mem::take(&mut st.backlog)
        };
        debug!(rejected = drained.len(), "request queue closed");
    }

    pub fn stats(&self) -> RequestStats {
        let st = self.inner.lock();
        let mut counts = PriorityCounts::default();
        for w in &st.backlog {
            counts.bump(w.priority);
        }
        RequestStats {
            queue_length: st.backlog.len(),
            active_requests: st.admitted.len(),
            counts_by_priority: counts,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    pub fn max_concurrent_low_priority(&self) -> usize {
        self.inner.max_concurrent_low_priority
    }
}
