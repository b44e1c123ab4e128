//! Bounded pool of background worker threads.
//!
//! Workers are created lazily, up to `max_workers`. Jobs beyond that wait
//! in a FIFO backlog. Every job carries a pool-unique id; results travel
//! back over a completion channel tagged with that id and are matched to
//! their caller through the pending map, so concurrent jobs may finish in
//! any order.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc as std_mpsc};
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::MAX_DEFAULT_WORKERS;
use crate::error::PoolError;

/// Work executed on a pool thread.
///
/// `handle` runs on a dedicated OS thread and may block. A panic inside
/// `handle` rejects only the job being processed.
pub trait JobHandler: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    fn handle(&self, request: Self::Request) -> Self::Response;
}

/// Default pool size: half the available parallelism, between 1 and
/// [`MAX_DEFAULT_WORKERS`].
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .clamp(1, MAX_DEFAULT_WORKERS)
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub max_workers: usize,
    pub live_workers: usize,
    pub free_workers: usize,
    pub queued: usize,
    pub in_flight: usize,
}

type Reply<R> = oneshot::Sender<Result<R, PoolError>>;

struct Envelope<Req> {
    job_id: u64,
    request: Req,
}

struct Completion<Resp> {
    worker: usize,
    job_id: u64,
    outcome: Result<Resp, String>,
}

struct Worker<Req> {
    tx: std_mpsc::Sender<Envelope<Req>>,
    // Detached on terminate; kept so the thread is owned by the pool.
    _thread: JoinHandle<()>,
}

struct PoolState<Req, Resp> {
    workers: Vec<Worker<Req>>,
    free: Vec<usize>,
    backlog: VecDeque<Envelope<Req>>,
    pending: HashMap<u64, Reply<Resp>>,
    next_job_id: u64,
    terminated: bool,
}

impl<Req, Resp> PoolState<Req, Resp> {
    /// Pops the oldest queued job whose caller is still waiting. Jobs
    /// whose caller went away are dropped without running.
    fn next_live(&mut self) -> Option<Envelope<Req>> {
        while let Some(env) = self.backlog.pop_front() {
            match self.pending.get(&env.job_id) {
                Some(reply) if !reply.is_closed() => return Some(env),
                _ => {
                    self.pending.remove(&env.job_id);
                    trace!(job_id = env.job_id, "dropping abandoned job");
                }
            }
        }
        None
    }

    /// Hands `env` to `worker`. If the thread is gone the job is rejected.
    fn dispatch(&mut self, worker: usize, env: Envelope<Req>) {
        trace!(worker, job_id = env.job_id, "dispatching job");
        if let Err(std_mpsc::SendError(env)) = self.workers[worker].tx.send(env) {
            warn!(worker, job_id = env.job_id, "worker thread gone, rejecting job");
            if let Some(reply) = self.pending.remove(&env.job_id) {
                let _ = reply.send(Err(PoolError::WorkerFailed("worker thread exited".into())));
            }
        }
    }
}

struct Shared<H: JobHandler> {
    handler: Arc<H>,
    max_workers: usize,
    done_tx: mpsc::UnboundedSender<Completion<H::Response>>,
    state: Mutex<PoolState<H::Request, H::Response>>,
}

impl<H: JobHandler> Shared<H> {
    fn lock(&self) -> MutexGuard<'_, PoolState<H::Request, H::Response>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns worker number `workers.len()`.
    fn spawn_worker(
        &self,
        st: &mut PoolState<H::Request, H::Response>,
    ) -> std::io::Result<usize> {
        let id = st.workers.len();
        let (tx, rx) = std_mpsc::channel::<Envelope<H::Request>>();
        let handler = Arc::clone(&self.handler);
        let done_tx = self.done_tx.clone();

        let thread = std::thread::Builder::new()
            .name(format!("vaultline-worker-{id}"))
            .spawn(move || {
                while let Ok(env) = rx.recv() {
                    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        handler.handle(env.request)
                    }))
                    .map_err(|payload| panic_message(payload.as_ref()));
                    let done = Completion {
                        worker: id,
                        job_id: env.job_id,
                        outcome,
                    };
                    if done_tx.send(done).is_err() {
                        break;
                    }
                }
            })?;

        st.workers.push(Worker {
            tx,
            _thread: thread,
        });
        debug!(worker = id, max = self.max_workers, "worker started");
        Ok(id)
    }

    fn complete(&self, done: Completion<H::Response>) {
        let mut st = self.lock();
        if st.terminated {
            return;
        }

        match st.pending.remove(&done.job_id) {
            Some(reply) => {
                let result = done.outcome.map_err(|msg| {
                    warn!(worker = done.worker, job_id = done.job_id, error = %msg, "job failed on worker");
                    PoolError::WorkerFailed(msg)
                });
                let _ = reply.send(result);
            }
            None => trace!(job_id = done.job_id, "discarding result with no waiter"),
        }

        // The worker is recycled even after a failure.
        match st.next_live() {
            Some(next) => st.dispatch(done.worker, next),
            None => st.free.push(done.worker),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".into()
    }
}

/// Bounded pool of worker threads running a single [`JobHandler`].
///
/// Must be created inside a Tokio runtime: completions are collected by a
/// task spawned at construction.
pub struct WorkerPool<H: JobHandler> {
    shared: Arc<Shared<H>>,
    collector: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<H: JobHandler> WorkerPool<H> {
    /// Creates a pool. `max_workers` of `None` (or `Some(0)`) uses
    /// [`default_worker_count`].
    pub fn new(handler: H, max_workers: Option<usize>) -> Self {
        let max_workers = match max_workers {
            Some(n) if n > 0 => n,
            _ => default_worker_count(),
        };
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            handler: Arc::new(handler),
            max_workers,
            done_tx,
            state: Mutex::new(PoolState {
                workers: Vec::new(),
                free: Vec::new(),
                backlog: VecDeque::new(),
                pending: HashMap::new(),
                next_job_id: 1,
                terminated: false,
            }),
        });

        let weak = Arc::downgrade(&shared);
        let collector = tokio::spawn(async move {
            while let Some(done) = done_rx.recv().await {
                let Some(shared) = weak.upgrade() else { break };
                shared.complete(done);
            }
        });

        Self {
            shared,
            collector: Mutex::new(Some(collector)),
        }
    }

    /// Runs `request` on a worker and returns its response.
    ///
    /// Starts immediately when a worker is free or the pool can grow;
    /// otherwise waits in the FIFO backlog.
    pub async fn execute(&self, request: H::Request) -> Result<H::Response, PoolError> {
        let rx = {
            let mut st = self.shared.lock();
            if st.terminated {
                return Err(PoolError::Terminated);
            }

            let job_id = st.next_job_id;
            st.next_job_id += 1;
            let (tx, rx) = oneshot::channel();
            st.pending.insert(job_id, tx);
            let env = Envelope { job_id, request };

            if let Some(worker) = st.free.pop() {
                st.dispatch(worker, env);
            } else if st.workers.len() < self.shared.max_workers {
                match self.shared.spawn_worker(&mut st) {
                    Ok(worker) => st.dispatch(worker, env),
                    Err(e) if st.workers.is_empty() => {
                        warn!(error = %e, "failed to start worker thread");
                        st.pending.remove(&job_id);
                        return Err(PoolError::WorkerFailed(e.to_string()));
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to grow pool, queueing job");
                        st.backlog.push_back(env);
                    }
                }
            } else {
                trace!(job_id, queued = st.backlog.len() + 1, "all workers busy, queueing job");
                st.backlog.push_back(env);
            }
            rx
        };

        // A dropped sender means the pool went away underneath us.
        rx.await.unwrap_or(Err(PoolError::Terminated))
    }

    /// Stops every worker and rejects every job that has not resolved.
    ///
    /// Jobs still running finish on their thread but their results are
    /// discarded. Idempotent.
    pub fn terminate(&self) {
        let (workers, backlog, pending) = {
            let mut st = self.shared.lock();
            if st.terminated {
                return;
            }
            st.terminated = true;
            st.free.clear();
            (
                std::mem::take(&mut st.workers),
                std::mem::take(&mut st.backlog),
                std::mem::take(&mut st.pending),
            )
        };

        debug!(
            workers = workers.len(),
            queued = backlog.len(),
            pending = pending.len(),
            "terminating worker pool"
        );

        for (_, reply) in pending {
            let _ = reply.send(Err(PoolError::Terminated));
        }
        // Dropping the senders ends each worker loop after its current job.
        drop(workers);
        drop(backlog);

        if let Some(collector) = self
            .collector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            collector.abort();
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.lock().terminated
    }

    pub fn max_workers(&self) -> usize {
        self.shared.max_workers
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.shared.lock();
        PoolStats {
            max_workers: self.shared.max_workers,
            live_workers: st.workers.len(),
            free_workers: st.free.len(),
            queued: st.backlog.len(),
            in_flight: st.pending.len().saturating_sub(st.backlog.len()),
        }
    }
}

impl<H: JobHandler> Drop for WorkerPool<H> {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{Receiver, Sender, channel};
    use std::time::Duration;

    /// Echoes its tag after the gate opens (or immediately without a gate).
    struct GatedEcho;

    struct GatedJob {
        tag: &'static str,
        gate: Option<Receiver<()>>,
    }

    impl JobHandler for GatedEcho {
        type Request = GatedJob;
        type Response = String;

        fn handle(&self, job: GatedJob) -> String {
            if let Some(gate) = job.gate {
                let _ = gate.recv();
            }
            if job.tag == "boom" {
                panic!("handler exploded");
            }
            format!("done:{}", job.tag)
        }
    }

    /// [`GatedEcho`] that counts how many jobs it actually ran.
    struct Counting(Arc<std::sync::atomic::AtomicUsize>);

    impl JobHandler for Counting {
        type Request = GatedJob;
        type Response = String;

        fn handle(&self, job: GatedJob) -> String {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            GatedEcho.handle(job)
        }
    }

    fn gated(tag: &'static str) -> (GatedJob, Sender<()>) {
        let (tx, rx) = channel();
        (GatedJob { tag, gate: Some(rx) }, tx)
    }

    fn open(tag: &'static str) -> GatedJob {
        GatedJob { tag, gate: None }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn default_worker_count_is_bounded() {
        let n = default_worker_count();
        assert!((1..=MAX_DEFAULT_WORKERS).contains(&n));
    }

    #[tokio::test]
    async fn out_of_order_completion_matches_by_job_id() {
        let pool = Arc::new(WorkerPool::new(GatedEcho, Some(2)));
        let (job_a, gate_a) = gated("a");
        let (job_b, gate_b) = gated("b");

        let p = Arc::clone(&pool);
        let a = tokio::spawn(async move { p.execute(job_a).await });
        let p = Arc::clone(&pool);
        let b = tokio::spawn(async move { p.execute(job_b).await });
        wait_for(|| pool.stats().in_flight == 2).await;

        // B finishes first.
        gate_b.send(()).unwrap();
        let b_result = tokio::time::timeout(Duration::from_secs(2), b)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b_result.unwrap(), "done:b");
        assert!(!a.is_finished());

        gate_a.send(()).unwrap();
        let a_result = a.await.unwrap();
        assert_eq!(a_result.unwrap(), "done:a");
    }

    #[tokio::test]
    async fn never_exceeds_max_workers_and_queues_fifo() {
        let pool = Arc::new(WorkerPool::new(GatedEcho, Some(1)));
        let (first, gate) = gated("first");

        let p = Arc::clone(&pool);
        let h1 = tokio::spawn(async move { p.execute(first).await });
        wait_for(|| pool.stats().in_flight == 1).await;

        let p = Arc::clone(&pool);
        let h2 = tokio::spawn(async move { p.execute(open("second")).await });
        let p = Arc::clone(&pool);
        let h3 = tokio::spawn(async move { p.execute(open("third")).await });
        wait_for(|| pool.stats().queued == 2).await;

        let stats = pool.stats();
        assert_eq!(stats.live_workers, 1);
        assert_eq!(stats.free_workers, 0);

        gate.send(()).unwrap();
        assert_eq!(h1.await.unwrap().unwrap(), "done:first");
        assert_eq!(h2.await.unwrap().unwrap(), "done:second");
        assert_eq!(h3.await.unwrap().unwrap(), "done:third");

        wait_for(|| pool.stats().free_workers == 1).await;
        assert_eq!(pool.stats().live_workers, 1);
    }

    #[tokio::test]
    async fn abandoned_queued_jobs_never_run() {
        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let pool = Arc::new(WorkerPool::new(Counting(Arc::clone(&runs)), Some(1)));
        let (first, gate) = gated("first");

        let p = Arc::clone(&pool);
        let h_first = tokio::spawn(async move { p.execute(first).await });
        wait_for(|| pool.stats().in_flight == 1).await;

        let mut dropped = Vec::new();
        for tag in ["gone-1", "gone-2", "gone-3"] {
            let p = Arc::clone(&pool);
            dropped.push(tokio::spawn(async move { p.execute(open(tag)).await }));
        }
        wait_for(|| pool.stats().queued == 3).await;
        for h in dropped {
            h.abort();
            assert!(h.await.unwrap_err().is_cancelled());
        }

        let p = Arc::clone(&pool);
        let h_live = tokio::spawn(async move { p.execute(open("live")).await });
        wait_for(|| pool.stats().queued == 4).await;

        gate.send(()).unwrap();
        assert_eq!(h_first.await.unwrap().unwrap(), "done:first");
        assert_eq!(h_live.await.unwrap().unwrap(), "done:live");
        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(pool.stats().queued, 0);
    }

    #[tokio::test]
    async fn worker_panic_rejects_only_that_job() {
        let pool = WorkerPool::new(GatedEcho, Some(1));

        let err = pool.execute(open("boom")).await.unwrap_err();
        assert!(matches!(err, PoolError::WorkerFailed(ref m) if m.contains("exploded")));

        // Same single worker is reused.
        assert_eq!(pool.execute(open("after")).await.unwrap(), "done:after");
        assert_eq!(pool.stats().live_workers, 1);
    }

    #[tokio::test]
    async fn terminate_rejects_queued_jobs_once() {
        let pool = Arc::new(WorkerPool::new(GatedEcho, Some(1)));
        let (running, gate) = gated("running");

        let p = Arc::clone(&pool);
        let h_running = tokio::spawn(async move { p.execute(running).await });
        wait_for(|| pool.stats().in_flight == 1).await;

        let mut queued = Vec::new();
        for tag in ["q1", "q2", "q3"] {
            let p = Arc::clone(&pool);
            queued.push(tokio::spawn(async move { p.execute(open(tag)).await }));
        }
        wait_for(|| pool.stats().queued == 3).await;

        pool.terminate();
        assert!(pool.is_terminated());

        for h in queued {
            assert_eq!(h.await.unwrap(), Err(PoolError::Terminated));
        }

        // The running job completes on its thread but never resolves.
        gate.send(()).unwrap();
        assert_eq!(h_running.await.unwrap(), Err(PoolError::Terminated));

        assert_eq!(
            pool.execute(open("late")).await,
            Err(PoolError::Terminated)
        );
        let stats = pool.stats();
        assert_eq!(stats.live_workers, 0);
        assert_eq!(stats.queued, 0);
    }
}
