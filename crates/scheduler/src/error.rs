//! Error types for the scheduling primitives.

/// Errors produced by [`WorkerPool`](crate::WorkerPool).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("pool terminated")]
    Terminated,

    /// The handler panicked. Only the job it was running is rejected.
    #[error("worker failed: {0}")]
    WorkerFailed(String),
}

/// Errors produced by [`RequestQueue`](crate::RequestQueue).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestQueueError {
    #[error("request queue closed")]
    Closed,
}
