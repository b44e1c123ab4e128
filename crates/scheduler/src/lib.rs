//! Admission control primitives for the upload pipeline.
//!
//! - [`Semaphore`]: FIFO counting gate.
//! - [`WorkerPool`]: bounded pool of OS threads for CPU-heavy jobs.
//! - [`RequestQueue`]: priority-aware gate for outbound network calls.
//!
//! None of these enforce timeouts. A stalled job or request holds its
//! slot until it settles.

pub mod error;
pub mod pool;
pub mod request_queue;
pub mod semaphore;

pub use error::{PoolError, RequestQueueError};
pub use pool::{JobHandler, PoolStats, WorkerPool, default_worker_count};
pub use request_queue::RequestQueue;
pub use semaphore::Semaphore;

/// Upper bound on worker threads created by default.
pub const MAX_DEFAULT_WORKERS: usize = 6;

/// Default total number of in-flight network requests.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 6;

/// Default in-flight cap for low-priority requests while higher-priority
/// ones are waiting.
pub const DEFAULT_MAX_CONCURRENT_LOW_PRIORITY: usize = 4;
