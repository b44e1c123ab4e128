//! Resumable parallel encrypted uploads.
//!
//! - [`UploadManager`]: one file's lifecycle (start, pause, resume,
//!   cancel, destroy).
//! - [`ParallelUploadQueue`]: admits a bounded number of managers at once
//!   and promotes queued ones as slots free.
//! - [`EncryptedTransfer`]: the reference [`Transfer`], encrypting chunks
//!   on a worker pool and sending them through a priority request queue
//!   to a [`ChunkSink`].
//! - [`UploadSession`]: wires all of the above from [`UploadSettings`].

pub mod config;
pub mod error;
pub mod manager;
pub mod pipeline;
pub mod queue;
pub mod session;
pub mod sink;
pub mod transfer;
pub mod types;

pub use config::UploadSettings;
pub use error::UploadError;
pub use manager::{Listener, UploadManager};
pub use pipeline::EncryptedTransfer;
pub use queue::ParallelUploadQueue;
pub use session::UploadSession;
pub use sink::{ChunkSink, DirectorySink};
pub use transfer::{KeyProvider, RandomKeyProvider, Transfer};
pub use types::{FileRef, PauseProbe, ProgressFn, TransferOutcome, TransferRequest};
