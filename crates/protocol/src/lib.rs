//! Shared types for the Vaultline upload pipeline.
//!
//! Everything that crosses a crate boundary or a worker boundary lives
//! here: task status snapshots, queue/scheduler statistics, and the
//! chunk-processing message contract.

pub mod messages;
pub mod types;

pub use messages::{ChunkJob, ChunkReceipt, ChunkResult, UploadReceipt};
pub use types::{
    Priority, PriorityCounts, QueueEntryStatus, QueueStatus, RequestStats, TaskSnapshot,
    UploadStatus,
};
