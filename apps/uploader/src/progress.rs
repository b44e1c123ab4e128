//! Console progress reporting for the uploader.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};
use vaultline_protocol::{TaskSnapshot, UploadStatus};
use vaultline_transfer::SpeedCalculator;

struct TaskLine {
    status: UploadStatus,
    bytes: u64,
    last_percent: u32,
}

/// Aggregates snapshots from every upload into throughput and per-file
/// progress lines.
#[derive(Default)]
pub struct ProgressReporter {
    speed: SpeedCalculator,
    tasks: Mutex<HashMap<String, TaskLine>>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TaskLine>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_snapshot(&self, snap: &TaskSnapshot) {
        let bytes = snap.transferred_bytes();
        let percent = snap.percentage() as u32;

        let (status_changed, delta, step) = {
            let mut tasks = self.lock();
            let line = tasks.entry(snap.task_id.clone()).or_insert(TaskLine {
                status: UploadStatus::Pending,
                bytes: 0,
                last_percent: 0,
            });
            let status_changed = line.status != snap.status;
            // A restarted attempt begins again from zero.
            let delta = bytes.saturating_sub(line.bytes);
            let step = percent >= line.last_percent + 10;
            line.status = snap.status;
            line.bytes = bytes;
            if step || status_changed {
                line.last_percent = percent;
            }
            (status_changed, delta, step)
        };

        if delta > 0 {
            self.speed.add_sample(delta);
        }

        if status_changed {
            match (snap.status, &snap.error) {
                (UploadStatus::Failed, Some(error)) => {
                    warn!(file = %snap.file_name, attempt = snap.attempt, %error, "upload failed")
                }
                (status, _) => info!(file = %snap.file_name, attempt = snap.attempt, %status, "upload status"),
            }
        } else if step && snap.status == UploadStatus::Uploading {
            let remaining = snap.total_bytes.saturating_sub(bytes);
            info!(
                file = %snap.file_name,
                percent,
                speed = %format_rate(self.speed.bytes_per_second()),
                eta_secs = self.speed.eta(remaining).map(|d| d.as_secs()),
                "uploading"
            );
        }
    }

    /// Files per final status.
    pub fn summary(&self) -> HashMap<UploadStatus, usize> {
        let mut counts = HashMap::new();
        for line in self.lock().values() {
            *counts.entry(line.status).or_insert(0) += 1;
        }
        counts
    }
}

pub fn format_rate(bytes_per_second: f64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = KIB * 1024.0;
    if bytes_per_second >= MIB {
        format!("{:.1} MiB/s", bytes_per_second / MIB)
    } else if bytes_per_second >= KIB {
        format!("{:.1} KiB/s", bytes_per_second / KIB)
    } else {
        format!("{bytes_per_second:.0} B/s")
    }
}
