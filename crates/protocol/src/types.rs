use serde::{Deserialize, Serialize};

/// Current state of a single file upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    /// Returns `true` for states no transfer attempt will leave on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Cancelled
        )
    }

    /// Returns `true` if the upload still holds (or waits for) work.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            UploadStatus::Pending | UploadStatus::Uploading | UploadStatus::Paused
        )
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Paused => "paused",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of an upload task, delivered to progress listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub task_id: String,
    pub file_name: String,
    pub status: UploadStatus,
    /// Fraction of the file transferred, in `[0.0, 1.0]`.
    pub progress: f64,
    pub total_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of `start()` attempts made so far.
    pub attempt: u32,
}

impl TaskSnapshot {
    /// Returns the upload progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        (self.progress * 100.0).clamp(0.0, 100.0)
    }

    /// Bytes transferred, derived from the progress fraction.
    pub fn transferred_bytes(&self) -> u64 {
        (self.total_bytes as f64 * self.progress.clamp(0.0, 1.0)) as u64
    }
}

/// Network request priority class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Interactive calls; admitted ahead of everything queued.
    High,
    #[default]
    Normal,
    /// Bulk transfer traffic.
    Low,
}

/// Coarse, queue-level view of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueEntryStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

/// Snapshot returned by the parallel upload queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queued: usize,
    pub active: usize,
    pub max_concurrency: usize,
    pub has_worker_support: bool,
}

/// Waiting requests per priority class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityCounts {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl PriorityCounts {
    pub fn bump(&mut self, priority: Priority) {
        match priority {
            Priority::High => self.high += 1,
            Priority::Normal => self.normal += 1,
            Priority::Low => self.low += 1,
        }
    }
}

/// Snapshot returned by the request queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStats {
    pub queue_length: usize,
    pub active_requests: usize,
    pub counts_by_priority: PriorityCounts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_status_serialization() {
        assert_eq!(
            serde_json::to_string(&UploadStatus::Uploading).unwrap(),
            "\"uploading\""
        );
        assert_eq!(
            serde_json::to_string(&UploadStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
        let parsed: UploadStatus = serde_json::from_str("\"paused\"").unwrap();
        assert_eq!(parsed, UploadStatus::Paused);
    }

    #[test]
    fn terminal_and_active_are_disjoint() {
        for status in [
            UploadStatus::Pending,
            UploadStatus::Uploading,
            UploadStatus::Paused,
            UploadStatus::Completed,
            UploadStatus::Failed,
            UploadStatus::Cancelled,
        ] {
            assert_ne!(status.is_terminal(), status.is_active(), "{status}");
        }
    }

    #[test]
    fn snapshot_percentage_and_bytes() {
        let snap = TaskSnapshot {
            task_id: "t1".into(),
            file_name: "a.bin".into(),
            status: UploadStatus::Uploading,
            progress: 0.5,
            total_bytes: 1000,
            error: None,
            attempt: 1,
        };
        assert!((snap.percentage() - 50.0).abs() < f64::EPSILON);
        assert_eq!(snap.transferred_bytes(), 500);

        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"taskId\":\"t1\""));
        assert!(!json.contains("error"));
    }

    #[test]
    fn priority_default_is_normal() {
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "\"high\"");
    }

    #[test]
    fn request_stats_field_names() {
        let mut counts = PriorityCounts::default();
        counts.bump(Priority::Low);
        counts.bump(Priority::Low);
        counts.bump(Priority::High);
        let stats = RequestStats {
            queue_length: 3,
            active_requests: 1,
            counts_by_priority: counts,
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"queueLength\":3"));
        assert!(json.contains("\"countsByPriority\":{\"high\":1,\"normal\":0,\"low\":2}"));
    }
}
