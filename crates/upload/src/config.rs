//! Upload settings.
//!
//! Read from `~/.config/vaultline/config.json`; every field is optional.
//! Environment variables override the file:
//! - `VAULTLINE_CONCURRENCY`: files uploading at once
//! - `VAULTLINE_MAX_WORKERS`: encryption worker threads
//! - `VAULTLINE_CHUNK_SIZE`: plaintext chunk size in bytes

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vaultline_scheduler::{
    DEFAULT_MAX_CONCURRENT_LOW_PRIORITY, DEFAULT_MAX_CONCURRENT_REQUESTS, MAX_DEFAULT_WORKERS,
    default_worker_count,
};
use vaultline_transfer::DEFAULT_CHUNK_SIZE;

use crate::error::UploadError;
use crate::pipeline::DEFAULT_MAX_CHUNKS_IN_FLIGHT;
use crate::queue::{DEFAULT_CONCURRENCY, MAX_CONCURRENCY};

pub const ENV_CONCURRENCY: &str = "VAULTLINE_CONCURRENCY";
pub const ENV_MAX_WORKERS: &str = "VAULTLINE_MAX_WORKERS";
pub const ENV_CHUNK_SIZE: &str = "VAULTLINE_CHUNK_SIZE";

/// Smallest accepted chunk size (4 KiB).
const MIN_CHUNK_SIZE: usize = 4 * 1024;

/// Largest accepted chunk size (64 MiB).
const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    /// Files uploading at once, 1 to 6.
    pub concurrency_limit: usize,
    /// Encryption worker threads.
    pub max_workers: usize,
    /// Plaintext bytes per chunk.
    pub chunk_size: usize,
    /// Chunks of one file encrypted or in transit at once.
    pub max_chunks_in_flight: usize,
    pub max_concurrent_requests: usize,
    /// Low-priority requests allowed while others wait.
    pub max_concurrent_low_priority: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY,
            max_workers: default_worker_count(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunks_in_flight: DEFAULT_MAX_CHUNKS_IN_FLIGHT,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            max_concurrent_low_priority: DEFAULT_MAX_CONCURRENT_LOW_PRIORITY,
        }
    }
}

impl UploadSettings {
    /// Loads the default config file, then applies environment overrides.
    pub fn load() -> Result<Self, UploadError> {
        let mut settings = Self::load_from(&config_path())?;
        settings.apply_env(|name| std::env::var(name).ok());
        Ok(settings.normalized())
    }

    /// Reads `path`. A missing file yields defaults; an unparseable one
    /// is logged and ignored.
    pub fn load_from(path: &Path) -> Result<Self, UploadError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<Self>(&content) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse upload settings, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    /// Applies overrides from `lookup` (normally the process environment).
    /// Values that do not parse as positive integers are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let read = |name: &str| -> Option<usize> {
            let raw = lookup(name)?;
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => Some(n),
                _ => {
                    tracing::warn!(var = name, value = %raw, "ignoring invalid override");
                    None
                }
            }
        };
        if let Some(n) = read(ENV_CONCURRENCY) {
            self.concurrency_limit = n;
        }
        if let Some(n) = read(ENV_MAX_WORKERS) {
            self.max_workers = n;
        }
        if let Some(n) = read(ENV_CHUNK_SIZE) {
            self.chunk_size = n;
        }
    }

    /// Clamps every field into its accepted range.
    pub fn normalized(mut self) -> Self {
        self.concurrency_limit = self.concurrency_limit.clamp(1, MAX_CONCURRENCY);
        if self.max_workers == 0 {
            self.max_workers = default_worker_count();
        }
        self.max_workers = self.max_workers.min(MAX_DEFAULT_WORKERS * 4);
        self.chunk_size = self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        self.max_chunks_in_flight = self.max_chunks_in_flight.max(1);
        self.max_concurrent_requests = self.max_concurrent_requests.max(1);
        self.max_concurrent_low_priority = self
            .max_concurrent_low_priority
            .clamp(1, self.max_concurrent_requests);
        self
    }
}

/// `~/.config/vaultline/config.json`.
pub fn config_path() -> PathBuf {
    config_base_dir().join("vaultline").join("config.json")
}

fn config_base_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata)
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config")
    }
}
