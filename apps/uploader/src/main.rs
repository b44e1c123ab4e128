//! vaultline-uploader: encrypts local files chunk by chunk into a
//! destination directory, several files at once.

mod progress;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vaultline_protocol::UploadStatus;
use vaultline_upload::{DirectorySink, UploadSession, UploadSettings};

use crate::progress::ProgressReporter;

#[derive(Parser, Debug)]
#[command(name = "vaultline-uploader")]
#[command(version)]
#[command(about = "Encrypted, resumable parallel file uploads into a chunk directory")]
struct Args {
    /// Files to upload
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Directory receiving the encrypted chunks
    #[arg(short, long)]
    dest: PathBuf,

    /// Folder inside the destination directory, one subfolder per upload
    #[arg(long, default_value = "uploads")]
    folder: String,

    /// Files uploading at once (1-6)
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Encryption worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Plaintext chunk size (e.g. 4MB, 512KB, 65536)
    #[arg(long)]
    chunk_size: Option<String>,

    /// Settings file (defaults to ~/.config/vaultline/config.json)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn parse_chunk_size(s: &str) -> Result<usize> {
    let s = s.trim().to_uppercase();
    let (digits, multiplier) = if let Some(n) = s.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("KB") {
        (n, 1024)
    } else if let Some(n) = s.strip_suffix('B') {
        (n, 1)
    } else {
        (s.as_str(), 1)
    };
    let value: usize = digits
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid chunk size: {s}"))?;
    if value == 0 {
        return Err(anyhow!("Chunk size must be greater than zero"));
    }
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow!("Chunk size too large: {s}"))
}

fn resolve_settings(args: &Args) -> Result<UploadSettings> {
    let mut settings = match &args.config {
        Some(path) => {
            let mut settings = UploadSettings::load_from(path)
                .with_context(|| format!("reading {}", path.display()))?;
            settings.apply_env(|name| std::env::var(name).ok());
            settings
        }
        None => UploadSettings::load().context("loading upload settings")?,
    };

    if let Some(n) = args.concurrency {
        settings.concurrency_limit = n;
    }
    if let Some(n) = args.workers {
        settings.max_workers = n;
    }
    if let Some(raw) = &args.chunk_size {
        settings.chunk_size = parse_chunk_size(raw)?;
    }
    Ok(settings.normalized())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,vaultline=debug")),
        )
        .init();

    let args = Args::parse();
    let settings = resolve_settings(&args)?;

    std::fs::create_dir_all(&args.dest)
        .with_context(|| format!("creating {}", args.dest.display()))?;

    let reporter = Arc::new(ProgressReporter::new());
    let listener = Arc::clone(&reporter);
    let session = UploadSession::new(settings, Arc::new(DirectorySink::new(&args.dest)))
        .with_listener(move |snapshot| listener.on_snapshot(&snapshot));

    let mut uploads = Vec::new();
    for path in &args.files {
        match session.upload_file(path, &args.folder) {
            Ok(upload) => {
                info!(upload = %upload.id(), file = %path.display(), "queued");
                uploads.push(upload);
            }
            Err(e) => warn!(file = %path.display(), error = %e, "skipping file"),
        }
    }

    tokio::select! {
        _ = session.queue().wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling uploads");
        }
    }

    let failed: Vec<_> = uploads
        .iter()
        .filter(|u| u.status() != UploadStatus::Completed)
        .map(|u| (u.file().name.clone(), u.status()))
        .collect();

    session.shutdown().await;

    let summary = reporter.summary();
    info!(
        completed = summary.get(&UploadStatus::Completed).copied().unwrap_or(0),
        failed = summary.get(&UploadStatus::Failed).copied().unwrap_or(0),
        cancelled = summary.get(&UploadStatus::Cancelled).copied().unwrap_or(0),
        dest = %args.dest.display(),
        "done"
    );

    for upload in &uploads {
        if let Some(receipt) = upload.receipt() {
            println!(
                "{}\t{}\t{} chunks\t{}",
                upload.id(),
                upload.file().name,
                receipt.chunks.len(),
                args.dest.join(&args.folder).join(upload.id()).display()
            );
        }
    }

    let skipped = args.files.len() - uploads.len();
    if !failed.is_empty() || skipped > 0 {
        for (name, status) in &failed {
            eprintln!("{name}: {status}");
        }
        return Err(anyhow!(
            "{} of {} files did not upload",
            failed.len() + skipped,
            args.files.len()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_suffixes() {
        assert_eq!(parse_chunk_size("4MB").unwrap(), 4 * 1024 * 1024);
        assert_eq!(parse_chunk_size("512kb").unwrap(), 512 * 1024);
        assert_eq!(parse_chunk_size("65536").unwrap(), 65536);
        assert_eq!(parse_chunk_size("100B").unwrap(), 100);
        assert!(parse_chunk_size("0").is_err());
        assert!(parse_chunk_size("lots").is_err());
        assert!(parse_chunk_size(&format!("{}MB", usize::MAX / 1024)).is_err());
    }

    #[test]
    fn cli_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.json");
        std::fs::write(&config, r#"{"concurrency_limit": 2, "max_workers": 3}"#).unwrap();

        let args = Args::parse_from([
            "vaultline-uploader",
            "a.bin",
            "--dest",
            "/tmp/out",
            "--concurrency",
            "9",
            "--chunk-size",
            "64KB",
            "--config",
            config.to_str().unwrap(),
        ]);
        let settings = resolve_settings(&args).unwrap();
        assert_eq!(settings.concurrency_limit, 6);
        assert_eq!(settings.chunk_size, 64 * 1024);
        assert_eq!(args.folder, "uploads");
    }
}
