//! End-to-end: session -> queue -> manager -> worker pool -> request
//! queue -> sink, then decrypt what landed on disk.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vaultline_crypto::{ContentKey, open_chunk};
use vaultline_protocol::{ChunkReceipt, UploadReceipt, UploadStatus};
use vaultline_transfer::{ChunkStore, EncryptedChunk, MANIFEST_FILE, checksum_bytes};
use vaultline_upload::{
    ChunkSink, DirectorySink, FileRef, KeyProvider, UploadError, UploadSession, UploadSettings,
};

const KEY: [u8; 32] = [0x42; 32];

struct FixedKey;

impl KeyProvider for FixedKey {
    fn content_key<'a>(
        &'a self,
        _file: &'a FileRef,
    ) -> Pin<Box<dyn Future<Output = Result<ContentKey, UploadError>> + Send + 'a>> {
        Box::pin(async { Ok(ContentKey::from_bytes(KEY)) })
    }
}

/// Delays chunks before handing them to a [`DirectorySink`] and records
/// the order they were stored in.
struct DelayedSink {
    inner: DirectorySink,
    delay: fn(u32) -> Duration,
    stored: Mutex<Vec<u32>>,
}

impl ChunkSink for DelayedSink {
    fn put_chunk<'a>(
        &'a self,
        destination: &'a str,
        task_id: &'a str,
        chunk: EncryptedChunk,
    ) -> Pin<Box<dyn Future<Output = Result<ChunkReceipt, UploadError>> + Send + 'a>> {
        Box::pin(async move {
            tokio::time::sleep((self.delay)(chunk.index)).await;
            let index = chunk.index;
            let receipt = self.inner.put_chunk(destination, task_id, chunk).await?;
            self.stored.lock().unwrap().push(index);
            Ok(receipt)
        })
    }

    fn finish<'a>(
        &'a self,
        destination: &'a str,
        task_id: &'a str,
        receipt: &'a UploadReceipt,
    ) -> Pin<Box<dyn Future<Output = Result<(), UploadError>> + Send + 'a>> {
        self.inner.finish(destination, task_id, receipt)
    }
}

fn settings(concurrency: usize) -> UploadSettings {
    UploadSettings {
        concurrency_limit: concurrency,
        max_workers: 2,
        chunk_size: 4096,
        max_chunks_in_flight: 4,
        ..UploadSettings::default()
    }
}

fn write_source(dir: &Path, name: &str, len: usize) -> std::path::PathBuf {
    let data: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

/// Reads the manifest and every chunk back, checks hashes, decrypts.
fn restore(out: &Path, destination: &str, task_id: &str) -> (UploadReceipt, Vec<u8>) {
    let store = ChunkStore::new(&out.join(destination));
    let raw = std::fs::read(out.join(destination).join(task_id).join(MANIFEST_FILE)).unwrap();
    let manifest: UploadReceipt = serde_json::from_slice(&raw).unwrap();

    let key = ContentKey::from_bytes(KEY);
    let mut plain = Vec::new();
    for chunk in &manifest.chunks {
        let ciphertext = store.read_chunk(task_id, chunk.index).unwrap();
        assert_eq!(checksum_bytes(&ciphertext), chunk.hash);
        assert_eq!(ciphertext.len() as u64, chunk.ciphertext_len);
        let part = open_chunk(&key, chunk.index, &chunk.nonce, &ciphertext).unwrap();
        assert_eq!(part.len() as u64, chunk.plaintext_len);
        plain.extend(part);
    }
    (manifest, plain)
}

#[tokio::test]
async fn uploaded_chunks_decrypt_to_the_original() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let session = UploadSession::new(settings(3), Arc::new(DirectorySink::new(out.path())))
        .with_key_provider(Arc::new(FixedKey));

    let sizes = [0usize, 1, 4096, 4097, 50_000];
    let mut uploads = Vec::new();
    for (i, len) in sizes.iter().enumerate() {
        let path = write_source(src.path(), &format!("file-{i}.bin"), *len);
        uploads.push((path.clone(), session.upload_file(&path, "vault").unwrap()));
    }
    session.queue().wait_idle().await;

    for (path, upload) in &uploads {
        assert_eq!(upload.status(), UploadStatus::Completed, "{}", path.display());
        let (manifest, plain) = restore(out.path(), "vault", upload.id());
        assert_eq!(plain, std::fs::read(path).unwrap());
        assert_eq!(manifest, upload.receipt().unwrap());
        assert_eq!(manifest.chunk_size, 4096);
    }
    session.shutdown().await;
}

#[tokio::test]
async fn out_of_order_chunks_are_reassembled_by_index() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let sink = Arc::new(DelayedSink {
        inner: DirectorySink::new(out.path()),
        // Even chunks take much longer, so odd ones land first.
        delay: |index| Duration::from_millis(if index % 2 == 0 { 30 } else { 1 }),
        stored: Mutex::new(Vec::new()),
    });
    let session = UploadSession::new(settings(1), Arc::clone(&sink) as Arc<dyn ChunkSink>)
        .with_key_provider(Arc::new(FixedKey));

    let path = write_source(src.path(), "mixed.bin", 8 * 4096 + 17);
    let upload = session.upload_file(&path, "vault").unwrap();
    session.queue().wait_idle().await;
    assert_eq!(upload.status(), UploadStatus::Completed);

    let stored = sink.stored.lock().unwrap().clone();
    let mut sorted = stored.clone();
    sorted.sort_unstable();
    assert_ne!(stored, sorted, "chunks should have been stored out of order");

    let (manifest, plain) = restore(out.path(), "vault", upload.id());
    let indices: Vec<u32> = manifest.chunks.iter().map(|c| c.index).collect();
    assert_eq!(indices, (0..9).collect::<Vec<_>>());
    assert_eq!(plain, std::fs::read(&path).unwrap());
    session.shutdown().await;
}

#[tokio::test]
async fn pause_and_resume_retransfers_the_whole_file() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let sink = Arc::new(DelayedSink {
        inner: DirectorySink::new(out.path()),
        delay: |_| Duration::from_millis(5),
        stored: Mutex::new(Vec::new()),
    });
    let session = UploadSession::new(settings(1), Arc::clone(&sink) as Arc<dyn ChunkSink>)
        .with_key_provider(Arc::new(FixedKey));

    let path = write_source(src.path(), "big.bin", 200 * 4096);
    let upload = session.upload_file(&path, "vault").unwrap();
    while upload.status() != UploadStatus::Uploading {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let queue = session.queue();
    assert!(queue.pause_upload(upload.id()));
    // Let the first attempt notice the pause and stop dispatching.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(upload.status(), UploadStatus::Paused);
    assert_eq!(queue.status().active, 1);
    let before = sink.stored.lock().unwrap().len();
    assert!(before < 200);

    assert!(queue.resume_upload(upload.id()));
    queue.wait_idle().await;

    assert_eq!(upload.status(), UploadStatus::Completed);
    assert_eq!(upload.attempt(), 2);
    // The second attempt alone stores every chunk again.
    assert!(sink.stored.lock().unwrap().len() - before >= 200);

    let (_, plain) = restore(out.path(), "vault", upload.id());
    assert_eq!(plain, std::fs::read(&path).unwrap());
    session.shutdown().await;
}
