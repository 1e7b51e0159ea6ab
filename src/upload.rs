//! Parallel page blob upload.
//!
//! [`upload`] prepares the destination (container, blob, metadata) and
//! then fans the planned ranges out to a fixed set of tokio tasks.  Tasks
//! claim ranges through a shared cursor, so each range is written by
//! exactly one worker.  Source reads go through `spawn_blocking` since
//! [`ImageStream::read_at`] is synchronous file I/O.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::errors::PushError;
use crate::range::{total_length, IndexRange};
use crate::retry::RetryPolicy;
use crate::storage::backend::{PageBlobStore, MAX_PUT_PAGE_BYTES};
use crate::vhd::ImageStream;

/// Destination of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageTarget {
    pub resource_group_name: String,
    pub account_name: String,
    pub container_name: String,
    pub blob_name: String,
}

impl std::fmt::Display for StorageTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.account_name, self.container_name, self.blob_name
        )
    }
}

/// Everything the engine needs for one upload.
pub struct UploadContext {
    pub stream: Arc<dyn ImageStream>,
    /// Planned ranges, ordered and non-overlapping.
    pub ranges: Vec<IndexRange>,
    /// Bytes already present at the destination. Progress only.
    pub already_processed_bytes: u64,
    pub store: Arc<dyn PageBlobStore>,
    pub target: StorageTarget,
    pub parallelism: usize,
    /// Continue into an existing blob instead of creating it.
    pub resume: bool,
    /// Base64 MD5 of the logical stream.
    pub md5: Option<String>,
    /// Blob metadata written before any page.
    pub metadata: BTreeMap<String, String>,
    pub retry: RetryPolicy,
}

/// Outcome of a successful upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadReport {
    pub ranges_uploaded: usize,
    pub bytes_uploaded: u64,
    pub put_page_calls: u64,
    pub already_processed_bytes: u64,
    pub elapsed: Duration,
}

/// Progress accounting shared by the workers.
struct Progress {
    processed: AtomicU64,
    total: u64,
    last_percent: AtomicU64,
    started: Instant,
}

impl Progress {
    fn new(already_processed: u64, remaining: u64) -> Self {
        let total = already_processed + remaining;
        Self {
            processed: AtomicU64::new(already_processed),
            total,
            last_percent: AtomicU64::new(Self::percent(already_processed, total)),
            started: Instant::now(),
        }
    }

    fn percent(done: u64, total: u64) -> u64 {
        if total == 0 {
            return 100;
        }
        done.saturating_mul(100) / total
    }

    fn add(&self, bytes: u64) {
        let done = self.processed.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let pct = Self::percent(done, self.total);
        if self.last_percent.fetch_max(pct, Ordering::Relaxed) < pct {
            let secs = self.started.elapsed().as_secs_f64().max(0.001);
            info!(
                "Uploaded {}% ({} of {} bytes, {:.1} MiB/s)",
                pct,
                done,
                self.total,
                done as f64 / (1024.0 * 1024.0) / secs
            );
        }
    }
}

/// State shared by all workers of one upload.
struct Shared {
    stream: Arc<dyn ImageStream>,
    store: Arc<dyn PageBlobStore>,
    ranges: Vec<IndexRange>,
    cursor: AtomicUsize,
    failed: AtomicBool,
    container: String,
    blob: String,
    retry: RetryPolicy,
    progress: Progress,
    put_page_calls: AtomicU64,
}

/// Upload the planned ranges of `ctx.stream` to `ctx.target`.
pub async fn upload(ctx: UploadContext) -> Result<UploadReport, PushError> {
    let started = Instant::now();
    let container = ctx.target.container_name.clone();
    let blob = ctx.target.blob_name.clone();
    let store = ctx.store.clone();

    let created = ctx
        .retry
        .run("create container", || {
            store.create_container_if_absent(&container)
        })
        .await
        .map_err(|e| PushError::remote(format!("create container {}", container), e))?;
    if !created {
        debug!("Using existing container {}", container);
    }

    if ctx.resume {
        info!("Resuming upload into existing blob {}", ctx.target);
    } else {
        let size = ctx.stream.size();
        ctx.retry
            .run("create page blob", || {
                store.create_page_blob(&container, &blob, size)
            })
            .await
            .map_err(|e| PushError::remote(format!("create page blob {}", ctx.target), e))?;
        ctx.retry
            .run("set blob metadata", || {
                store.set_blob_metadata(&container, &blob, &ctx.metadata)
            })
            .await
            .map_err(|e| PushError::remote(format!("set metadata on {}", ctx.target), e))?;
    }

    let remaining = total_length(&ctx.ranges);
    let range_count = ctx.ranges.len();
    let workers = ctx.parallelism.max(1).min(range_count);
    info!(
        "Uploading {} ranges ({} bytes) to {} with {} workers",
        range_count, remaining, ctx.target, workers
    );

    let shared = Arc::new(Shared {
        stream: ctx.stream,
        store: ctx.store,
        ranges: ctx.ranges,
        cursor: AtomicUsize::new(0),
        failed: AtomicBool::new(false),
        container,
        blob,
        retry: ctx.retry,
        progress: Progress::new(ctx.already_processed_bytes, remaining),
        put_page_calls: AtomicU64::new(0),
    });

    let mut set = JoinSet::new();
    for id in 0..workers {
        set.spawn(worker(id, shared.clone()));
    }

    let mut bytes_uploaded = 0u64;
    let mut first_error: Option<PushError> = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(bytes)) => bytes_uploaded += bytes,
            Ok(Err(e)) => {
                if first_error.is_none() {
                    warn!("Aborting upload: {}", e);
                    shared.failed.store(true, Ordering::SeqCst);
                    set.abort_all();
                    first_error = Some(e);
                }
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                if first_error.is_none() {
                    shared.failed.store(true, Ordering::SeqCst);
                    set.abort_all();
                    first_error = Some(PushError::remote(
                        "upload worker",
                        anyhow::anyhow!("worker panicked: {}", e),
                    ));
                }
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    let report = UploadReport {
        ranges_uploaded: range_count,
        bytes_uploaded,
        put_page_calls: shared.put_page_calls.load(Ordering::SeqCst),
        already_processed_bytes: ctx.already_processed_bytes,
        elapsed: started.elapsed(),
    };
    info!(
        "Upload complete: {} bytes in {} Put Page calls, {:.1}s",
        report.bytes_uploaded,
        report.put_page_calls,
        report.elapsed.as_secs_f64()
    );
    Ok(report)
}

/// Claim and write ranges until none are left or another worker failed.
async fn worker(id: usize, shared: Arc<Shared>) -> Result<u64, PushError> {
    let mut written = 0u64;
    loop {
        if shared.failed.load(Ordering::SeqCst) {
            break;
        }
        let index = shared.cursor.fetch_add(1, Ordering::SeqCst);
        let Some(range) = shared.ranges.get(index).copied() else {
            break;
        };
        debug!("Worker {} writing {}", id, range);

        for piece in range.chunks(MAX_PUT_PAGE_BYTES) {
            let data = read_piece(shared.stream.clone(), piece).await?;
            shared
                .retry
                .run("put page", || {
                    shared
                        .store
                        .put_pages(&shared.container, &shared.blob, piece.offset, data.clone())
                })
                .await
                .map_err(|e| PushError::remote(format!("put page {}", piece), e))?;
            shared.put_page_calls.fetch_add(1, Ordering::Relaxed);
        }

        written += range.length;
        shared.progress.add(range.length);
    }
    Ok(written)
}

async fn read_piece(stream: Arc<dyn ImageStream>, piece: IndexRange) -> Result<Bytes, PushError> {
    let context = format!("image range {}", piece);
    let read = tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; piece.length as usize];
        stream.read_at(piece.offset, &mut buf).map(|_| Bytes::from(buf))
    })
    .await
    .map_err(|e| PushError::io(&context, std::io::Error::other(e)))?;
    read.map_err(|e| PushError::io(&context, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::merge;
    use crate::storage::memory::MemoryPageBlobStore;
    use crate::vhd::stream::MemoryImage;

    const MIB: u64 = 1024 * 1024;

    fn target() -> StorageTarget {
        StorageTarget {
            resource_group_name: "rg".into(),
            account_name: "acct".into(),
            container_name: "images".into(),
            blob_name: "disk.vhd".into(),
        }
    }

    fn patterned(len: u64) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 + 1).collect()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    fn context(
        data: Vec<u8>,
        ranges: Vec<IndexRange>,
        store: Arc<MemoryPageBlobStore>,
        parallelism: usize,
    ) -> UploadContext {
        let mut metadata = BTreeMap::new();
        metadata.insert("diskmetadata".to_string(), "e30=".to_string());
        UploadContext {
            stream: Arc::new(MemoryImage { data }),
            ranges,
            already_processed_bytes: 0,
            store,
            target: target(),
            parallelism,
            resume: false,
            md5: None,
            metadata,
            retry: fast_retry(),
        }
    }

    #[tokio::test]
    async fn test_every_parallelism_writes_planned_set_once() {
        let data = patterned(17 * MIB);
        let ranges: Vec<IndexRange> = [0u64, 2, 3, 6]
            .iter()
            .map(|p| IndexRange::new(p * 2 * MIB, 2 * MIB))
            .chain(std::iter::once(IndexRange::new(16 * MIB, MIB)))
            .collect();

        for parallelism in [1usize, 2, 3, 8, 64] {
            let store = Arc::new(MemoryPageBlobStore::new());
            let report = upload(context(data.clone(), ranges.clone(), store.clone(), parallelism))
                .await
                .unwrap();
            assert_eq!(report.ranges_uploaded, ranges.len());
            assert_eq!(report.bytes_uploaded, total_length(&ranges));

            let blob = store.blob("images", "disk.vhd").await.unwrap();
            let mut writes = blob.page_writes.clone();
            writes.sort();
            assert_eq!(writes, ranges, "parallelism {}", parallelism);
            for r in &ranges {
                let (a, b) = (r.offset as usize, r.end() as usize);
                assert_eq!(&blob.data[a..b], &data[a..b]);
            }
            // Unplanned pages stay empty.
            assert!(blob.data[2 * MIB as usize..4 * MIB as usize]
                .iter()
                .all(|b| *b == 0));
            assert_eq!(blob.metadata["diskmetadata"], "e30=");
        }
    }

    #[tokio::test]
    async fn test_large_ranges_split_into_put_page_calls() {
        let data = patterned(10 * MIB);
        let ranges = vec![IndexRange::new(0, 10 * MIB)];
        let store = Arc::new(MemoryPageBlobStore::new());

        let report = upload(context(data, ranges.clone(), store.clone(), 4))
            .await
            .unwrap();
        assert_eq!(report.put_page_calls, 3);

        let blob = store.blob("images", "disk.vhd").await.unwrap();
        assert!(blob
            .page_writes
            .iter()
            .all(|w| w.length <= MAX_PUT_PAGE_BYTES));
        assert_eq!(merge(&blob.page_writes), ranges);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let data = patterned(4 * MIB);
        let ranges = vec![IndexRange::new(0, 2 * MIB), IndexRange::new(2 * MIB, 2 * MIB)];
        let store = Arc::new(MemoryPageBlobStore::new());
        store.inject_transient_put_failures(2);

        let report = upload(context(data, ranges.clone(), store.clone(), 2))
            .await
            .unwrap();
        assert_eq!(report.bytes_uploaded, 4 * MIB);

        let blob = store.blob("images", "disk.vhd").await.unwrap();
        assert_eq!(blob.page_writes.len(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_aborts() {
        let data = patterned(4 * MIB);
        let ranges = vec![IndexRange::new(0, 2 * MIB), IndexRange::new(2 * MIB, 2 * MIB)];
        let store = Arc::new(MemoryPageBlobStore::new());
        store.fail_put_pages(true);

        let err = upload(context(data, ranges, store.clone(), 2))
            .await
            .unwrap_err();
        assert!(matches!(err, PushError::Remote { .. }));
        let blob = store.blob("images", "disk.vhd").await.unwrap();
        assert!(blob.page_writes.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_abort() {
        let data = patterned(2 * MIB);
        let ranges = vec![IndexRange::new(0, 2 * MIB)];
        let store = Arc::new(MemoryPageBlobStore::new());
        store.inject_transient_put_failures(100);

        let err = upload(context(data, ranges, store, 1)).await.unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test]
    async fn test_empty_plan_still_creates_blob() {
        let store = Arc::new(MemoryPageBlobStore::new());
        let report = upload(context(vec![0u8; 2 * MIB as usize], vec![], store.clone(), 8))
            .await
            .unwrap();
        assert_eq!(report.bytes_uploaded, 0);
        assert_eq!(report.put_page_calls, 0);
        let blob = store.blob("images", "disk.vhd").await.unwrap();
        assert_eq!(blob.data.len() as u64, 2 * MIB);
    }

    #[tokio::test]
    async fn test_resume_keeps_existing_blob() {
        let data = patterned(4 * MIB);
        let store = Arc::new(MemoryPageBlobStore::new());
        upload(context(
            data.clone(),
            vec![IndexRange::new(0, 2 * MIB)],
            store.clone(),
            1,
        ))
        .await
        .unwrap();

        let mut ctx = context(data.clone(), vec![IndexRange::new(2 * MIB, 2 * MIB)], store.clone(), 1);
        ctx.resume = true;
        ctx.already_processed_bytes = 2 * MIB;
        let report = upload(ctx).await.unwrap();
        assert_eq!(report.already_processed_bytes, 2 * MIB);
        assert_eq!(report.bytes_uploaded, 2 * MIB);

        let blob = store.blob("images", "disk.vhd").await.unwrap();
        assert_eq!(blob.page_writes.len(), 2);
        assert_eq!(blob.data, data);
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(Progress::percent(0, 0), 100);
        assert_eq!(Progress::percent(1, 4), 25);
        let progress = Progress::new(50, 50);
        progress.add(25);
        assert_eq!(progress.processed.load(Ordering::SeqCst), 75);
        assert_eq!(progress.last_percent.load(Ordering::SeqCst), 75);
    }
}
