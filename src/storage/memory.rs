//! In-memory page blob store.
//!
//! Containers and blobs are held in a `tokio::sync::RwLock<HashMap<...>>`.
//! Every page write is recorded so callers can check that each range was
//! written exactly once, and failures can be injected to exercise retry
//! and abort paths.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::backend::{
    BlobProperties, PageBlobStore, StoreFuture, MAX_PUT_PAGE_BYTES, PAGE_ALIGNMENT,
};
use crate::errors::RemoteError;
use crate::range::{merge, IndexRange};

const SERVICE: &str = "memory";

/// State of one stored page blob.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlob {
    pub data: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
    pub content_md5: Option<String>,
    /// Every successful Put Page, in arrival order.
    pub page_writes: Vec<IndexRange>,
    /// Reported blob type; `None` reads as `PageBlob`.
    pub blob_type: Option<String>,
}

/// In-memory [`PageBlobStore`].
#[derive(Default)]
pub struct MemoryPageBlobStore {
    /// container -> blob name -> blob.
    containers: tokio::sync::RwLock<HashMap<String, HashMap<String, MemoryBlob>>>,
    /// Number of upcoming Put Page calls that fail with a 503.
    transient_put_failures: AtomicU32,
    /// Fail every Put Page with a 403.
    fail_put_pages: AtomicBool,
    /// Fail Set Blob Properties with a 403.
    fail_set_md5: AtomicBool,
}

impl MemoryPageBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` Put Page calls fail with a transient error.
    pub fn inject_transient_put_failures(&self, n: u32) {
        self.transient_put_failures.store(n, Ordering::SeqCst);
    }

    /// Make every Put Page call fail permanently.
    pub fn fail_put_pages(&self, fail: bool) {
        self.fail_put_pages.store(fail, Ordering::SeqCst);
    }

    /// Make Set Blob Properties fail permanently.
    pub fn fail_set_content_md5(&self, fail: bool) {
        self.fail_set_md5.store(fail, Ordering::SeqCst);
    }

    pub async fn container_count(&self) -> usize {
        self.containers.read().await.len()
    }

    /// Snapshot of a stored blob.
    pub async fn blob(&self, container: &str, blob: &str) -> Option<MemoryBlob> {
        self.containers
            .read()
            .await
            .get(container)
            .and_then(|c| c.get(blob))
            .cloned()
    }

    /// Overwrite the type reported for an existing blob.
    pub async fn set_blob_type(
        &self,
        container: &str,
        blob: &str,
        blob_type: &str,
    ) -> anyhow::Result<()> {
        let blob_type = blob_type.to_string();
        self.with_blob("set blob type", container, blob, move |b| {
            b.blob_type = Some(blob_type);
            Ok(())
        })
        .await
    }

    fn rejected(operation: &'static str, status: u16, body: &str) -> anyhow::Error {
        RemoteError {
            service: SERVICE,
            operation,
            status: Some(status),
            body: body.to_string(),
        }
        .into()
    }

    async fn with_blob<T>(
        &self,
        operation: &'static str,
        container: &str,
        blob: &str,
        f: impl FnOnce(&mut MemoryBlob) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut containers = self.containers.write().await;
        let c = containers
            .get_mut(container)
            .ok_or_else(|| Self::rejected(operation, 404, "ContainerNotFound"))?;
        let b = c
            .get_mut(blob)
            .ok_or_else(|| Self::rejected(operation, 404, "BlobNotFound"))?;
        f(b)
    }

    async fn mem_put_pages(
        &self,
        container: &str,
        blob: &str,
        offset: u64,
        data: Bytes,
    ) -> anyhow::Result<()> {
        if self.fail_put_pages.load(Ordering::SeqCst) {
            return Err(Self::rejected("put page", 403, "AuthorizationFailure"));
        }
        let pending = self.transient_put_failures.load(Ordering::SeqCst);
        if pending > 0
            && self
                .transient_put_failures
                .compare_exchange(pending, pending - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(Self::rejected("put page", 503, "ServerBusy"));
        }

        let len = data.len() as u64;
        if len == 0
            || len > MAX_PUT_PAGE_BYTES
            || offset % PAGE_ALIGNMENT != 0
            || len % PAGE_ALIGNMENT != 0
        {
            return Err(Self::rejected("put page", 400, "InvalidPageRange"));
        }

        self.with_blob("put page", container, blob, |b| {
            let end = offset + len;
            if end > b.data.len() as u64 {
                return Err(Self::rejected("put page", 416, "InvalidPageRange"));
            }
            b.data[offset as usize..end as usize].copy_from_slice(&data);
            b.page_writes.push(IndexRange::new(offset, len));
            Ok(())
        })
        .await
    }
}

impl PageBlobStore for MemoryPageBlobStore {
    fn create_container_if_absent<'a>(&'a self, container: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut containers = self.containers.write().await;
            if containers.contains_key(container) {
                return Ok(false);
            }
            containers.insert(container.to_string(), HashMap::new());
            Ok(true)
        })
    }

    fn create_page_blob<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        size: u64,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if size % PAGE_ALIGNMENT != 0 {
                return Err(Self::rejected("create page blob", 400, "InvalidHeaderValue"));
            }
            let mut containers = self.containers.write().await;
            let c = containers
                .get_mut(container)
                .ok_or_else(|| Self::rejected("create page blob", 404, "ContainerNotFound"))?;
            c.insert(
                blob.to_string(),
                MemoryBlob {
                    data: vec![0u8; size as usize],
                    ..MemoryBlob::default()
                },
            );
            Ok(())
        })
    }

    fn set_blob_metadata<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        metadata: &'a BTreeMap<String, String>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.with_blob("set blob metadata", container, blob, move |b| {
            b.metadata = metadata.clone();
            Ok(())
        }))
    }

    fn put_pages<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        offset: u64,
        data: Bytes,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.mem_put_pages(container, blob, offset, data))
    }

    fn get_page_ranges<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
    ) -> StoreFuture<'a, Vec<IndexRange>> {
        Box::pin(self.with_blob("get page ranges", container, blob, |b| {
            Ok(merge(&b.page_writes))
        }))
    }

    fn get_blob_properties<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
    ) -> StoreFuture<'a, Option<BlobProperties>> {
        Box::pin(async move {
            Ok(self.blob(container, blob).await.map(|b| BlobProperties {
                content_length: b.data.len() as u64,
                blob_type: b.blob_type.unwrap_or_else(|| "PageBlob".to_string()),
                content_md5: b.content_md5,
                metadata: b.metadata,
            }))
        })
    }

    fn set_content_md5<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        md5_base64: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if self.fail_set_md5.load(Ordering::SeqCst) {
                return Err(Self::rejected(
                    "set blob properties",
                    403,
                    "AuthorizationFailure",
                ));
            }
            self.with_blob("set blob properties", container, blob, |b| {
                b.content_md5 = Some(md5_base64.to_string());
                Ok(())
            })
            .await
        })
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::is_transient;

    #[tokio::test]
    async fn test_create_container_twice() {
        let store = MemoryPageBlobStore::new();
        assert!(store.create_container_if_absent("c").await.unwrap());
        assert!(!store.create_container_if_absent("c").await.unwrap());
        assert_eq!(store.container_count().await, 1);
    }

    #[tokio::test]
    async fn test_blob_requires_container() {
        let store = MemoryPageBlobStore::new();
        let err = store.create_page_blob("c", "b", 1024).await.unwrap_err();
        assert!(!is_transient(&err));
    }

    #[tokio::test]
    async fn test_put_pages_and_ranges() {
        let store = MemoryPageBlobStore::new();
        store.create_container_if_absent("c").await.unwrap();
        store.create_page_blob("c", "b", 4096).await.unwrap();

        store
            .put_pages("c", "b", 512, Bytes::from(vec![7u8; 1024]))
            .await
            .unwrap();
        store
            .put_pages("c", "b", 1536, Bytes::from(vec![8u8; 512]))
            .await
            .unwrap();

        let ranges = store.get_page_ranges("c", "b").await.unwrap();
        assert_eq!(ranges, vec![IndexRange::new(512, 1536)]);

        let blob = store.blob("c", "b").await.unwrap();
        assert_eq!(blob.page_writes.len(), 2);
        assert_eq!(&blob.data[512..1536], &[7u8; 1024][..]);
        assert_eq!(&blob.data[1536..2048], &[8u8; 512][..]);
        assert!(blob.data[..512].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_put_pages_validation() {
        let store = MemoryPageBlobStore::new();
        store.create_container_if_absent("c").await.unwrap();
        store.create_page_blob("c", "b", 4096).await.unwrap();

        assert!(store
            .put_pages("c", "b", 100, Bytes::from(vec![0u8; 512]))
            .await
            .is_err());
        assert!(store
            .put_pages("c", "b", 0, Bytes::from(vec![0u8; 100]))
            .await
            .is_err());
        assert!(store
            .put_pages("c", "b", 4096, Bytes::from(vec![0u8; 512]))
            .await
            .is_err());
        assert!(store.create_page_blob("c", "odd", 1000).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_transient_failures() {
        let store = MemoryPageBlobStore::new();
        store.create_container_if_absent("c").await.unwrap();
        store.create_page_blob("c", "b", 1024).await.unwrap();
        store.inject_transient_put_failures(2);

        for _ in 0..2 {
            let err = store
                .put_pages("c", "b", 0, Bytes::from(vec![1u8; 512]))
                .await
                .unwrap_err();
            assert!(is_transient(&err));
        }
        store
            .put_pages("c", "b", 0, Bytes::from(vec![1u8; 512]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_properties_metadata_and_md5() {
        let store = MemoryPageBlobStore::new();
        assert!(store.get_blob_properties("c", "b").await.unwrap().is_none());

        store.create_container_if_absent("c").await.unwrap();
        store.create_page_blob("c", "b", 512).await.unwrap();
        let mut meta = BTreeMap::new();
        meta.insert("k".to_string(), "v".to_string());
        store.set_blob_metadata("c", "b", &meta).await.unwrap();
        store.set_content_md5("c", "b", "abc=").await.unwrap();

        let props = store.get_blob_properties("c", "b").await.unwrap().unwrap();
        assert_eq!(props.content_length, 512);
        assert_eq!(props.metadata, meta);
        assert_eq!(props.content_md5.as_deref(), Some("abc="));

        store.fail_set_content_md5(true);
        assert!(store.set_content_md5("c", "b", "x").await.is_err());
    }
}
