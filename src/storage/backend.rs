//! Abstract page blob store.
//!
//! The upload engine only needs the handful of page blob operations
//! below.  [`super::azure::AzurePageBlobStore`] speaks the Azure Blob REST
//! API.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use crate::range::IndexRange;

/// Largest body accepted by a single Put Page call.
pub const MAX_PUT_PAGE_BYTES: u64 = 4 * 1024 * 1024;

/// Page blob writes must be aligned to this many bytes.
pub const PAGE_ALIGNMENT: u64 = 512;

/// Properties of an existing blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobProperties {
    /// Blob size in bytes.
    pub content_length: u64,
    /// `PageBlob`, `BlockBlob` or `AppendBlob`.
    pub blob_type: String,
    /// Base64 Content-MD5, if set.
    pub content_md5: Option<String>,
    /// User metadata, keys without the `x-ms-meta-` prefix.
    pub metadata: BTreeMap<String, String>,
}

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Async page blob contract.
pub trait PageBlobStore: Send + Sync + 'static {
    /// Create a private container. Returns `false` if it already existed.
    fn create_container_if_absent<'a>(&'a self, container: &'a str) -> StoreFuture<'a, bool>;

    /// Create (or replace) an empty page blob of `size` bytes.
    fn create_page_blob<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        size: u64,
    ) -> StoreFuture<'a, ()>;

    /// Replace the blob's user metadata.
    fn set_blob_metadata<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        metadata: &'a BTreeMap<String, String>,
    ) -> StoreFuture<'a, ()>;

    /// Write `data` at `offset`. Both must be 512-aligned and `data` at
    /// most [`MAX_PUT_PAGE_BYTES`] long.
    fn put_pages<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        offset: u64,
        data: Bytes,
    ) -> StoreFuture<'a, ()>;

    /// Ranges of the blob that hold written pages.
    fn get_page_ranges<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
    ) -> StoreFuture<'a, Vec<IndexRange>>;

    /// Properties of the blob, or `None` if it does not exist.
    fn get_blob_properties<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
    ) -> StoreFuture<'a, Option<BlobProperties>>;

    /// Set the blob's Content-MD5 property (base64 digest).
    fn set_content_md5<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        md5_base64: &'a str,
    ) -> StoreFuture<'a, ()>;
}
