//! The push pipeline: local preparation, resume detection, planning,
//! upload and finalization.
//!
//! Cloud setup (credentials, token, resource group, account key) lives in
//! `main`; everything here works against any [`PageBlobStore`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::PushError;
use crate::finalize::finalize;
use crate::image_metadata::{extract, record_from_blob_metadata, ImageMetadata};
use crate::plan::plan_ranges;
use crate::range::{total_length, IndexRange};
use crate::retry::RetryPolicy;
use crate::storage::backend::PageBlobStore;
use crate::upload::{upload, StorageTarget, UploadContext, UploadReport};
use crate::vhd::{validate, DiskStream, ImageStream, OpenError, VhdInfo};

const PAGE_BLOB_TYPE: &str = "PageBlob";

/// A validated local image with its metadata.
pub struct PreparedImage {
    pub path: PathBuf,
    pub info: VhdInfo,
    pub stream: Arc<DiskStream>,
    pub metadata: ImageMetadata,
}

/// Upload tuning for one run.
#[derive(Debug, Clone)]
pub struct PushOptions {
    pub parallelism: usize,
    pub page_size: u64,
    pub resume: bool,
    pub retry: RetryPolicy,
}

/// Outcome of a push.
#[derive(Debug, Clone)]
pub struct PushReport {
    pub upload: UploadReport,
    /// Whether an existing blob was continued.
    pub resumed: bool,
    pub md5_base64: String,
}

/// Validate the image at `path`, open it and compute its metadata.
///
/// Touches nothing remote, so a bad image fails before any container or
/// blob exists.
pub fn prepare_image(path: &Path, max_size: u64) -> Result<PreparedImage, PushError> {
    let path = path
        .canonicalize()
        .map_err(|e| PushError::io(path.display().to_string(), e))?;
    let display_name = path.display().to_string();

    let info = validate(&path, max_size)?;
    let stream = DiskStream::open(&path).map_err(|e| match e {
        OpenError::Io(err) => PushError::io(&display_name, err),
        OpenError::Format(err) => PushError::validation(&display_name, err.to_string()),
    })?;
    let metadata = extract(&path, &stream)?;
    info!(
        "Prepared {} ({:?} disk, {} bytes to upload)",
        display_name, info.disk_type, info.logical_size
    );

    Ok(PreparedImage {
        path,
        info,
        stream: Arc::new(stream),
        metadata,
    })
}

/// Ranges a resumed run may skip, or `None` to start fresh.
async fn resume_point(
    store: &dyn PageBlobStore,
    target: &StorageTarget,
    image: &PreparedImage,
    retry: &RetryPolicy,
) -> Result<Option<Vec<IndexRange>>, PushError> {
    let (container, blob) = (&target.container_name, &target.blob_name);
    let display_name = image.path.display().to_string();

    let props = retry
        .run("get blob properties", || {
            store.get_blob_properties(container, blob)
        })
        .await
        .map_err(|e| PushError::remote(format!("get properties of {}", target), e))?;
    let Some(props) = props else {
        info!("Blob {} does not exist, starting a fresh upload", target);
        return Ok(None);
    };
    if props.blob_type != PAGE_BLOB_TYPE {
        return Err(PushError::validation(
            &display_name,
            format!(
                "cannot resume {}: blob type is {:?}, expected {}",
                target, props.blob_type, PAGE_BLOB_TYPE
            ),
        ));
    }

    let record = record_from_blob_metadata(&props.metadata)
        .map_err(|e| PushError::validation(&display_name, format!("cannot resume {}: {}", target, e)))?
        .ok_or_else(|| {
            PushError::validation(
                &display_name,
                format!("cannot resume {}: blob carries no upload metadata", target),
            )
        })?;
    if !image.metadata.matches(&record) || props.content_length != image.metadata.size_bytes {
        return Err(PushError::validation(
            &display_name,
            format!(
                "cannot resume {}: blob holds {} ({} bytes, MD5 {}), local image is {} bytes, MD5 {}",
                target,
                record.file_meta_data.file_name,
                record.file_meta_data.file_size,
                record.file_meta_data.md5_hash,
                image.metadata.size_bytes,
                image.metadata.md5_base64()
            ),
        ));
    }

    let uploaded = retry
        .run("get page ranges", || store.get_page_ranges(container, blob))
        .await
        .map_err(|e| PushError::remote(format!("get page ranges of {}", target), e))?;
    info!(
        "Resuming {}: {} bytes already uploaded in {} ranges",
        target,
        total_length(&uploaded),
        uploaded.len()
    );
    Ok(Some(uploaded))
}

/// Push a prepared image into `store`.
pub async fn push_prepared(
    store: Arc<dyn PageBlobStore>,
    target: &StorageTarget,
    image: &PreparedImage,
    options: &PushOptions,
) -> Result<PushReport, PushError> {
    let skip = if options.resume {
        resume_point(store.as_ref(), target, image, &options.retry).await?
    } else {
        None
    };
    let resumed = skip.is_some();
    let skip = skip.unwrap_or_default();

    let ranges = plan_ranges(image.stream.as_ref(), &skip, options.page_size)
        .map_err(|e| PushError::io(image.path.display().to_string(), e))?;
    if ranges.is_empty() {
        warn!("Nothing to upload for {}", image.path.display());
    }

    let md5_base64 = image.metadata.md5_base64();
    let stream: Arc<dyn ImageStream> = image.stream.clone();
    let ctx = UploadContext {
        stream,
        ranges,
        already_processed_bytes: total_length(&skip),
        store: store.clone(),
        target: target.clone(),
        parallelism: options.parallelism,
        resume: resumed,
        md5: Some(md5_base64.clone()),
        metadata: image.metadata.to_blob_metadata(),
        retry: options.retry.clone(),
    };
    let md5 = ctx.md5.clone();
    let report = upload(ctx).await?;

    finalize(store.as_ref(), target, md5.as_deref(), &options.retry).await?;

    Ok(PushReport {
        upload: report,
        resumed,
        md5_base64,
    })
}

/// Prepare and push in one step.
pub async fn push_image(
    store: Arc<dyn PageBlobStore>,
    target: &StorageTarget,
    path: &Path,
    max_size: u64,
    options: &PushOptions,
) -> Result<PushReport, PushError> {
    let image = prepare_image(path, max_size)?;
    push_prepared(store, target, &image, options).await
}
