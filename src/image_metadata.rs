//! Local image metadata: size, MD5 digest and the blob metadata record.
//!
//! The record is stored on the blob under [`METADATA_KEY`] as base64
//! JSON.  A later `--resume` run reads it back and only continues an
//! upload whose size and digest match the local image.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::errors::PushError;
use crate::vhd::ImageStream;

/// Blob metadata key holding the serialized record.
pub const METADATA_KEY: &str = "diskmetadata";

/// Read granularity when hashing.
const HASH_CHUNK: usize = 4 * 1024 * 1024;

/// Metadata computed once from the local image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    pub file_name: String,
    /// Logical (uploaded) size in bytes.
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
    /// MD5 of the logical stream.
    pub md5: [u8; 16],
}

/// Serialized form stored on the blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskMetadataRecord {
    pub file_meta_data: FileMetadataRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadataRecord {
    pub file_name: String,
    pub file_size: u64,
    pub last_modified_time: String,
    /// Base64 MD5.
    pub md5_hash: String,
}

impl ImageMetadata {
    /// Content-MD5 header form of the digest.
    pub fn md5_base64(&self) -> String {
        BASE64_STANDARD.encode(self.md5)
    }

    pub fn record(&self) -> DiskMetadataRecord {
        DiskMetadataRecord {
            file_meta_data: FileMetadataRecord {
                file_name: self.file_name.clone(),
                file_size: self.size_bytes,
                last_modified_time: self.last_modified.to_rfc3339(),
                md5_hash: self.md5_base64(),
            },
        }
    }

    /// Key/value map written onto the blob before transfer starts.
    pub fn to_blob_metadata(&self) -> BTreeMap<String, String> {
        let json = serde_json::to_vec(&self.record()).unwrap_or_default();
        let mut map = BTreeMap::new();
        map.insert(METADATA_KEY.to_string(), BASE64_STANDARD.encode(json));
        map
    }

    /// Whether a blob tagged with `record` holds (part of) this image.
    pub fn matches(&self, record: &DiskMetadataRecord) -> bool {
        record.file_meta_data.file_size == self.size_bytes
            && record.file_meta_data.md5_hash == self.md5_base64()
    }
}

/// Decode the record from blob metadata. `Ok(None)` if the key is absent.
pub fn record_from_blob_metadata(
    metadata: &BTreeMap<String, String>,
) -> anyhow::Result<Option<DiskMetadataRecord>> {
    let Some(encoded) = metadata.get(METADATA_KEY) else {
        return Ok(None);
    };
    let json = BASE64_STANDARD
        .decode(encoded)
        .map_err(|e| anyhow::anyhow!("{} is not valid base64: {}", METADATA_KEY, e))?;
    let record = serde_json::from_slice(&json)
        .map_err(|e| anyhow::anyhow!("{} is not a valid record: {}", METADATA_KEY, e))?;
    Ok(Some(record))
}

/// Compute metadata for the image at `path`, hashing the logical `stream`.
pub fn extract(path: &Path, stream: &dyn ImageStream) -> Result<ImageMetadata, PushError> {
    let display_name = path.display().to_string();
    let fs_meta = std::fs::metadata(path).map_err(|e| PushError::io(&display_name, e))?;
    let last_modified: DateTime<Utc> = fs_meta
        .modified()
        .map(DateTime::from)
        .unwrap_or_else(|_| Utc::now());

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| display_name.clone());

    let size = stream.size();
    debug!("Hashing {} ({} bytes)", display_name, size);

    let mut hasher = Md5::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    let mut offset = 0u64;
    while offset < size {
        let n = (size - offset).min(HASH_CHUNK as u64) as usize;
        stream
            .read_at(offset, &mut buf[..n])
            .map_err(|e| PushError::io(&display_name, e))?;
        hasher.update(&buf[..n]);
        offset += n as u64;
    }
    let mut md5 = [0u8; 16];
    md5.copy_from_slice(&hasher.finalize());

    info!(
        "Image {}: {} bytes, MD5 {}",
        file_name,
        size,
        hex::encode(md5)
    );

    Ok(ImageMetadata {
        file_name,
        size_bytes: size,
        last_modified,
        md5,
    })
}
