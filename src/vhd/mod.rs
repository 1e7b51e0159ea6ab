//! VHD image access.
//!
//! Only what the upload needs: footer and dynamic header parsing,
//! structural and size validation, and [`DiskStream`], which presents any
//! supported VHD as the byte stream of its fixed-disk equivalent (the
//! only form a page blob can hold).

pub mod dynamic_header;
pub mod footer;
pub mod stream;

use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::errors::PushError;

pub use stream::{DiskStream, ImageStream, OpenError};

/// Page blobs are capped at 8 TiB.
pub const PAGE_BLOB_MAX_SIZE: u64 = 8 * 1024 * 1024 * 1024 * 1024;

const ONE_MIB: u64 = 1024 * 1024;

/// Malformed VHD structure.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct VhdFormatError(String);

impl VhdFormatError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// VHD disk type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DiskType {
    Fixed = 2,
    Dynamic = 3,
    Differencing = 4,
}

impl TryFrom<u32> for DiskType {
    type Error = VhdFormatError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(DiskType::Fixed),
            3 => Ok(DiskType::Dynamic),
            4 => Ok(DiskType::Differencing),
            other => Err(VhdFormatError::new(format!("unknown disk type {}", other))),
        }
    }
}

/// One's complement of the byte sum, skipping the 4-byte checksum field.
pub(crate) fn checksum(buf: &[u8], checksum_offset: usize) -> u32 {
    let sum = buf
        .iter()
        .enumerate()
        .filter(|(i, _)| !(checksum_offset..checksum_offset + 4).contains(i))
        .fold(0u32, |acc, (_, b)| acc.wrapping_add(u32::from(*b)));
    !sum
}

/// Summary of a validated image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdInfo {
    pub disk_type: DiskType,
    /// Size of the virtual disk, excluding the footer.
    pub virtual_size: u64,
    /// Size of the fixed-form stream that will be uploaded.
    pub logical_size: u64,
}

/// Check that `path` is a well-formed VHD small enough for a page blob.
///
/// Structural checks come from opening the [`DiskStream`]. Size checks
/// require a whole number of MiB of virtual disk and a logical size no
/// larger than `max_size`.
pub fn validate(path: &Path, max_size: u64) -> Result<VhdInfo, PushError> {
    let display_name = path.display().to_string();
    let stream = DiskStream::open(path).map_err(|e| match e {
        OpenError::Io(err) => PushError::io(&display_name, err),
        OpenError::Format(err) => PushError::validation(&display_name, err.to_string()),
    })?;

    let info = VhdInfo {
        disk_type: stream.disk_type(),
        virtual_size: stream.virtual_size(),
        logical_size: stream.size(),
    };
    debug!("Validated structure of {}: {:?}", display_name, info);

    validate_size(&display_name, &info, max_size)?;
    Ok(info)
}

fn validate_size(path: &str, info: &VhdInfo, max_size: u64) -> Result<(), PushError> {
    if info.virtual_size == 0 {
        return Err(PushError::validation(path, "virtual disk size is zero"));
    }
    if info.virtual_size % ONE_MIB != 0 {
        return Err(PushError::validation(
            path,
            format!(
                "virtual disk size {} bytes is not a whole number of MiB",
                info.virtual_size
            ),
        ));
    }
    let ceiling = max_size.min(PAGE_BLOB_MAX_SIZE);
    if info.logical_size > ceiling {
        return Err(PushError::validation(
            path,
            format!(
                "image size {} bytes exceeds the page blob limit of {} bytes",
                info.logical_size, ceiling
            ),
        ));
    }
    Ok(())
}
