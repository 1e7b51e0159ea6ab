//! Positional read access to an image as its fixed-disk byte stream.
//!
//! Fixed disks are read straight from the file.  Dynamic disks are
//! expanded through the BAT: unallocated blocks read as zeros and the
//! stream ends with a fixed-disk footer.  Reads are positional and take
//! `&self`, so upload workers share one stream without a lock.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

use super::dynamic_header::{decode_bat, DynamicHeader, DYNAMIC_HEADER_SIZE, UNALLOCATED};
use super::footer::{Footer, FOOTER_SIZE};
use super::{DiskType, VhdFormatError};
use crate::range::{merge, IndexRange};

/// Read-only, seekable view of an image.
pub trait ImageStream: Send + Sync {
    /// Logical stream size in bytes.
    fn size(&self) -> u64;

    /// Fill `buf` from `offset`. Reading past [`size`](Self::size) fails.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Ranges that may hold data. Everything else is known to be zero.
    fn extents(&self) -> Vec<IndexRange> {
        vec![IndexRange::new(0, self.size())]
    }
}

/// Error opening a [`DiskStream`].
#[derive(Debug, Error)]
pub enum OpenError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Format(#[from] VhdFormatError),
}

enum Layout {
    Fixed,
    Dynamic {
        bat: Vec<u32>,
        block_size: u64,
        bitmap_size: u64,
    },
}

/// A VHD file presented as its fixed-disk stream.
pub struct DiskStream {
    file: File,
    footer: Footer,
    logical_size: u64,
    fixed_footer: [u8; FOOTER_SIZE],
    layout: Layout,
}

impl DiskStream {
    pub fn open(path: &Path) -> Result<Self, OpenError> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < FOOTER_SIZE as u64 {
            return Err(VhdFormatError::new(format!(
                "file is {} bytes, smaller than a VHD footer",
                file_len
            ))
            .into());
        }

        let mut raw = [0u8; FOOTER_SIZE];
        file.seek(SeekFrom::Start(file_len - FOOTER_SIZE as u64))?;
        file.read_exact(&mut raw)?;
        let footer = Footer::decode(&raw)?;
        let logical_size = footer
            .current_size
            .checked_add(FOOTER_SIZE as u64)
            .ok_or_else(|| {
                VhdFormatError::new(format!(
                    "footer declares an impossible disk size of {} bytes",
                    footer.current_size
                ))
            })?;

        let layout = match footer.disk_type {
            DiskType::Fixed => {
                if file_len != logical_size {
                    return Err(VhdFormatError::new(format!(
                        "fixed disk footer declares {} bytes of data but the file holds {}",
                        footer.current_size,
                        file_len - FOOTER_SIZE as u64
                    ))
                    .into());
                }
                Layout::Fixed
            }
            DiskType::Dynamic => Self::read_dynamic_layout(&mut file, &footer, file_len)?,
            DiskType::Differencing => {
                return Err(VhdFormatError::new("differencing disks are not supported").into());
            }
        };

        let fixed_footer = footer.to_fixed();
        Ok(Self {
            file,
            footer,
            logical_size,
            fixed_footer,
            layout,
        })
    }

    fn read_dynamic_layout(
        file: &mut File,
        footer: &Footer,
        file_len: u64,
    ) -> Result<Layout, OpenError> {
        let header_end = footer.data_offset.checked_add(DYNAMIC_HEADER_SIZE as u64);
        if header_end.map_or(true, |end| end > file_len) {
            return Err(VhdFormatError::new(format!(
                "dynamic header offset {} lies outside the file",
                footer.data_offset
            ))
            .into());
        }

        let mut raw = [0u8; DYNAMIC_HEADER_SIZE];
        file.seek(SeekFrom::Start(footer.data_offset))?;
        file.read_exact(&mut raw)?;
        let header = DynamicHeader::decode(&raw)?;

        let block_size = u64::from(header.block_size);
        let entries = header.max_table_entries as u64;
        if entries * block_size < footer.current_size {
            return Err(VhdFormatError::new(format!(
                "BAT covers {} bytes but the disk is {} bytes",
                entries * block_size,
                footer.current_size
            ))
            .into());
        }

        let table_bytes = entries * 4;
        let table_end = header.table_offset.checked_add(table_bytes);
        if table_end.map_or(true, |end| end > file_len) {
            return Err(VhdFormatError::new("BAT lies outside the file").into());
        }
        let mut table = vec![0u8; table_bytes as usize];
        file.seek(SeekFrom::Start(header.table_offset))?;
        file.read_exact(&mut table)?;
        let bat = decode_bat(&table, entries as usize);

        let bitmap_size = header.bitmap_size();
        for (index, &sector) in bat.iter().enumerate() {
            if sector == UNALLOCATED {
                continue;
            }
            let end = u64::from(sector) * 512 + bitmap_size + block_size;
            if end > file_len {
                return Err(VhdFormatError::new(format!(
                    "BAT entry {} points past the end of the file",
                    index
                ))
                .into());
            }
        }

        Ok(Layout::Dynamic {
            bat,
            block_size,
            bitmap_size,
        })
    }

    pub fn disk_type(&self) -> DiskType {
        self.footer.disk_type
    }

    /// Size of the virtual disk, excluding the footer.
    pub fn virtual_size(&self) -> u64 {
        self.footer.current_size
    }

    #[cfg(unix)]
    fn read_file(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(windows)]
    fn read_file(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        let mut done = 0usize;
        while done < buf.len() {
            let n = self.file.seek_read(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            done += n;
        }
        Ok(())
    }

    /// Read disk bytes `[offset, offset + buf.len())`, all below the footer.
    fn read_disk(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        match &self.layout {
            Layout::Fixed => self.read_file(offset, buf),
            Layout::Dynamic {
                bat,
                block_size,
                bitmap_size,
            } => {
                let mut done = 0usize;
                while done < buf.len() {
                    let pos = offset + done as u64;
                    let block = (pos / block_size) as usize;
                    let within = pos % block_size;
                    let n = ((block_size - within) as usize).min(buf.len() - done);
                    let chunk = &mut buf[done..done + n];
                    match bat.get(block).copied() {
                        Some(sector) if sector != UNALLOCATED => {
                            let at = u64::from(sector) * 512 + bitmap_size + within;
                            self.read_file(at, chunk)?;
                        }
                        _ => chunk.fill(0),
                    }
                    done += n;
                }
                Ok(())
            }
        }
    }
}

impl ImageStream for DiskStream {
    fn size(&self) -> u64 {
        self.logical_size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let end = offset.saturating_add(buf.len() as u64);
        if end > self.size() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read [{}, {}) past end of {}-byte stream", offset, end, self.size()),
            ));
        }

        let disk_end = self.footer.current_size;
        let split = if offset >= disk_end {
            0
        } else {
            (disk_end - offset).min(buf.len() as u64) as usize
        };
        let (disk_part, footer_part) = buf.split_at_mut(split);
        if !disk_part.is_empty() {
            self.read_disk(offset, disk_part)?;
        }
        if !footer_part.is_empty() {
            let start = (offset + split as u64 - disk_end) as usize;
            footer_part.copy_from_slice(&self.fixed_footer[start..start + footer_part.len()]);
        }
        Ok(())
    }

    fn extents(&self) -> Vec<IndexRange> {
        let disk_end = self.footer.current_size;
        let footer = IndexRange::new(disk_end, FOOTER_SIZE as u64);
        match &self.layout {
            Layout::Fixed => vec![IndexRange::new(0, self.size())],
            Layout::Dynamic {
                bat, block_size, ..
            } => {
                let mut ranges: Vec<IndexRange> = bat
                    .iter()
                    .enumerate()
                    .filter(|(_, sector)| **sector != UNALLOCATED)
                    .map(|(i, _)| i as u64 * block_size)
                    .filter(|start| *start < disk_end)
                    .map(|start| IndexRange::new(start, (*block_size).min(disk_end - start)))
                    .collect();
                ranges.push(footer);
                merge(&ranges)
            }
        }
    }
}

/// Image held in memory, for planner and upload tests.
#[cfg(test)]
pub(crate) struct MemoryImage {
    pub data: Vec<u8>,
}

#[cfg(test)]
impl ImageStream for MemoryImage {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }
}

/// Writers for small VHD files used across the test suite.
#[cfg(test)]
pub(crate) mod test_images {
    use super::super::{dynamic_header, footer, DiskType};
    use std::path::{Path, PathBuf};

    /// Fixed VHD holding `data`.
    pub fn write_fixed(dir: &Path, data: &[u8]) -> PathBuf {
        let path = dir.join("fixed.vhd");
        let mut bytes = data.to_vec();
        bytes.extend_from_slice(&footer::build(DiskType::Fixed, data.len() as u64, u64::MAX));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    /// Dynamic VHD with `blocks` blocks of `block_size`; only the listed
    /// `(block index, contents)` pairs are allocated.
    pub fn write_dynamic(
        dir: &Path,
        blocks: usize,
        block_size: usize,
        allocated: &[(usize, Vec<u8>)],
    ) -> PathBuf {
        let path = dir.join("dynamic.vhd");
        let current_size = (blocks * block_size) as u64;
        let foot = footer::build(DiskType::Dynamic, current_size, 512);
        let table_offset = 512 + 1024;
        let header = dynamic_header::build(table_offset, blocks as u32, block_size as u32);
        let table_size = (blocks * 4 + 511) / 512 * 512;
        let bitmap_size = ((block_size / 512 + 7) / 8 + 511) / 512 * 512;

        let mut bat = vec![0xFFu8; table_size];
        let mut body = Vec::new();
        let data_start = table_offset as usize + table_size;
        for (index, contents) in allocated {
            assert_eq!(contents.len(), block_size);
            let sector = ((data_start + body.len()) / 512) as u32;
            bat[index * 4..index * 4 + 4].copy_from_slice(&sector.to_be_bytes());
            body.extend(std::iter::repeat(0xFFu8).take(bitmap_size));
            body.extend_from_slice(contents);
        }

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&foot);
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&bat);
        bytes.extend_from_slice(&body);
        bytes.extend_from_slice(&foot);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    /// Differencing VHD footer with no usable body.
    pub fn write_differencing(dir: &Path) -> PathBuf {
        let path = dir.join("diff.vhd");
        std::fs::write(
            &path,
            footer::build(DiskType::Differencing, 1024 * 1024, 512),
        )
        .unwrap();
        path
    }
}
