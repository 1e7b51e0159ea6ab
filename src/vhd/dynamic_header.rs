//! Dynamic disk header and block allocation table.

use byteorder::{BigEndian, ByteOrder};

use super::{checksum, VhdFormatError};

pub const DYNAMIC_HEADER_SIZE: usize = 1024;

/// BAT entry of a block that has never been written.
pub const UNALLOCATED: u32 = 0xFFFF_FFFF;

const COOKIE: &[u8; 8] = b"cxsparse";
const CHECKSUM_OFFSET: usize = 36;

#[derive(Debug, Clone)]
pub struct DynamicHeader {
    pub table_offset: u64,
    pub max_table_entries: u32,
    pub block_size: u32,
}

impl DynamicHeader {
    pub fn decode(buf: &[u8; DYNAMIC_HEADER_SIZE]) -> Result<Self, VhdFormatError> {
        if &buf[0..8] != COOKIE {
            return Err(VhdFormatError::new(
                "dynamic header cookie is not 'cxsparse'",
            ));
        }

        let stored = BigEndian::read_u32(&buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]);
        let computed = checksum(buf, CHECKSUM_OFFSET);
        if stored != computed {
            return Err(VhdFormatError::new(format!(
                "dynamic header checksum mismatch, computed 0x{:08X} but the header says 0x{:08X}",
                computed, stored
            )));
        }

        let block_size = BigEndian::read_u32(&buf[32..36]);
        if block_size == 0 || block_size % 512 != 0 {
            return Err(VhdFormatError::new(format!(
                "block size {} is not a positive multiple of 512",
                block_size
            )));
        }

        Ok(Self {
            table_offset: BigEndian::read_u64(&buf[16..24]),
            max_table_entries: BigEndian::read_u32(&buf[28..32]),
            block_size,
        })
    }

    /// Bytes of sector bitmap preceding each data block, padded to a sector.
    pub fn bitmap_size(&self) -> u64 {
        let sectors = u64::from(self.block_size) / 512;
        let bytes = (sectors + 7) / 8;
        (bytes + 511) / 512 * 512
    }
}

/// Decode the big-endian BAT.
pub fn decode_bat(buf: &[u8], entries: usize) -> Vec<u32> {
    let mut bat = vec![0u32; entries];
    BigEndian::read_u32_into(&buf[..entries * 4], &mut bat);
    bat
}

#[cfg(test)]
pub(crate) fn build(table_offset: u64, max_table_entries: u32, block_size: u32) -> [u8; DYNAMIC_HEADER_SIZE] {
    let mut buf = [0u8; DYNAMIC_HEADER_SIZE];
    buf[0..8].copy_from_slice(COOKIE);
    BigEndian::write_u64(&mut buf[8..16], u64::MAX);
    BigEndian::write_u64(&mut buf[16..24], table_offset);
    BigEndian::write_u32(&mut buf[24..28], 0x0001_0000);
    BigEndian::write_u32(&mut buf[28..32], max_table_entries);
    BigEndian::write_u32(&mut buf[32..36], block_size);
    let sum = checksum(&buf, CHECKSUM_OFFSET);
    BigEndian::write_u32(&mut buf[36..40], sum);
    buf
}
