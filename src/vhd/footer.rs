//! VHD hard disk footer.
//!
//! Every VHD ends with a 512-byte big-endian footer.  Dynamic and
//! differencing disks also keep a copy at offset 0.

use byteorder::{BigEndian, ByteOrder};

use super::{checksum, DiskType, VhdFormatError};

pub const FOOTER_SIZE: usize = 512;

const COOKIE: &[u8; 8] = b"conectix";
const CHECKSUM_OFFSET: usize = 64;
const DATA_OFFSET_OFFSET: usize = 16;
const DISK_TYPE_OFFSET: usize = 60;

/// The footer fields the upload relies on, plus the raw bytes they came from.
#[derive(Debug, Clone)]
pub struct Footer {
    pub data_offset: u64,
    pub current_size: u64,
    pub disk_type: DiskType,
    raw: [u8; FOOTER_SIZE],
}

impl Footer {
    pub fn decode(buf: &[u8; FOOTER_SIZE]) -> Result<Self, VhdFormatError> {
        if &buf[0..8] != COOKIE {
            return Err(VhdFormatError::new("footer cookie is not 'conectix'"));
        }

        let stored = BigEndian::read_u32(&buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]);
        let computed = checksum(buf, CHECKSUM_OFFSET);
        if stored != computed {
            return Err(VhdFormatError::new(format!(
                "footer checksum mismatch, computed 0x{:08X} but the footer says 0x{:08X}",
                computed, stored
            )));
        }

        let disk_type = DiskType::try_from(BigEndian::read_u32(
            &buf[DISK_TYPE_OFFSET..DISK_TYPE_OFFSET + 4],
        ))?;

        Ok(Self {
            data_offset: BigEndian::read_u64(&buf[DATA_OFFSET_OFFSET..DATA_OFFSET_OFFSET + 8]),
            current_size: BigEndian::read_u64(&buf[48..56]),
            disk_type,
            raw: *buf,
        })
    }

    /// Footer of the equivalent fixed disk.
    ///
    /// A page blob VHD must be fixed, so dynamic images are streamed as
    /// their fixed expansion and end with this footer instead.
    pub fn to_fixed(&self) -> [u8; FOOTER_SIZE] {
        let mut out = self.raw;
        BigEndian::write_u64(
            &mut out[DATA_OFFSET_OFFSET..DATA_OFFSET_OFFSET + 8],
            u64::MAX,
        );
        BigEndian::write_u32(
            &mut out[DISK_TYPE_OFFSET..DISK_TYPE_OFFSET + 4],
            DiskType::Fixed as u32,
        );
        let sum = checksum(&out, CHECKSUM_OFFSET);
        BigEndian::write_u32(&mut out[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4], sum);
        out
    }
}

/// Build a valid footer. Used to fabricate images in tests.
#[cfg(test)]
pub(crate) fn build(disk_type: DiskType, current_size: u64, data_offset: u64) -> [u8; FOOTER_SIZE] {
    let mut buf = [0u8; FOOTER_SIZE];
    buf[0..8].copy_from_slice(COOKIE);
    BigEndian::write_u32(&mut buf[8..12], 2);
    BigEndian::write_u32(&mut buf[12..16], 0x0001_0000);
    BigEndian::write_u64(&mut buf[16..24], data_offset);
    buf[28..32].copy_from_slice(b"vhdp");
    BigEndian::write_u64(&mut buf[40..48], current_size);
    BigEndian::write_u64(&mut buf[48..56], current_size);
    BigEndian::write_u32(&mut buf[60..64], disk_type as u32);
    let sum = checksum(&buf, CHECKSUM_OFFSET);
    BigEndian::write_u32(&mut buf[64..68], sum);
    buf
}
