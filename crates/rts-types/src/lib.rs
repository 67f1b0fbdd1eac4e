#![forbid(unsafe_code)]
//! Shared newtypes, format constants and byte-level field readers.
//!
//! Realtime metadata mixes several block-sized units that are all `u64` on
//! disk: data-device blocks, realtime-device blocks, realtime extents and
//! logical blocks inside a metadata file. Each gets its own wrapper so the
//! arithmetic in the scrubber cannot silently mix them.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Superblock magic, `XFSB`.
pub const SB_MAGIC: u32 = 0x5846_5342;
/// The primary superblock occupies the first sector of the data device.
pub const SB_SECTOR_SIZE: usize = 512;

/// Realtime bitmap block magic, `BMPZ`.
pub const RTBITMAP_MAGIC: u32 = 0x424D_505A;
/// Realtime summary block magic, `SUMY`.
pub const RTSUMMARY_MAGIC: u32 = 0x5355_4D59;

/// Bytes per bitmap or summary word.
pub const RT_WORD_SIZE: usize = 4;
/// log2 of [`RT_WORD_SIZE`].
pub const RT_WORD_LOG: u32 = 2;
/// Bits per bitmap word.
pub const RT_WORD_BITS: u32 = 32;

pub const MIN_BLOCK_SIZE: u32 = 512;
pub const MAX_BLOCK_SIZE: u32 = 65536;

/// Block number on the data device (where metadata files live).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Block number on the realtime device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RtBlock(pub u64);

/// Realtime extent number (allocation unit of `rextsize` blocks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RtExtent(pub u64);

/// Logical block offset inside a metadata file's data fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileBlock(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Filesystem UUID as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VolumeUuid(pub [u8; 16]);

impl VolumeUuid {
    pub const NIL: Self = Self([0; 16]);
}

/// Validated block size (must be a power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "blocksize",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Block size as a `usize` for buffer arithmetic.
    #[must_use]
    pub fn as_usize(self) -> usize {
        // 65536 fits every supported target.
        self.0 as usize
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Mask of the sub-block bits of a byte offset.
    #[must_use]
    pub fn mask(self) -> u64 {
        u64::from(self.0) - 1
    }

    /// Convert a byte offset to a file block (truncating).
    #[must_use]
    pub fn byte_to_block(self, byte_offset: u64) -> FileBlock {
        FileBlock(byte_offset >> self.shift())
    }

    /// Number of blocks needed to hold `bytes` (rounding up).
    #[must_use]
    pub fn blocks_for_bytes(self, bytes: u64) -> u64 {
        bytes.div_ceil(u64::from(self.0))
    }

    /// Convert a block count to bytes, `None` on overflow.
    #[must_use]
    pub fn blocks_to_bytes(self, blocks: u64) -> Option<u64> {
        blocks.checked_mul(u64::from(self.0))
    }

    #[must_use]
    pub fn is_aligned(self, bytes: u64) -> bool {
        bytes & self.mask() == 0
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    let actual = data.len().saturating_sub(offset);
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual,
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn read_be_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    read_fixed::<2>(data, offset).map(u16::from_be_bytes)
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    read_fixed::<4>(data, offset).map(u32::from_be_bytes)
}

#[inline]
pub fn read_be_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    read_fixed::<8>(data, offset).map(u64::from_be_bytes)
}

/// Checksums are stored little-endian even inside big-endian structures.
#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    read_fixed::<4>(data, offset).map(u32::from_le_bytes)
}

#[inline]
pub fn write_fixed(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

#[inline]
pub fn write_be_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    write_fixed(data, offset, &value.to_be_bytes())
}

#[inline]
pub fn write_be_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    write_fixed(data, offset, &value.to_be_bytes())
}

#[inline]
pub fn write_be_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    write_fixed(data, offset, &value.to_be_bytes())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    write_fixed(data, offset, &value.to_le_bytes())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RtBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RtExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FileBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for VolumeUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13],
            b[14], b[15]
        )
    }
}

impl FileBlock {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, blocks: u64) -> Option<Self> {
        self.0.checked_add(blocks).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x12_u8, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0];
        assert_eq!(read_be_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_be_u32(&bytes, 0).expect("u32"), 0x1234_5678);
        assert_eq!(read_be_u32(&bytes, 4).expect("u32"), 0x9ABC_DEF0);
        assert_eq!(read_be_u64(&bytes, 0).expect("u64"), 0x1234_5678_9ABC_DEF0);
        assert_eq!(read_le_u32(&bytes, 0).expect("le32"), 0x7856_3412);
    }

    #[test]
    fn test_read_out_of_bounds() {
        let bytes = [0_u8; 6];
        assert_eq!(
            read_be_u32(&bytes, 4),
            Err(ParseError::InsufficientData {
                needed: 4,
                offset: 4,
                actual: 2,
            })
        );
        assert!(matches!(
            ensure_slice(&bytes, usize::MAX, 2),
            Err(ParseError::InvalidField { field: "offset", .. })
        ));
    }

    #[test]
    fn test_write_helpers() {
        let mut bytes = [0_u8; 12];
        write_be_u32(&mut bytes, 0, 0xDEAD_BEEF).expect("be32");
        write_be_u64(&mut bytes, 4, 7).expect("be64");
        assert_eq!(read_be_u32(&bytes, 0).expect("be32"), 0xDEAD_BEEF);
        assert_eq!(read_be_u64(&bytes, 4).expect("be64"), 7);
        assert!(write_be_u32(&mut bytes, 10, 1).is_err());
    }

    #[test]
    fn test_trim_nul_padded() {
        assert_eq!(trim_nul_padded(b"rtvol\0\0\0\0\0\0\0"), "rtvol");
    }

    #[test]
    fn test_block_size_validation() {
        assert!(BlockSize::new(512).is_ok());
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(65536).is_ok());
        assert_eq!(BlockSize::new(4096).unwrap().shift(), 12);
        assert_eq!(BlockSize::new(4096).unwrap().mask(), 4095);

        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(256).is_err());
        assert!(BlockSize::new(131_072).is_err());
        assert!(BlockSize::new(0).is_err());
    }

    #[test]
    fn test_block_size_conversions() {
        let bs = BlockSize::new(4096).unwrap();
        assert_eq!(bs.byte_to_block(4095), FileBlock(0));
        assert_eq!(bs.byte_to_block(8192), FileBlock(2));
        assert_eq!(bs.blocks_for_bytes(0), 0);
        assert_eq!(bs.blocks_for_bytes(1), 1);
        assert_eq!(bs.blocks_for_bytes(8193), 3);
        assert_eq!(bs.blocks_to_bytes(3), Some(12_288));
        assert_eq!(bs.blocks_to_bytes(u64::MAX), None);
        assert!(bs.is_aligned(8192));
        assert!(!bs.is_aligned(8193));
    }

    #[test]
    fn test_uuid_display() {
        let uuid = VolumeUuid([
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef,
        ]);
        assert_eq!(uuid.to_string(), "01234567-89ab-cdef-0123-456789abcdef");
    }
}
