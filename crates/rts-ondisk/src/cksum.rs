//! CRC32C helpers for self-describing metadata.
//!
//! Checksummed structures store a little-endian CRC32C of the whole buffer
//! computed with the checksum field itself read as zero.

use rts_types::{ParseError, ensure_slice, read_le_u32, write_le_u32};

const CRC_FIELD_LEN: usize = 4;

/// CRC32C of `buf` with the four bytes at `crc_offset` treated as zero.
pub fn crc_with_hole(buf: &[u8], crc_offset: usize) -> Result<u32, ParseError> {
    let head = ensure_slice(buf, 0, crc_offset)?;
    let tail_start = crc_offset + CRC_FIELD_LEN;
    let tail = ensure_slice(buf, tail_start, buf.len().saturating_sub(tail_start))?;
    let crc = crc32c::crc32c(head);
    let crc = crc32c::crc32c_append(crc, &[0_u8; CRC_FIELD_LEN]);
    Ok(crc32c::crc32c_append(crc, tail))
}

/// Compare the stored checksum against a fresh computation.
pub fn verify_crc(buf: &[u8], crc_offset: usize, field: &'static str) -> Result<(), ParseError> {
    let stored = read_le_u32(buf, crc_offset)?;
    if stored != crc_with_hole(buf, crc_offset)? {
        return Err(ParseError::InvalidField {
            field,
            reason: "CRC32C mismatch",
        });
    }
    Ok(())
}

/// Recompute and store the checksum in place.
pub fn stamp_crc(buf: &mut [u8], crc_offset: usize) -> Result<u32, ParseError> {
    let crc = crc_with_hole(buf, crc_offset)?;
    write_le_u32(buf, crc_offset, crc)?;
    Ok(crc)
}
