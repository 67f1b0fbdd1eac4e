//! Self-describing header carried by realtime bitmap and summary blocks on
//! volumes that use the big-endian word codec.
//!
//! Layout (48 bytes):
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | magic (BE) |
//! | 4 | 4 | crc32c (LE) |
//! | 8 | 8 | owner inode (BE) |
//! | 16 | 8 | disk address of this block (BE) |
//! | 24 | 8 | lsn of last write (BE) |
//! | 32 | 16 | filesystem uuid |

use crate::cksum;
use rts_types::{
    InodeNumber, ParseError, RTBITMAP_MAGIC, RTSUMMARY_MAGIC, VolumeUuid, read_be_u32,
    read_be_u64, read_fixed, read_le_u32, write_be_u32, write_be_u64, write_fixed,
};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const RTBUF_HEADER_SIZE: usize = 48;

const MAGIC_OFFSET: usize = 0;
const CRC_OFFSET: usize = 4;
const OWNER_OFFSET: usize = 8;
const BLKNO_OFFSET: usize = 16;
const LSN_OFFSET: usize = 24;
const UUID_OFFSET: usize = 32;

/// Which realtime metadata file a block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RtFileKind {
    Bitmap,
    Summary,
}

impl RtFileKind {
    #[must_use]
    pub fn magic(self) -> u32 {
        match self {
            Self::Bitmap => RTBITMAP_MAGIC,
            Self::Summary => RTSUMMARY_MAGIC,
        }
    }
}

impl fmt::Display for RtFileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bitmap => f.write_str("rtbitmap"),
            Self::Summary => f.write_str("rtsummary"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtBufHeader {
    pub magic: u32,
    pub crc: u32,
    pub owner: InodeNumber,
    pub blkno: u64,
    pub lsn: u64,
    pub uuid: VolumeUuid,
}

impl RtBufHeader {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            magic: read_be_u32(block, MAGIC_OFFSET)?,
            crc: read_le_u32(block, CRC_OFFSET)?,
            owner: InodeNumber(read_be_u64(block, OWNER_OFFSET)?),
            blkno: read_be_u64(block, BLKNO_OFFSET)?,
            lsn: read_be_u64(block, LSN_OFFSET)?,
            uuid: VolumeUuid(read_fixed::<16>(block, UUID_OFFSET)?),
        })
    }
}

/// Verify a whole bitmap or summary block's header.
///
/// The disk address is not checked: blocks are addressed through the
/// owning file's fork, which may be a dumped copy at a different address.
pub fn verify_rtbuf(
    block: &[u8],
    kind: RtFileKind,
    owner: InodeNumber,
    uuid: VolumeUuid,
) -> Result<RtBufHeader, ParseError> {
    let header = RtBufHeader::parse(block)?;
    if header.magic != kind.magic() {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(kind.magic()),
            actual: u64::from(header.magic),
        });
    }
    if header.owner != owner {
        return Err(ParseError::InvalidField {
            field: "rt_owner",
            reason: "block owned by another inode",
        });
    }
    if header.uuid != uuid {
        return Err(ParseError::InvalidField {
            field: "rt_uuid",
            reason: "uuid does not match filesystem",
        });
    }
    cksum::verify_crc(block, CRC_OFFSET, "rt_crc")?;
    Ok(header)
}

/// Write a fresh header into `block` and checksum it.
pub fn stamp_rtbuf(
    block: &mut [u8],
    kind: RtFileKind,
    owner: InodeNumber,
    blkno: u64,
    uuid: VolumeUuid,
) -> Result<(), ParseError> {
    write_be_u32(block, MAGIC_OFFSET, kind.magic())?;
    write_be_u64(block, OWNER_OFFSET, owner.0)?;
    write_be_u64(block, BLKNO_OFFSET, blkno)?;
    write_be_u64(block, LSN_OFFSET, 0)?;
    write_fixed(block, UUID_OFFSET, &uuid.0)?;
    cksum::stamp_crc(block, CRC_OFFSET)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: VolumeUuid = VolumeUuid([0xAB; 16]);

    fn stamped(kind: RtFileKind) -> Vec<u8> {
        let mut block = vec![0_u8; 512];
        block[RTBUF_HEADER_SIZE..].fill(0x11);
        stamp_rtbuf(&mut block, kind, InodeNumber(129), 77, UUID).expect("stamp");
        block
    }

    #[test]
    fn stamped_block_verifies() {
        let block = stamped(RtFileKind::Summary);
        let header =
            verify_rtbuf(&block, RtFileKind::Summary, InodeNumber(129), UUID).expect("verify");
        assert_eq!(header.magic, RTSUMMARY_MAGIC);
        assert_eq!(header.blkno, 77);
        assert_eq!(header.owner, InodeNumber(129));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let block = stamped(RtFileKind::Bitmap);
        assert_eq!(
            verify_rtbuf(&block, RtFileKind::Summary, InodeNumber(129), UUID),
            Err(ParseError::InvalidMagic {
                expected: u64::from(RTSUMMARY_MAGIC),
                actual: u64::from(RTBITMAP_MAGIC),
            })
        );
    }

    #[test]
    fn wrong_owner_and_uuid_are_rejected() {
        let block = stamped(RtFileKind::Summary);
        assert!(matches!(
            verify_rtbuf(&block, RtFileKind::Summary, InodeNumber(130), UUID),
            Err(ParseError::InvalidField { field: "rt_owner", .. })
        ));
        assert!(matches!(
            verify_rtbuf(&block, RtFileKind::Summary, InodeNumber(129), VolumeUuid::NIL),
            Err(ParseError::InvalidField { field: "rt_uuid", .. })
        ));
    }

    #[test]
    fn payload_damage_breaks_crc() {
        let mut block = stamped(RtFileKind::Summary);
        block[400] ^= 1;
        assert!(matches!(
            verify_rtbuf(&block, RtFileKind::Summary, InodeNumber(129), UUID),
            Err(ParseError::InvalidField { field: "rt_crc", .. })
        ));
    }

    #[test]
    fn kind_display() {
        assert_eq!(RtFileKind::Bitmap.to_string(), "rtbitmap");
        assert_eq!(RtFileKind::Summary.to_string(), "rtsummary");
    }
}
