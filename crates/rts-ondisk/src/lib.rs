#![forbid(unsafe_code)]
//! On-disk format for the realtime volume metadata.
//!
//! Pure parsing crate: no I/O, no side effects. Parses the primary
//! superblock, derives realtime geometry, encodes and decodes bitmap and
//! summary counter words, and verifies the self-describing header carried
//! by bitmap and summary blocks on current-format volumes.

pub mod cksum;
pub mod geometry;
pub mod rtbuf;
pub mod rtword;
pub mod superblock;

pub use geometry::{RtGeometry, compute_rextslog, length_class};
pub use rtbuf::{RTBUF_HEADER_SIZE, RtBufHeader, RtFileKind, stamp_rtbuf, verify_rtbuf};
pub use rtword::RtWordCodec;
pub use superblock::{IncompatFeatures, RtSuperblock, SB_VERSION_4, SB_VERSION_5};

use rts_error::RtsError;
use rts_types::{FileBlock, ParseError};

/// Attribute a parse failure inside a metadata file block to that block.
#[must_use]
pub fn corruption_at(block: FileBlock, err: &ParseError) -> RtsError {
    RtsError::Corruption {
        block: block.0,
        detail: err.to_string(),
    }
}

/// Map a superblock parse failure to a format error.
#[must_use]
pub fn format_error(err: &ParseError) -> RtsError {
    RtsError::Format(format!("superblock: {err}"))
}

/// Parse and fully validate the primary superblock.
///
/// Rejects checksum mismatches and volumes with more than one realtime
/// group.
pub fn load_superblock(raw_sector: &[u8]) -> rts_error::Result<RtSuperblock> {
    let sb = RtSuperblock::parse_superblock_region(raw_sector).map_err(|e| format_error(&e))?;
    sb.validate_geometry().map_err(|e| format_error(&e))?;
    sb.validate_checksum(raw_sector)
        .map_err(|e| format_error(&e))?;
    if sb.realtime_groups() > 1 {
        return Err(RtsError::UnsupportedFeature(format!(
            "{} realtime groups (only single-group volumes are scrubbed)",
            sb.realtime_groups()
        )));
    }
    Ok(sb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rts_types::{BlockSize, InodeNumber, VolumeUuid};

    fn metadir_sb(rgcount: u32) -> RtSuperblock {
        RtSuperblock {
            block_size: BlockSize::new(4096).expect("bs"),
            blocklog: 12,
            sectsize: 512,
            dblocks: 1 << 16,
            rblocks: 4096,
            rextents: 4096,
            rextsize: 1,
            rbmblocks: 1,
            rextslog: 12,
            frextents: 0,
            rbmino: InodeNumber(129),
            rsumino: InodeNumber(130),
            rgcount,
            uuid: VolumeUuid([1; 16]),
            meta_uuid: VolumeUuid([1; 16]),
            fname: "rt".into(),
            versionnum: SB_VERSION_5,
            features_incompat: IncompatFeatures::METADIR,
            crc: 0,
        }
    }

    #[test]
    fn load_accepts_single_group() {
        let sector = metadir_sb(1).encode_sector().expect("encode");
        let sb = load_superblock(&sector).expect("load");
        assert_eq!(sb.rgcount, 1);
    }

    #[test]
    fn load_rejects_multiple_groups() {
        let sector = metadir_sb(4).encode_sector().expect("encode");
        let err = load_superblock(&sector).expect_err("multi-group");
        assert!(matches!(err, RtsError::UnsupportedFeature(_)));
    }

    #[test]
    fn load_rejects_bad_checksum() {
        let mut sector = metadir_sb(1).encode_sector().expect("encode");
        // Low byte of sb_rblocks.
        sector[23] ^= 1;
        assert!(matches!(load_superblock(&sector), Err(RtsError::Format(_))));
    }

    #[test]
    fn corruption_at_carries_block() {
        let err = corruption_at(
            FileBlock(9),
            &ParseError::InvalidMagic {
                expected: 1,
                actual: 2,
            },
        );
        assert!(matches!(err, RtsError::Corruption { block: 9, .. }));
    }
}
