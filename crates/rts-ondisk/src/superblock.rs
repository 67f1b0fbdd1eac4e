//! Primary superblock: the fields that define the realtime volume.
//!
//! All multi-byte fields are big-endian except the checksum, which is
//! stored little-endian like every other metadata CRC.

use crate::cksum;
use crate::rtword::RtWordCodec;
use rts_types::{
    BlockSize, InodeNumber, ParseError, SB_MAGIC, SB_SECTOR_SIZE, VolumeUuid, read_be_u16,
    read_be_u32, read_be_u64, read_fixed, read_le_u32, trim_nul_padded, write_be_u16,
    write_be_u32, write_be_u64, write_fixed,
};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;

// ── Field offsets ───────────────────────────────────────────────────────────

const OFF_MAGIC: usize = 0;
const OFF_BLOCKSIZE: usize = 4;
const OFF_DBLOCKS: usize = 8;
const OFF_RBLOCKS: usize = 16;
const OFF_REXTENTS: usize = 24;
const OFF_UUID: usize = 32;
const OFF_RBMINO: usize = 64;
const OFF_RSUMINO: usize = 72;
const OFF_REXTSIZE: usize = 80;
const OFF_RBMBLOCKS: usize = 92;
const OFF_VERSIONNUM: usize = 100;
const OFF_SECTSIZE: usize = 102;
const OFF_FNAME: usize = 108;
const FNAME_LEN: usize = 12;
const OFF_BLOCKLOG: usize = 120;
const OFF_REXTSLOG: usize = 125;
const OFF_FREXTENTS: usize = 152;
const OFF_FEATURES_INCOMPAT: usize = 216;
const OFF_CRC: usize = 224;
const OFF_META_UUID: usize = 248;
const OFF_RGCOUNT: usize = 272;

const VERSION_NUMBITS: u16 = 0x000F;
pub const SB_VERSION_4: u16 = 4;
pub const SB_VERSION_5: u16 = 5;

const MAX_SECTOR_SIZE: u16 = 32768;

/// Incompatible feature flags (`sb_features_incompat`, version 5 only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IncompatFeatures(pub u32);

impl IncompatFeatures {
    pub const FTYPE: Self = Self(0x0001);
    pub const SPINODES: Self = Self(0x0002);
    pub const META_UUID: Self = Self(0x0004);
    pub const BIGTIME: Self = Self(0x0008);
    pub const NEEDSREPAIR: Self = Self(0x0010);
    pub const NREXT64: Self = Self(0x0020);
    pub const EXCHRANGE: Self = Self(0x0040);
    pub const PARENT: Self = Self(0x0080);
    pub const METADIR: Self = Self(0x0100);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "FTYPE"),
        (0x0002, "SPINODES"),
        (0x0004, "META_UUID"),
        (0x0008, "BIGTIME"),
        (0x0010, "NEEDSREPAIR"),
        (0x0020, "NREXT64"),
        (0x0040, "EXCHRANGE"),
        (0x0080, "PARENT"),
        (0x0100, "METADIR"),
    ];

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }
}

impl std::fmt::Display for IncompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 == 0 {
            return f.write_str("(none)");
        }
        let mut first = true;
        let mut remaining = self.0;
        for &(bit, name) in Self::KNOWN {
            if remaining & bit != 0 {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                remaining &= !bit;
                first = false;
            }
        }
        if remaining != 0 {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "0x{remaining:X}")?;
        }
        Ok(())
    }
}

/// Parsed superblock, restricted to what the realtime scrubber consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtSuperblock {
    // ── Geometry ─────────────────────────────────────────────────────────
    pub block_size: BlockSize,
    pub blocklog: u8,
    pub sectsize: u16,
    pub dblocks: u64,

    // ── Realtime volume ──────────────────────────────────────────────────
    pub rblocks: u64,
    pub rextents: u64,
    pub rextsize: u32,
    pub rbmblocks: u32,
    pub rextslog: u8,
    pub frextents: u64,
    pub rbmino: InodeNumber,
    pub rsumino: InodeNumber,
    pub rgcount: u32,

    // ── Identity ─────────────────────────────────────────────────────────
    pub uuid: VolumeUuid,
    pub meta_uuid: VolumeUuid,
    pub fname: String,

    // ── Version & features ───────────────────────────────────────────────
    pub versionnum: u16,
    pub features_incompat: IncompatFeatures,

    // ── Checksum ─────────────────────────────────────────────────────────
    pub crc: u32,
}

impl RtSuperblock {
    /// Parse the first superblock sector.
    ///
    /// Only the magic and block size are checked here; call
    /// [`validate_geometry`](Self::validate_geometry) for the rest.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SB_SECTOR_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SB_SECTOR_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_be_u32(region, OFF_MAGIC)?;
        if magic != SB_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SB_MAGIC),
                actual: u64::from(magic),
            });
        }

        let block_size = BlockSize::new(read_be_u32(region, OFF_BLOCKSIZE)?)?;
        let versionnum = read_be_u16(region, OFF_VERSIONNUM)?;
        let features_incompat = if versionnum & VERSION_NUMBITS == SB_VERSION_5 {
            IncompatFeatures(read_be_u32(region, OFF_FEATURES_INCOMPAT)?)
        } else {
            IncompatFeatures::default()
        };

        let uuid = VolumeUuid(read_fixed::<16>(region, OFF_UUID)?);
        let meta_uuid = if features_incompat.contains(IncompatFeatures::META_UUID) {
            VolumeUuid(read_fixed::<16>(region, OFF_META_UUID)?)
        } else {
            uuid
        };
        let rgcount = if features_incompat.contains(IncompatFeatures::METADIR) {
            read_be_u32(region, OFF_RGCOUNT)?
        } else {
            0
        };

        Ok(Self {
            block_size,
            blocklog: region[OFF_BLOCKLOG],
            sectsize: read_be_u16(region, OFF_SECTSIZE)?,
            dblocks: read_be_u64(region, OFF_DBLOCKS)?,
            rblocks: read_be_u64(region, OFF_RBLOCKS)?,
            rextents: read_be_u64(region, OFF_REXTENTS)?,
            rextsize: read_be_u32(region, OFF_REXTSIZE)?,
            rbmblocks: read_be_u32(region, OFF_RBMBLOCKS)?,
            rextslog: region[OFF_REXTSLOG],
            frextents: read_be_u64(region, OFF_FREXTENTS)?,
            rbmino: InodeNumber(read_be_u64(region, OFF_RBMINO)?),
            rsumino: InodeNumber(read_be_u64(region, OFF_RSUMINO)?),
            rgcount,
            uuid,
            meta_uuid,
            fname: trim_nul_padded(&read_fixed::<FNAME_LEN>(region, OFF_FNAME)?),
            versionnum,
            features_incompat,
            crc: read_le_u32(region, OFF_CRC)?,
        })
    }

    #[must_use]
    pub fn version(&self) -> u16 {
        self.versionnum & VERSION_NUMBITS
    }

    /// Version 5 superblocks carry checksums on all metadata.
    #[must_use]
    pub fn has_crc(&self) -> bool {
        self.version() == SB_VERSION_5
    }

    #[must_use]
    pub fn has_metadir(&self) -> bool {
        self.features_incompat.contains(IncompatFeatures::METADIR)
    }

    /// Word encoding used by this volume's bitmap and summary files.
    #[must_use]
    pub fn word_codec(&self) -> RtWordCodec {
        if self.has_metadir() {
            RtWordCodec::BigEndian
        } else {
            RtWordCodec::Legacy
        }
    }

    /// Number of realtime groups. Volumes without a metadata directory have
    /// a single implicit group.
    #[must_use]
    pub fn realtime_groups(&self) -> u32 {
        if self.has_metadir() {
            self.rgcount
        } else {
            u32::from(self.rblocks > 0)
        }
    }

    #[must_use]
    pub fn rextsize_nonzero(&self) -> Option<NonZeroU32> {
        NonZeroU32::new(self.rextsize)
    }

    /// Validate field ranges and cross-field consistency.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        let version = self.version();
        if version != SB_VERSION_4 && version != SB_VERSION_5 {
            return Err(ParseError::InvalidField {
                field: "sb_versionnum",
                reason: "only versions 4 and 5 are supported",
            });
        }
        if u32::from(self.blocklog) != self.block_size.shift() {
            return Err(ParseError::InvalidField {
                field: "sb_blocklog",
                reason: "does not match sb_blocksize",
            });
        }
        if !self.sectsize.is_power_of_two()
            || usize::from(self.sectsize) < SB_SECTOR_SIZE
            || self.sectsize > MAX_SECTOR_SIZE
        {
            return Err(ParseError::InvalidField {
                field: "sb_sectsize",
                reason: "must be power of two in 512..=32768",
            });
        }
        if self.rextsize == 0 {
            return Err(ParseError::InvalidField {
                field: "sb_rextsize",
                reason: "cannot be zero",
            });
        }
        if self.has_metadir() && !self.has_crc() {
            return Err(ParseError::InvalidField {
                field: "sb_features_incompat",
                reason: "metadir requires a version 5 superblock",
            });
        }
        if self.frextents > self.rextents {
            return Err(ParseError::InvalidField {
                field: "sb_frextents",
                reason: "exceeds sb_rextents",
            });
        }
        Ok(())
    }

    /// Validate the superblock CRC32C over `sectsize` bytes.
    ///
    /// Pre-version-5 superblocks have no checksum and always pass.
    pub fn validate_checksum(&self, raw_sector: &[u8]) -> Result<(), ParseError> {
        if !self.has_crc() {
            return Ok(());
        }
        let sector = rts_types::ensure_slice(raw_sector, 0, usize::from(self.sectsize))?;
        cksum::verify_crc(sector, OFF_CRC, "sb_crc")
    }

    /// Serialize to a `sectsize`-byte sector, stamping the checksum on
    /// version 5 superblocks.
    pub fn encode_sector(&self) -> Result<Vec<u8>, ParseError> {
        let mut out = vec![0_u8; usize::from(self.sectsize).max(SB_SECTOR_SIZE)];
        write_be_u32(&mut out, OFF_MAGIC, SB_MAGIC)?;
        write_be_u32(&mut out, OFF_BLOCKSIZE, self.block_size.get())?;
        write_be_u64(&mut out, OFF_DBLOCKS, self.dblocks)?;
        write_be_u64(&mut out, OFF_RBLOCKS, self.rblocks)?;
        write_be_u64(&mut out, OFF_REXTENTS, self.rextents)?;
        write_fixed(&mut out, OFF_UUID, &self.uuid.0)?;
        write_be_u64(&mut out, OFF_RBMINO, self.rbmino.0)?;
        write_be_u64(&mut out, OFF_RSUMINO, self.rsumino.0)?;
        write_be_u32(&mut out, OFF_REXTSIZE, self.rextsize)?;
        write_be_u32(&mut out, OFF_RBMBLOCKS, self.rbmblocks)?;
        write_be_u16(&mut out, OFF_VERSIONNUM, self.versionnum)?;
        write_be_u16(&mut out, OFF_SECTSIZE, self.sectsize)?;

        let mut fname = [0_u8; FNAME_LEN];
        let name = self.fname.as_bytes();
        let n = name.len().min(FNAME_LEN);
        fname[..n].copy_from_slice(&name[..n]);
        write_fixed(&mut out, OFF_FNAME, &fname)?;

        out[OFF_BLOCKLOG] = self.blocklog;
        out[OFF_REXTSLOG] = self.rextslog;
        write_be_u64(&mut out, OFF_FREXTENTS, self.frextents)?;

        if self.has_crc() {
            write_be_u32(&mut out, OFF_FEATURES_INCOMPAT, self.features_incompat.0)?;
            if self.features_incompat.contains(IncompatFeatures::META_UUID) {
                write_fixed(&mut out, OFF_META_UUID, &self.meta_uuid.0)?;
            }
            if self.has_metadir() {
                write_be_u32(&mut out, OFF_RGCOUNT, self.rgcount)?;
            }
            cksum::stamp_crc(&mut out, OFF_CRC)?;
        }
        Ok(out)
    }
}
