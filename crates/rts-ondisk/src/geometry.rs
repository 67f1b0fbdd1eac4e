//! Realtime volume geometry.
//!
//! Everything here is pure arithmetic over the volume's primary parameters
//! (realtime block count, block size, extent size) plus the word codec.
//! [`RtGeometry::derive`] is what the scrubber recomputes;
//! [`RtGeometry::cached`] is what the mounted volume believes, taken
//! straight from the superblock.

use crate::rtword::RtWordCodec;
use crate::superblock::RtSuperblock;
use rts_types::{BlockSize, RT_WORD_BITS, RT_WORD_SIZE, RtBlock, RtExtent};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;

/// Derived realtime geometry. Immutable for the duration of a scrub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtGeometry {
    pub rblocks: u64,
    pub block_size: BlockSize,
    pub rextsize: NonZeroU32,
    pub codec: RtWordCodec,

    pub rextents: u64,
    pub rbmblocks: u64,
    pub rsumlevels: u32,
    pub rsumblocks: u64,
}

impl RtGeometry {
    /// Recompute the geometry from first principles.
    ///
    /// A volume without realtime blocks has all derived fields zero.
    #[must_use]
    pub fn derive(
        rblocks: u64,
        block_size: BlockSize,
        rextsize: NonZeroU32,
        codec: RtWordCodec,
    ) -> Self {
        let mut geo = Self {
            rblocks,
            block_size,
            rextsize,
            codec,
            rextents: 0,
            rbmblocks: 0,
            rsumlevels: 0,
            rsumblocks: 0,
        };
        if rblocks == 0 {
            return geo;
        }

        geo.rextents = rblocks / u64::from(rextsize.get());
        geo.rbmblocks = geo.rextents.div_ceil(geo.bits_per_bitmap_block());
        geo.rsumlevels = compute_rextslog(geo.rextents) + 1;
        geo.rsumblocks = geo.summary_blockcount(geo.rsumlevels, geo.rbmblocks);
        geo
    }

    /// Recompute geometry for the volume a superblock describes.
    ///
    /// Returns `None` when the superblock's extent size is zero.
    #[must_use]
    pub fn from_superblock(sb: &RtSuperblock) -> Option<Self> {
        let rextsize = sb.rextsize_nonzero()?;
        Some(Self::derive(
            sb.rblocks,
            sb.block_size,
            rextsize,
            sb.word_codec(),
        ))
    }

    /// Geometry as cached by the mounted volume: the superblock's own
    /// extent count, log and bitmap size, with the summary size computed
    /// from those.
    #[must_use]
    pub fn cached(sb: &RtSuperblock) -> Option<Self> {
        let rextsize = sb.rextsize_nonzero()?;
        let mut geo = Self {
            rblocks: sb.rblocks,
            block_size: sb.block_size,
            rextsize,
            codec: sb.word_codec(),
            rextents: sb.rextents,
            rbmblocks: u64::from(sb.rbmblocks),
            rsumlevels: 0,
            rsumblocks: 0,
        };
        if sb.rblocks > 0 {
            geo.rsumlevels = u32::from(sb.rextslog) + 1;
            geo.rsumblocks = geo.summary_blockcount(geo.rsumlevels, geo.rbmblocks);
        }
        Some(geo)
    }

    fn summary_blockcount(&self, levels: u32, rbmblocks: u64) -> u64 {
        let words = u64::from(levels).saturating_mul(rbmblocks);
        words.div_ceil(self.words_per_block())
    }

    // ── Block layout ─────────────────────────────────────────────────────

    /// Counter words stored in one bitmap or summary block.
    #[must_use]
    pub fn words_per_block(&self) -> u64 {
        let payload = self.block_size.as_usize() - self.codec.header_len();
        (payload / RT_WORD_SIZE) as u64
    }

    /// Realtime extents tracked by one bitmap block.
    #[must_use]
    pub fn bits_per_bitmap_block(&self) -> u64 {
        self.words_per_block() * u64::from(RT_WORD_BITS)
    }

    /// Bytes the bitmap file must occupy, `None` on overflow.
    #[must_use]
    pub fn bitmap_bytes(&self) -> Option<u64> {
        self.block_size.blocks_to_bytes(self.rbmblocks)
    }

    /// Minimum bytes the summary file must occupy, `None` on overflow.
    #[must_use]
    pub fn summary_bytes(&self) -> Option<u64> {
        self.block_size.blocks_to_bytes(self.rsumblocks)
    }

    /// Total counters in the summary index.
    #[must_use]
    pub fn summary_words(&self) -> u64 {
        u64::from(self.rsumlevels) * self.rbmblocks
    }

    // ── Address arithmetic ───────────────────────────────────────────────

    /// Bitmap block holding the bit for realtime extent `rtx`.
    #[must_use]
    pub fn rtx_to_rbmblock(&self, rtx: RtExtent) -> u64 {
        rtx.0 / self.bits_per_bitmap_block()
    }

    /// Summary word index for length class `lenlog` in bitmap block `bbno`.
    #[must_use]
    pub fn summary_word_offset(&self, lenlog: u32, bbno: u64) -> u64 {
        u64::from(lenlog) * self.rbmblocks + bbno
    }

    /// Byte offset of a summary word inside the summary word stream.
    #[must_use]
    pub fn summary_byte_offset(&self, word_offset: u64) -> Option<u64> {
        word_offset.checked_mul(RT_WORD_SIZE as u64)
    }

    /// First realtime block of extent `rtx`.
    #[must_use]
    pub fn rtx_to_rtb(&self, rtx: RtExtent) -> Option<RtBlock> {
        rtx.0
            .checked_mul(u64::from(self.rextsize.get()))
            .map(RtBlock)
    }

    /// Realtime blocks covered by `count` extents.
    #[must_use]
    pub fn rtxlen_to_extlen(&self, count: u64) -> Option<u64> {
        count.checked_mul(u64::from(self.rextsize.get()))
    }

    /// Whether `[start, start + len)` is a non-empty range inside the
    /// realtime device.
    #[must_use]
    pub fn verify_rtbext(&self, start: RtBlock, len: u64) -> bool {
        if len == 0 {
            return false;
        }
        match start.0.checked_add(len) {
            Some(end) => end <= self.rblocks,
            None => false,
        }
    }
}

/// log2 of the extent count, rounded down; zero for an empty volume.
#[must_use]
pub fn compute_rextslog(rextents: u64) -> u32 {
    if rextents == 0 { 0 } else { rextents.ilog2() }
}

/// Summary length class of a free extent run.
#[must_use]
pub fn length_class(count: u64) -> Option<u32> {
    count.checked_ilog2()
}
