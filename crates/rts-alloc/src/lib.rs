#![forbid(unsafe_code)]
//! Realtime free-space bitmap.
//!
//! One bit per realtime extent, packed into 32-bit words in bit-LSB-first
//! order; a set bit means the extent is free. This crate reads the bitmap
//! and reports maximal free runs in ascending order.
//!
//! ## Design
//!
//! 1. **Word bits**: test and set one extent's bit inside a block payload.
//! 2. **[`BitmapExtentSource`]**: the interface the summary scrubber
//!    consumes: a forward walk over free extents with a fallible callback.
//! 3. **[`RtBitmapScanner`]**: the on-disk implementation, reading bitmap
//!    blocks through the bitmap file's data fork.

use asupersync::Cx;
use rts_error::{Result, RtsError};
use rts_extent::MetaFile;
use rts_ondisk::{RtFileKind, RtGeometry, RtWordCodec, corruption_at, verify_rtbuf};
use rts_types::{FileBlock, ParseError, RT_WORD_BITS, RT_WORD_SIZE, RtExtent, VolumeUuid};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, trace};

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| RtsError::Cancelled)
}

// ── Bitmap word operations ──────────────────────────────────────────────────

fn word_position(bit: u64) -> std::result::Result<(usize, u32), ParseError> {
    let word = usize::try_from(bit / u64::from(RT_WORD_BITS)).map_err(|_| {
        ParseError::IntegerConversion {
            field: "bitmap word index",
        }
    })?;
    #[expect(clippy::cast_possible_truncation)] // remainder of a division by 32
    let shift = (bit % u64::from(RT_WORD_BITS)) as u32;
    Ok((word * RT_WORD_SIZE, shift))
}

/// Whether extent bit `bit` of a bitmap block payload is set (free).
pub fn rtbitmap_is_free(
    codec: RtWordCodec,
    payload: &[u8],
    bit: u64,
) -> std::result::Result<bool, ParseError> {
    let (offset, shift) = word_position(bit)?;
    Ok((codec.load(payload, offset)? >> shift) & 1 == 1)
}

/// Set or clear extent bit `bit` of a bitmap block payload.
pub fn rtbitmap_set_free(
    codec: RtWordCodec,
    payload: &mut [u8],
    bit: u64,
    free: bool,
) -> std::result::Result<(), ParseError> {
    let (offset, shift) = word_position(bit)?;
    let word = codec.load(payload, offset)?;
    let word = if free {
        word | (1 << shift)
    } else {
        word & !(1 << shift)
    };
    codec.store(payload, offset, word)
}

// ── Free extent records ─────────────────────────────────────────────────────

/// A run of free realtime extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FreeExtent {
    pub start: RtExtent,
    pub count: u64,
}

impl FreeExtent {
    #[must_use]
    pub fn new(start: u64, count: u64) -> Self {
        Self {
            start: RtExtent(start),
            count,
        }
    }
}

impl fmt::Display for FreeExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, +{})", self.start, self.count)
    }
}

/// Caller-supplied stop poll, consulted once per bitmap block.
pub type Checkpoint<'a> = &'a dyn Fn() -> Result<()>;

/// Producer of free extents in ascending, non-overlapping start order.
///
/// The walk stops at the first error, whether it comes from reading the
/// bitmap, from `checkpoint` or from `visit`.
pub trait BitmapExtentSource {
    fn query_all(
        &self,
        cx: &Cx,
        checkpoint: Checkpoint<'_>,
        visit: &mut dyn FnMut(FreeExtent) -> Result<()>,
    ) -> Result<()>;
}

/// A fixed list of records, replayed verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeExtentList {
    extents: Vec<FreeExtent>,
}

impl FreeExtentList {
    #[must_use]
    pub fn new(extents: Vec<FreeExtent>) -> Self {
        Self { extents }
    }

    #[must_use]
    pub fn extents(&self) -> &[FreeExtent] {
        &self.extents
    }
}

impl BitmapExtentSource for FreeExtentList {
    /// No blocks to walk, so `checkpoint` is never polled.
    fn query_all(
        &self,
        cx: &Cx,
        _checkpoint: Checkpoint<'_>,
        visit: &mut dyn FnMut(FreeExtent) -> Result<()>,
    ) -> Result<()> {
        for rec in &self.extents {
            cx_checkpoint(cx)?;
            visit(*rec)?;
        }
        Ok(())
    }
}

// ── On-disk scanner ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RunTracker {
    pending: Option<FreeExtent>,
}

impl RunTracker {
    fn mark_free(&mut self, pos: u64, n: u64) {
        match &mut self.pending {
            Some(run) => run.count += n,
            None => self.pending = Some(FreeExtent::new(pos, n)),
        }
    }

    fn mark_used(&mut self, visit: &mut dyn FnMut(FreeExtent) -> Result<()>) -> Result<()> {
        match self.pending.take() {
            Some(run) => visit(run),
            None => Ok(()),
        }
    }
}

/// Walks the persisted bitmap file block by block.
///
/// Runs are merged across word and block boundaries. Bits past the
/// volume's extent count are ignored.
#[derive(Debug, Clone, Copy)]
pub struct RtBitmapScanner<'a> {
    file: &'a MetaFile,
    geo: &'a RtGeometry,
    uuid: VolumeUuid,
}

impl<'a> RtBitmapScanner<'a> {
    /// `uuid` is the metadata uuid stamped into block headers; it is only
    /// consulted for the big-endian codec.
    #[must_use]
    pub fn new(file: &'a MetaFile, geo: &'a RtGeometry, uuid: VolumeUuid) -> Self {
        Self { file, geo, uuid }
    }

    fn read_checked(&self, cx: &Cx, bbno: u64) -> Result<Vec<u8>> {
        let offset = FileBlock(bbno);
        let block = self.file.read_block(cx, offset)?.into_inner();
        if self.geo.codec.has_header() {
            verify_rtbuf(&block, RtFileKind::Bitmap, self.file.ino(), self.uuid)
                .map_err(|e| corruption_at(offset, &e))?;
        }
        Ok(block)
    }
}

impl BitmapExtentSource for RtBitmapScanner<'_> {
    fn query_all(
        &self,
        cx: &Cx,
        checkpoint: Checkpoint<'_>,
        visit: &mut dyn FnMut(FreeExtent) -> Result<()>,
    ) -> Result<()> {
        let codec = self.geo.codec;
        let word_bits = u64::from(RT_WORD_BITS);
        let bits_per_block = self.geo.bits_per_bitmap_block();
        let rextents = self.geo.rextents;
        let mut runs = RunTracker::default();

        debug!(
            target: "rts::alloc::rtbitmap",
            rbmblocks = self.geo.rbmblocks,
            rextents,
            "bitmap scan start"
        );

        for bbno in 0..self.geo.rbmblocks {
            cx_checkpoint(cx)?;
            checkpoint()?;
            let base = bbno * bits_per_block;
            if base >= rextents {
                break;
            }
            let block = self.read_checked(cx, bbno)?;
            let bits_here = bits_per_block.min(rextents - base);

            for w in 0..bits_here.div_ceil(word_bits) {
                let index = usize::try_from(w).map_err(|_| RtsError::Corruption {
                    block: bbno,
                    detail: "bitmap word index overflow".into(),
                })?;
                let word = codec
                    .block_word(&block, index)
                    .map_err(|e| corruption_at(FileBlock(bbno), &e))?;
                let word_base = base + w * word_bits;
                let valid = word_bits.min(rextents - word_base);

                if valid == word_bits && word == u32::MAX {
                    runs.mark_free(word_base, word_bits);
                    continue;
                }
                if word == 0 {
                    runs.mark_used(visit)?;
                    continue;
                }
                for bit in 0..valid {
                    if (word >> bit) & 1 == 1 {
                        runs.mark_free(word_base + bit, 1);
                    } else {
                        runs.mark_used(visit)?;
                    }
                }
            }

            trace!(
                target: "rts::alloc::rtbitmap",
                bbno,
                "bitmap block scanned"
            );
        }

        runs.mark_used(visit)
    }
}
