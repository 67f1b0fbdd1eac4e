//! Recompute the summary index from the bitmap's free extents.
//!
//! One forward pass over the free-extent records: each record bumps the
//! counter for its length class in the bitmap block where it starts. The
//! counters live in the session's staging store, encoded with the volume's
//! word codec so the result can be compared byte for byte.

use crate::session::{CorruptionSink, ScrubContext, StructureId, poll_stop};
use rts_alloc::{BitmapExtentSource, FreeExtent};
use rts_error::{Result, RtsError};
use rts_extent::MetaFile;
use rts_ondisk::length_class;
use rts_types::RT_WORD_SIZE;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecomputeOutcome {
    /// Every record was tallied.
    Complete,
    /// The bitmap was found damaged and has been flagged.
    BitmapCorrupt,
}

/// Tally one free extent into the staged summary.
///
/// A record outside the realtime device, or of zero length, comes back as
/// `Corruption` so the bitmap walk stops; [`compute_summary`] attributes
/// it to the bitmap.
pub fn record_free(ctx: &mut ScrubContext<'_>, rec: FreeExtent) -> Result<()> {
    ctx.checkpoint()?;
    let geo = ctx.geo;
    let bbno = geo.rtx_to_rbmblock(rec.start);

    let Some(lenlog) = length_class(rec.count) else {
        return Err(RtsError::Corruption {
            block: bbno,
            detail: format!("zero-length free extent at {}", rec.start),
        });
    };
    let in_range = geo
        .rtx_to_rtb(rec.start)
        .zip(geo.rtxlen_to_extlen(rec.count))
        .is_some_and(|(rtb, len)| geo.verify_rtbext(rtb, len));
    if !in_range {
        return Err(RtsError::Corruption {
            block: bbno,
            detail: format!(
                "free extent {rec} lies outside the {}-block realtime device",
                geo.rblocks
            ),
        });
    }

    let word = geo.summary_word_offset(lenlog, bbno);
    let byte = geo
        .summary_byte_offset(word)
        .ok_or_else(|| RtsError::Format(format!("summary word {word} overflows")))?;

    let mut raw = [0_u8; RT_WORD_SIZE];
    ctx.staging.load(byte, &mut raw)?;
    let value = geo.codec.increment(&mut raw);
    ctx.staging.store(byte, &raw)?;
    ctx.stats.free_extents_recorded += 1;

    trace!(
        target: "rts::scrub::rtsummary",
        start = rec.start.0,
        count = rec.count,
        lenlog,
        offset = word,
        value,
        "free extent recorded"
    );
    Ok(())
}

/// Rebuild the whole summary index in staging from `source`.
///
/// The bitmap file must be exactly the derived bitmap size; otherwise it is
/// flagged and `source` is never walked.
pub fn compute_summary(
    ctx: &mut ScrubContext<'_>,
    bitmap: &MetaFile,
    source: &dyn BitmapExtentSource,
) -> Result<RecomputeOutcome> {
    let id = StructureId::bitmap(bitmap.ino());
    let expected = ctx.geo.bitmap_bytes();
    if expected != Some(bitmap.disk_size()) {
        ctx.result.flag_structure_corrupt(
            id,
            None,
            format!(
                "bitmap is {} bytes, geometry requires {}",
                bitmap.disk_size(),
                expected.map_or_else(|| "an unrepresentable size".to_owned(), |b| b.to_string())
            ),
        );
        return Ok(RecomputeOutcome::BitmapCorrupt);
    }

    debug!(
        target: "rts::scrub::rtsummary",
        rbmblocks = ctx.geo.rbmblocks,
        rsumlevels = ctx.geo.rsumlevels,
        "recomputing summary"
    );

    let cx = ctx.cx();
    let stop = ctx.stop_check();
    let checkpoint = || poll_stop(cx, stop);
    match source.query_all(cx, &checkpoint, &mut |rec| record_free(ctx, rec)) {
        Ok(()) => Ok(RecomputeOutcome::Complete),
        // Flag the cross-reference only; the sink keeps a single finding.
        Err(RtsError::Corruption { block, detail }) => {
            ctx.result
                .flag_cross_structure_corrupt(id, format!("bitmap block {block}: {detail}"));
            Ok(RecomputeOutcome::BitmapCorrupt)
        }
        Err(err) => Err(err),
    }
}
