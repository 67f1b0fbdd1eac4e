//! Cheap precondition checks run around the expensive recompute.
//!
//! Each check flags the structure whose invariant failed and stops at the
//! first failure; the outcomes are mutually exclusive.

use crate::session::{CorruptionSink, ScrubContext, StructureId};
use rts_error::{Result, RtsError};
use rts_extent::MetaFile;
use rts_ondisk::RtGeometry;
use rts_types::FileBlock;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Verdict {
    Pass,
    Flagged,
}

impl Verdict {
    #[must_use]
    pub fn passed(self) -> bool {
        self == Self::Pass
    }
}

/// Compare the geometry the mounted volume caches against the derived one,
/// then check the summary file's size.
pub fn check_cached_geometry(
    ctx: &mut ScrubContext<'_>,
    cached: &RtGeometry,
    bitmap: StructureId,
    summary: &MetaFile,
) -> Verdict {
    let geo = ctx.geo;
    let summary_id = StructureId::summary(summary.ino());

    let failure = if cached.rextents != geo.rextents {
        Some((
            bitmap,
            format!(
                "superblock records {} realtime extents, geometry derives {}",
                cached.rextents, geo.rextents
            ),
        ))
    } else if cached.rsumlevels != geo.rsumlevels {
        Some((
            summary_id,
            format!(
                "cached summary has {} levels, geometry derives {}",
                cached.rsumlevels, geo.rsumlevels
            ),
        ))
    } else if cached.rsumblocks != geo.rsumblocks {
        Some((
            summary_id,
            format!(
                "cached summary spans {} blocks, geometry derives {}",
                cached.rsumblocks, geo.rsumblocks
            ),
        ))
    } else if !geo.block_size.is_aligned(summary.disk_size()) {
        Some((
            summary_id,
            format!(
                "summary size {} is not a multiple of the {}-byte block",
                summary.disk_size(),
                geo.block_size.get()
            ),
        ))
    } else {
        match geo.summary_bytes() {
            Some(min) if summary.disk_size() >= min => None,
            min => Some((
                summary_id,
                format!(
                    "summary size {} is below the required {}",
                    summary.disk_size(),
                    min.map_or_else(|| "(overflow)".to_owned(), |m| m.to_string())
                ),
            )),
        }
    };

    match failure {
        Some((structure, detail)) => {
            ctx.result.flag_structure_corrupt(structure, None, detail);
            Verdict::Flagged
        }
        None => Verdict::Pass,
    }
}

/// Every summary block below EOF must be a written extent, and nothing may
/// be mapped at or beyond EOF.
pub fn check_summary_fork(ctx: &mut ScrubContext<'_>, summary: &MetaFile) -> Result<Verdict> {
    let id = StructureId::summary(summary.ino());
    let fork = summary.fork();
    let cx = ctx.cx();
    let endoff = FileBlock(summary.size_in_blocks());

    ctx.checkpoint()?;
    if let Some(beyond) = fork.lookup_extent(cx, endoff)? {
        ctx.result.flag_structure_corrupt(
            id,
            Some(endoff),
            format!(
                "extent at block {} ({:?}) extends past EOF",
                beyond.logical_start, beyond.state
            ),
        );
        return Ok(Verdict::Flagged);
    }

    let mut off = FileBlock(0);
    while off < endoff {
        ctx.checkpoint()?;
        let mapping = fork.resolve(cx, off)?;
        ctx.stats.fork_mappings_checked += 1;
        if !mapping.is_written() {
            ctx.result.flag_structure_corrupt(
                id,
                Some(off),
                format!("block {off} is {:?}, not a written extent", mapping.state),
            );
            return Ok(Verdict::Flagged);
        }
        let next = mapping.logical_end();
        if next <= off {
            return Err(RtsError::Format(format!(
                "fork mapping at block {off} does not advance"
            )));
        }
        off = next;
    }

    debug!(
        target: "rts::scrub::rtsummary",
        blocks = endoff.0,
        mappings = ctx.stats.fork_mappings_checked,
        "summary fork fully written"
    );
    Ok(Verdict::Pass)
}
