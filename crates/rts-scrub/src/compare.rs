//! Compare the persisted summary against the staged recomputation.

use crate::session::{CorruptionSink, ScrubContext, StructureId};
use rts_error::{Result, RtsError};
use rts_extent::MetaFile;
use rts_ondisk::{RtFileKind, verify_rtbuf};
use rts_types::{FileBlock, RT_WORD_SIZE, VolumeUuid};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOutcome {
    Match,
    /// The summary was flagged at `offset`; later blocks were not read.
    Mismatch { offset: FileBlock },
}

/// Walk summary blocks `0..rsumblocks`, stopping at the first divergence.
///
/// Blocks past the derived summary size are never read: the file may have
/// been enlarged ahead of a grow.
pub fn compare_summary(
    ctx: &mut ScrubContext<'_>,
    summary: &MetaFile,
    uuid: VolumeUuid,
) -> Result<CompareOutcome> {
    let id = StructureId::summary(summary.ino());
    let geo = ctx.geo;
    let words = usize::try_from(geo.words_per_block())
        .map_err(|_| RtsError::InvalidGeometry("words per block overflows".into()))?;
    let span = words * RT_WORD_SIZE;
    let mut staged = vec![0_u8; span];
    let mut staged_off = 0_u64;

    debug!(
        target: "rts::scrub::rtsummary",
        rsumblocks = geo.rsumblocks,
        words_per_block = words,
        "comparing summary"
    );

    for off in 0..geo.rsumblocks {
        ctx.checkpoint()?;
        let offset = FileBlock(off);

        let block = match summary.read_block(ctx.cx(), offset) {
            Ok(buf) => buf.into_inner(),
            Err(RtsError::Corruption { detail, .. }) => {
                ctx.result.flag_structure_corrupt(id, Some(offset), detail);
                return Ok(CompareOutcome::Mismatch { offset });
            }
            Err(err) => return Err(err),
        };

        if geo.codec.has_header() {
            if let Err(err) = verify_rtbuf(&block, RtFileKind::Summary, summary.ino(), uuid) {
                ctx.result
                    .flag_structure_corrupt(id, Some(offset), format!("block header: {err}"));
                return Ok(CompareOutcome::Mismatch { offset });
            }
        }

        let header = geo.codec.header_len();
        let Some(ondisk) = block.get(header..header + span) else {
            ctx.result.flag_structure_corrupt(
                id,
                Some(offset),
                format!("short block: {} bytes", block.len()),
            );
            return Ok(CompareOutcome::Mismatch { offset });
        };

        ctx.staging.load(staged_off, &mut staged)?;
        ctx.stats.summary_blocks_compared += 1;

        if ondisk != staged.as_slice() {
            let detail = describe_mismatch(ctx, ondisk, &staged);
            ctx.result.flag_structure_corrupt(id, Some(offset), detail);
            return Ok(CompareOutcome::Mismatch { offset });
        }
        staged_off += span as u64;
    }

    Ok(CompareOutcome::Match)
}

fn describe_mismatch(ctx: &ScrubContext<'_>, ondisk: &[u8], staged: &[u8]) -> String {
    let codec = ctx.geo.codec;
    let first = ondisk
        .chunks_exact(RT_WORD_SIZE)
        .zip(staged.chunks_exact(RT_WORD_SIZE))
        .position(|(a, b)| a != b);
    match first {
        Some(i) => {
            let at = i * RT_WORD_SIZE;
            let found = codec.load(ondisk, at).unwrap_or_default();
            let expected = codec.load(staged, at).unwrap_or_default();
            format!("word {i} holds {found}, recomputed {expected}")
        }
        None => "summary block differs from recomputation".to_owned(),
    }
}
