//! Realtime summary scrub orchestrator.
//!
//! Runs `Setup → ValidateSizes → ValidateForks → Recompute → Compare →
//! Done` over a locked volume. A stage that flags corruption ends the scrub
//! with a corrupt result; a stage that fails ends it with the error, which
//! callers must read as "could not determine", never as clean.

use crate::compare::{CompareOutcome, compare_summary};
use crate::options::ScrubOptions;
use crate::recompute::{RecomputeOutcome, compute_summary};
use crate::session::{
    CancellationCheck, ScrubContext, ScrubResult, ScrubStage, ScrubStats, StageTiming, StructureId,
};
use crate::staging::open_staging;
use crate::validate::{check_cached_geometry, check_summary_fork};
use crate::volume::LockedRtVolume;
use asupersync::Cx;
use rts_alloc::{BitmapExtentSource, RtBitmapScanner};
use rts_error::{Result, RtsError};
use rts_ondisk::RtGeometry;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Result of a scrub that ran to a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubOutcome {
    pub result: ScrubResult,
    /// Stage that produced the verdict; `Done` when clean.
    pub stage: ScrubStage,
    pub geometry: RtGeometry,
    pub stats: ScrubStats,
}

impl ScrubOutcome {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.result.is_clean()
    }

    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        self.result.is_corrupt()
    }
}

/// Scrubs the realtime summary of one locked volume.
pub struct RtSummaryScrubber<'a, 'v> {
    vol: &'a LockedRtVolume<'v>,
    options: ScrubOptions,
    stop: Option<&'a dyn CancellationCheck>,
}

impl<'a, 'v> RtSummaryScrubber<'a, 'v> {
    #[must_use]
    pub fn new(vol: &'a LockedRtVolume<'v>) -> Self {
        Self {
            vol,
            options: ScrubOptions::default(),
            stop: None,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ScrubOptions) -> Self {
        self.options = options;
        self
    }

    /// Poll `stop` in addition to the `Cx` at every record, block and
    /// mapping.
    #[must_use]
    pub fn with_cancellation(mut self, stop: &'a dyn CancellationCheck) -> Self {
        self.stop = Some(stop);
        self
    }

    fn geometry(&self) -> Result<(RtGeometry, RtGeometry)> {
        let sb = self.vol.superblock();
        let zero = || RtsError::InvalidGeometry("realtime extent size is zero".into());
        let derived = RtGeometry::from_superblock(sb).ok_or_else(zero)?;
        let cached = RtGeometry::cached(sb).ok_or_else(zero)?;
        Ok((derived, cached))
    }

    /// Scrub, reading free extents from the persisted bitmap.
    pub fn run(&self, cx: &Cx) -> Result<ScrubOutcome> {
        let (geo, cached) = self.geometry()?;
        let scanner = RtBitmapScanner::new(self.vol.bitmap(), &geo, self.vol.metadata_uuid());
        self.execute(cx, geo, &cached, &scanner)
    }

    /// Scrub with free extents from `source` instead of the bitmap file.
    pub fn run_with_source(
        &self,
        cx: &Cx,
        source: &dyn BitmapExtentSource,
    ) -> Result<ScrubOutcome> {
        let (geo, cached) = self.geometry()?;
        self.execute(cx, geo, &cached, source)
    }

    fn execute(
        &self,
        cx: &Cx,
        geo: RtGeometry,
        cached: &RtGeometry,
        source: &dyn BitmapExtentSource,
    ) -> Result<ScrubOutcome> {
        let sb = self.vol.superblock();
        info!(
            target: "rts::scrub::rtsummary",
            uuid = %sb.uuid,
            rblocks = geo.rblocks,
            rextents = geo.rextents,
            rbmblocks = geo.rbmblocks,
            rsumblocks = geo.rsumblocks,
            codec = ?geo.codec,
            "rtsummary scrub start"
        );

        if geo.rblocks == 0 {
            info!(target: "rts::scrub::rtsummary", "no realtime section, nothing to scrub");
            return Ok(ScrubOutcome {
                result: ScrubResult::default(),
                stage: ScrubStage::Done,
                geometry: geo,
                stats: ScrubStats::default(),
            });
        }

        let setup_clock = Instant::now();
        let len = geo
            .summary_bytes()
            .ok_or_else(|| RtsError::InvalidGeometry("summary size overflows".into()))?;
        let staging = open_staging(&self.options, len)?;
        let mut ctx = ScrubContext::new(cx, self.stop, geo, staging);
        ctx.stats.stages.push(StageTiming {
            stage: ScrubStage::Setup,
            micros: elapsed_micros(setup_clock),
        });
        debug!(
            target: "rts::scrub::rtsummary",
            staging_bytes = len,
            staging = %ctx.staging.mode(),
            "staging ready"
        );

        let stage = self.stages(&mut ctx, cached, source)?;
        let (result, stats) = ctx.into_parts();

        info!(
            target: "rts::scrub::rtsummary",
            clean = result.is_clean(),
            stage = %stage,
            free_extents = stats.free_extents_recorded,
            blocks_compared = stats.summary_blocks_compared,
            "rtsummary scrub complete"
        );
        Ok(ScrubOutcome {
            result,
            stage,
            geometry: geo,
            stats,
        })
    }

    /// Run the checking stages; returns the stage that decided the verdict.
    fn stages(
        &self,
        ctx: &mut ScrubContext<'_>,
        cached: &RtGeometry,
        source: &dyn BitmapExtentSource,
    ) -> Result<ScrubStage> {
        let bitmap = self.vol.bitmap();
        let summary = self.vol.summary();
        let bitmap_id = StructureId::bitmap(bitmap.ino());

        let sizes = timed(ctx, ScrubStage::ValidateSizes, |ctx| {
            Ok(check_cached_geometry(ctx, cached, bitmap_id, summary))
        })?;
        if !sizes.passed() {
            return Ok(ScrubStage::ValidateSizes);
        }

        let forks = timed(ctx, ScrubStage::ValidateForks, |ctx| {
            check_summary_fork(ctx, summary)
        })?;
        if !forks.passed() {
            return Ok(ScrubStage::ValidateForks);
        }

        let recompute = timed(ctx, ScrubStage::Recompute, |ctx| {
            compute_summary(ctx, bitmap, source)
        })?;
        if recompute == RecomputeOutcome::BitmapCorrupt {
            return Ok(ScrubStage::Recompute);
        }

        let uuid = self.vol.metadata_uuid();
        let compare = timed(ctx, ScrubStage::Compare, |ctx| {
            compare_summary(ctx, summary, uuid)
        })?;
        if let CompareOutcome::Mismatch { .. } = compare {
            return Ok(ScrubStage::Compare);
        }
        Ok(ScrubStage::Done)
    }
}

/// Lock-holding convenience entry point with default wiring.
pub fn scrub_rtsummary(
    cx: &Cx,
    vol: &LockedRtVolume<'_>,
    options: &ScrubOptions,
) -> Result<ScrubOutcome> {
    RtSummaryScrubber::new(vol).with_options(*options).run(cx)
}

fn elapsed_micros(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_micros()).unwrap_or(u64::MAX)
}

fn timed<T>(
    ctx: &mut ScrubContext<'_>,
    stage: ScrubStage,
    run: impl FnOnce(&mut ScrubContext<'_>) -> Result<T>,
) -> Result<T> {
    debug!(target: "rts::scrub::rtsummary", stage = %stage, "stage start");
    let clock = Instant::now();
    let out = run(ctx);
    ctx.stats.stages.push(StageTiming {
        stage,
        micros: elapsed_micros(clock),
    });
    if let Err(err) = &out {
        warn!(
            target: "rts::scrub::rtsummary",
            stage = %stage,
            error = %err,
            "rtsummary scrub aborted"
        );
    }
    out
}
