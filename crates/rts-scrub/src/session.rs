//! Scrub session state: findings, the corruption sink, cancellation and
//! the per-session context every stage receives.

use crate::options::StagingMode;
use crate::staging::StagingStore;
use asupersync::Cx;
use rts_error::{Result, RtsError};
use rts_ondisk::{RtFileKind, RtGeometry};
use rts_types::{FileBlock, InodeNumber};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

// ── Findings ────────────────────────────────────────────────────────────────

/// Identity of a realtime metadata structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StructureId {
    pub kind: RtFileKind,
    pub ino: InodeNumber,
}

impl StructureId {
    #[must_use]
    pub fn bitmap(ino: InodeNumber) -> Self {
        Self {
            kind: RtFileKind::Bitmap,
            ino,
        }
    }

    #[must_use]
    pub fn summary(ino: InodeNumber) -> Self {
        Self {
            kind: RtFileKind::Summary,
            ino,
        }
    }
}

impl fmt::Display for StructureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (inode {})", self.kind, self.ino)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// The structure itself is damaged.
    Corrupt,
    /// Checking another structure showed this one to be damaged.
    CrossReferenceCorrupt,
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt => write!(f, "corrupt"),
            Self::CrossReferenceCorrupt => write!(f, "xref_corrupt"),
        }
    }
}

/// A single corruption finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubFinding {
    pub structure: StructureId,
    pub kind: FindingKind,
    /// Logical block of the structure at fault, when one is known.
    pub offset: Option<FileBlock>,
    pub detail: String,
}

impl fmt::Display for ScrubFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.structure, self.kind)?;
        if let Some(offset) = self.offset {
            write!(f, " at block {offset}")?;
        }
        write!(f, ": {}", self.detail)
    }
}

/// Receiver for corruption findings.
pub trait CorruptionSink {
    /// `structure` is damaged, optionally at a known logical block.
    fn flag_structure_corrupt(
        &mut self,
        structure: StructureId,
        offset: Option<FileBlock>,
        detail: String,
    );

    /// While checking one structure, `other` turned out to be damaged.
    fn flag_cross_structure_corrupt(&mut self, other: StructureId, detail: String);
}

/// Outcome flags of one scrub.
///
/// Holds at most one finding: the first one flagged. Later flags are
/// dropped so the result always names a single structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubResult {
    finding: Option<ScrubFinding>,
}

impl ScrubResult {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.finding.is_none()
    }

    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        self.finding.is_some()
    }

    #[must_use]
    pub fn finding(&self) -> Option<&ScrubFinding> {
        self.finding.as_ref()
    }

    /// The structure flagged, if any.
    #[must_use]
    pub fn flagged(&self) -> Option<StructureId> {
        self.finding.as_ref().map(|f| f.structure)
    }

    fn record(&mut self, finding: ScrubFinding) {
        if let Some(first) = &self.finding {
            debug!(
                target: "rts::scrub::rtsummary",
                first = %first,
                dropped = %finding,
                "finding already recorded"
            );
            return;
        }
        warn!(
            target: "rts::scrub::rtsummary",
            structure = %finding.structure,
            kind = %finding.kind,
            offset = finding.offset.map(|o| o.0),
            detail = %finding.detail,
            "corruption flagged"
        );
        self.finding = Some(finding);
    }
}

impl CorruptionSink for ScrubResult {
    fn flag_structure_corrupt(
        &mut self,
        structure: StructureId,
        offset: Option<FileBlock>,
        detail: String,
    ) {
        self.record(ScrubFinding {
            structure,
            kind: FindingKind::Corrupt,
            offset,
            detail,
        });
    }

    fn flag_cross_structure_corrupt(&mut self, other: StructureId, detail: String) {
        self.record(ScrubFinding {
            structure: other,
            kind: FindingKind::CrossReferenceCorrupt,
            offset: None,
            detail,
        });
    }
}

impl fmt::Display for ScrubResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.finding {
            None => write!(f, "clean"),
            Some(finding) => write!(f, "{finding}"),
        }
    }
}

// ── Cancellation ────────────────────────────────────────────────────────────

/// Cooperative stop request, polled once per record, block or mapping.
pub trait CancellationCheck {
    fn should_stop(&self) -> bool;
}

impl CancellationCheck for Cx {
    fn should_stop(&self) -> bool {
        self.checkpoint().is_err()
    }
}

/// Fail with `Cancelled` if `cx` is cancelled or `stop` asks to stop.
pub fn poll_stop(cx: &Cx, stop: Option<&dyn CancellationCheck>) -> Result<()> {
    cx.checkpoint().map_err(|_| RtsError::Cancelled)?;
    if stop.is_some_and(|stop| stop.should_stop()) {
        return Err(RtsError::Cancelled);
    }
    Ok(())
}

// ── Stages and statistics ───────────────────────────────────────────────────

/// Orchestrator states, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrubStage {
    Setup,
    ValidateSizes,
    ValidateForks,
    Recompute,
    Compare,
    Done,
}

impl fmt::Display for ScrubStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Setup => "setup",
            Self::ValidateSizes => "validate_sizes",
            Self::ValidateForks => "validate_forks",
            Self::Recompute => "recompute",
            Self::Compare => "compare",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: ScrubStage,
    pub micros: u64,
}

/// Work counters for one scrub.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubStats {
    pub free_extents_recorded: u64,
    pub fork_mappings_checked: u64,
    pub summary_blocks_compared: u64,
    pub staging_bytes: u64,
    pub staging_mode: Option<StagingMode>,
    pub stages: Vec<StageTiming>,
}

// ── Session context ─────────────────────────────────────────────────────────

/// Everything a stage needs, passed explicitly.
pub struct ScrubContext<'a> {
    cx: &'a Cx,
    stop: Option<&'a dyn CancellationCheck>,
    pub geo: RtGeometry,
    pub result: ScrubResult,
    pub staging: Box<dyn StagingStore>,
    pub stats: ScrubStats,
}

impl fmt::Debug for ScrubContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScrubContext")
            .field("geo", &self.geo)
            .field("result", &self.result)
            .field("staging_len", &self.staging.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<'a> ScrubContext<'a> {
    #[must_use]
    pub fn new(
        cx: &'a Cx,
        stop: Option<&'a dyn CancellationCheck>,
        geo: RtGeometry,
        staging: Box<dyn StagingStore>,
    ) -> Self {
        let stats = ScrubStats {
            staging_bytes: staging.len(),
            staging_mode: Some(staging.mode()),
            ..ScrubStats::default()
        };
        Self {
            cx,
            stop,
            geo,
            result: ScrubResult::default(),
            staging,
            stats,
        }
    }

    #[must_use]
    pub fn cx(&self) -> &'a Cx {
        self.cx
    }

    /// Fail with `Cancelled` if the context or the stop check asks to stop.
    pub fn checkpoint(&self) -> Result<()> {
        poll_stop(self.cx, self.stop)
    }

    /// The stop check, detached from the context so a walk can poll it
    /// while the context is mutably borrowed.
    #[must_use]
    pub fn stop_check(&self) -> Option<&'a dyn CancellationCheck> {
        self.stop
    }

    #[must_use]
    pub fn into_parts(self) -> (ScrubResult, ScrubStats) {
        (self.result, self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::MemStaging;
    use rts_ondisk::RtWordCodec;
    use rts_types::BlockSize;
    use std::cell::Cell;
    use std::num::NonZeroU32;

    const SUMMARY: StructureId = StructureId {
        kind: RtFileKind::Summary,
        ino: InodeNumber(130),
    };

    #[test]
    fn first_finding_wins() {
        let mut result = ScrubResult::default();
        assert!(result.is_clean());
        result.flag_structure_corrupt(SUMMARY, Some(FileBlock(3)), "word mismatch".into());
        result.flag_cross_structure_corrupt(StructureId::bitmap(InodeNumber(129)), "late".into());
        assert!(result.is_corrupt());
        assert_eq!(result.flagged(), Some(SUMMARY));
        let finding = result.finding().expect("finding");
        assert_eq!(finding.kind, FindingKind::Corrupt);
        assert_eq!(finding.offset, Some(FileBlock(3)));
    }

    #[test]
    fn finding_display() {
        let finding = ScrubFinding {
            structure: SUMMARY,
            kind: FindingKind::Corrupt,
            offset: Some(FileBlock(7)),
            detail: "mismatch".into(),
        };
        assert_eq!(
            finding.to_string(),
            "rtsummary (inode 130) corrupt at block 7: mismatch"
        );
        let xref = ScrubFinding {
            structure: StructureId::bitmap(InodeNumber(129)),
            kind: FindingKind::CrossReferenceCorrupt,
            offset: None,
            detail: "extent out of range".into(),
        };
        assert_eq!(
            xref.to_string(),
            "rtbitmap (inode 129) xref_corrupt: extent out of range"
        );
        assert_eq!(ScrubResult::default().to_string(), "clean");
    }

    struct StopAfter {
        polls: Cell<u32>,
        limit: u32,
    }

    impl CancellationCheck for StopAfter {
        fn should_stop(&self) -> bool {
            self.polls.set(self.polls.get() + 1);
            self.polls.get() > self.limit
        }
    }

    fn geometry() -> RtGeometry {
        RtGeometry::derive(
            1024,
            BlockSize::new(4096).expect("bs"),
            NonZeroU32::new(1).expect("rextsize"),
            RtWordCodec::Legacy,
        )
    }

    #[test]
    fn checkpoint_polls_stop_check() {
        let cx = Cx::for_testing();
        let stop = StopAfter {
            polls: Cell::new(0),
            limit: 2,
        };
        let staging = Box::new(MemStaging::new(4096).expect("staging"));
        let ctx = ScrubContext::new(&cx, Some(&stop), geometry(), staging);
        ctx.checkpoint().expect("first");
        ctx.checkpoint().expect("second");
        assert!(matches!(ctx.checkpoint(), Err(RtsError::Cancelled)));
    }

    #[test]
    fn context_records_staging_stats() {
        let cx = Cx::for_testing();
        let staging = Box::new(MemStaging::new(4096).expect("staging"));
        let ctx = ScrubContext::new(&cx, None, geometry(), staging);
        ctx.checkpoint().expect("no stop check");
        let (result, stats) = ctx.into_parts();
        assert!(result.is_clean());
        assert_eq!(stats.staging_bytes, 4096);
        assert_eq!(stats.staging_mode, Some(StagingMode::Memory));
    }

    #[test]
    fn stage_order() {
        assert!(ScrubStage::Setup < ScrubStage::ValidateSizes);
        assert!(ScrubStage::Recompute < ScrubStage::Compare);
        assert_eq!(ScrubStage::ValidateForks.to_string(), "validate_forks");
    }
}
