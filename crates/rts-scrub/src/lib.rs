#![forbid(unsafe_code)]
//! Realtime summary scrub engine.
//!
//! The summary counts, for every bitmap block and every power-of-two length
//! class, the free extents of that class starting in that block. It is a
//! pure accelerator derived from the bitmap, so the scrub rebuilds it from
//! scratch and compares the result against the persisted copy.
//!
//! ## Stages
//!
//! 1. **Setup**: derive geometry and allocate staging ([`staging`]).
//! 2. **ValidateSizes**: cached geometry and summary size ([`validate`]).
//! 3. **ValidateForks**: every summary block below EOF is written.
//! 4. **Recompute**: tally every free extent ([`recompute`]).
//! 5. **Compare**: block-exact comparison ([`compare`]).
//!
//! [`RtSummaryScrubber`] drives the stages over a [`LockedRtVolume`].
//! Findings name the structure at fault; errors mean no verdict.

pub mod compare;
pub mod evidence;
pub mod options;
pub mod recompute;
pub mod rtsummary;
pub mod session;
pub mod staging;
pub mod validate;
pub mod volume;

pub use evidence::{EvidenceLedger, EvidenceRecord, parse_evidence_ledger};
pub use options::{ScrubOptions, StagingMode};
pub use rtsummary::{RtSummaryScrubber, ScrubOutcome, scrub_rtsummary};
pub use session::{
    CancellationCheck, CorruptionSink, FindingKind, ScrubContext, ScrubFinding, ScrubResult,
    ScrubStage, ScrubStats, StructureId,
};
pub use staging::{MemStaging, SpillStaging, StagingStore, open_staging};
pub use volume::{LockedRtVolume, RtVolume};
