//! Append-only JSONL evidence ledger for scrub runs.
//!
//! Every finding, completed scrub and aborted scrub produces a durable,
//! auditable [`EvidenceRecord`], one JSON object per line. A repair tool
//! run later reads the ledger to learn which structure to rebuild.
//!
//! # Usage
//!
//! ```ignore
//! let mut ledger = EvidenceLedger::new(file);
//! for record in EvidenceRecord::from_outcome(uuid, &outcome) {
//!     ledger.append(&record)?;
//! }
//! ```

use crate::rtsummary::ScrubOutcome;
use crate::session::{FindingKind, ScrubFinding, ScrubStage};
use rts_error::RtsError;
use rts_ondisk::RtFileKind;
use rts_types::VolumeUuid;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};

// ── Timestamp ───────────────────────────────────────────────────────────────

/// Wall-clock nanoseconds since the Unix epoch; 0 if the clock is unusable.
fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

// ── Event type ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceEventType {
    /// A structure was found damaged while checking it.
    CorruptionDetected,
    /// A structure was found damaged while checking another one.
    CrossReferenceCorrupt,
    /// A scrub reached a verdict.
    ScrubCycleComplete,
    /// A scrub stopped without a verdict.
    ScrubAborted,
}

// ── Detail structs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptionDetail {
    pub structure: RtFileKind,
    pub inode: u64,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubCycleDetail {
    pub clean: bool,
    /// Stage that decided the verdict.
    pub stage: ScrubStage,
    pub free_extents_recorded: u64,
    pub summary_blocks_compared: u64,
    pub fork_mappings_checked: u64,
    pub staging_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubAbortedDetail {
    pub errno: i32,
    pub error: String,
}

// ── Evidence record ─────────────────────────────────────────────────────────

/// One line of the ledger. Only the detail matching `event_type` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub timestamp_ns: u64,
    pub event_type: EvidenceEventType,
    /// Volume uuid, hyphenated.
    pub volume: String,
    /// Affected logical blocks `(start, end_exclusive)` of the structure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_range: Option<(u64, u64)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corruption: Option<CorruptionDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scrub_cycle: Option<ScrubCycleDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<ScrubAbortedDetail>,
}

impl EvidenceRecord {
    fn base(event_type: EvidenceEventType, volume: VolumeUuid) -> Self {
        Self {
            timestamp_ns: now_ns(),
            event_type,
            volume: volume.to_string(),
            block_range: None,
            corruption: None,
            scrub_cycle: None,
            aborted: None,
        }
    }

    #[must_use]
    pub fn corruption_detected(volume: VolumeUuid, detail: CorruptionDetail) -> Self {
        let mut r = Self::base(EvidenceEventType::CorruptionDetected, volume);
        r.corruption = Some(detail);
        r
    }

    #[must_use]
    pub fn cross_reference_corrupt(volume: VolumeUuid, detail: CorruptionDetail) -> Self {
        let mut r = Self::base(EvidenceEventType::CrossReferenceCorrupt, volume);
        r.corruption = Some(detail);
        r
    }

    #[must_use]
    pub fn scrub_cycle_complete(volume: VolumeUuid, detail: ScrubCycleDetail) -> Self {
        let mut r = Self::base(EvidenceEventType::ScrubCycleComplete, volume);
        r.scrub_cycle = Some(detail);
        r
    }

    /// Record a scrub that ended in an error.
    #[must_use]
    pub fn scrub_aborted(volume: VolumeUuid, err: &RtsError) -> Self {
        let mut r = Self::base(EvidenceEventType::ScrubAborted, volume);
        r.aborted = Some(ScrubAbortedDetail {
            errno: err.to_errno(),
            error: err.to_string(),
        });
        r
    }

    fn from_finding(volume: VolumeUuid, finding: &ScrubFinding) -> Self {
        let detail = CorruptionDetail {
            structure: finding.structure.kind,
            inode: finding.structure.ino.0,
            detail: finding.detail.clone(),
        };
        let r = match finding.kind {
            FindingKind::Corrupt => Self::corruption_detected(volume, detail),
            FindingKind::CrossReferenceCorrupt => Self::cross_reference_corrupt(volume, detail),
        };
        match finding.offset {
            Some(off) => r.with_block_range(off.0, off.0.saturating_add(1)),
            None => r,
        }
    }

    /// The finding, if any, followed by the cycle summary.
    #[must_use]
    pub fn from_outcome(volume: VolumeUuid, outcome: &ScrubOutcome) -> Vec<Self> {
        let mut records: Vec<Self> = outcome
            .result
            .finding()
            .map(|f| Self::from_finding(volume, f))
            .into_iter()
            .collect();
        let stats = &outcome.stats;
        records.push(Self::scrub_cycle_complete(
            volume,
            ScrubCycleDetail {
                clean: outcome.is_clean(),
                stage: outcome.stage,
                free_extents_recorded: stats.free_extents_recorded,
                summary_blocks_compared: stats.summary_blocks_compared,
                fork_mappings_checked: stats.fork_mappings_checked,
                staging_bytes: stats.staging_bytes,
            },
        ));
        records
    }

    #[must_use]
    pub fn with_block_range(mut self, start: u64, end: u64) -> Self {
        self.block_range = Some((start, end));
        self
    }

    /// Override the auto-generated timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp_ns: u64) -> Self {
        self.timestamp_ns = timestamp_ns;
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ── JSONL ledger ────────────────────────────────────────────────────────────

/// Append-only JSONL writer; every append is one flushed line.
pub struct EvidenceLedger<W: Write> {
    writer: W,
}

impl<W: Write> EvidenceLedger<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn append(&mut self, record: &EvidenceRecord) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    #[must_use]
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Parse every record from JSONL data, skipping blank and torn lines.
#[must_use]
pub fn parse_evidence_ledger(data: &[u8]) -> Vec<EvidenceRecord> {
    let text = String::from_utf8_lossy(data);
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CorruptionSink, ScrubResult, ScrubStats, StructureId};
    use rts_ondisk::{RtGeometry, RtWordCodec};
    use rts_types::{BlockSize, FileBlock, InodeNumber};
    use std::num::NonZeroU32;

    const UUID: VolumeUuid = VolumeUuid([0x11; 16]);

    fn outcome(result: ScrubResult, stage: ScrubStage) -> ScrubOutcome {
        ScrubOutcome {
            result,
            stage,
            geometry: RtGeometry::derive(
                1024,
                BlockSize::new(4096).expect("bs"),
                NonZeroU32::new(1).expect("rextsize"),
                RtWordCodec::Legacy,
            ),
            stats: ScrubStats {
                free_extents_recorded: 12,
                summary_blocks_compared: 1,
                fork_mappings_checked: 1,
                staging_bytes: 4096,
                ..ScrubStats::default()
            },
        }
    }

    #[test]
    fn clean_outcome_is_one_cycle_record() {
        let clean = outcome(ScrubResult::default(), ScrubStage::Done);
        let records = EvidenceRecord::from_outcome(UUID, &clean);
        assert_eq!(records.len(), 1);
        let cycle = records[0].scrub_cycle.as_ref().expect("cycle");
        assert!(cycle.clean);
        assert_eq!(cycle.stage, ScrubStage::Done);
        assert_eq!(cycle.free_extents_recorded, 12);
        assert_eq!(records[0].volume, UUID.to_string());
    }

    #[test]
    fn summary_mismatch_carries_block_range() {
        let mut result = ScrubResult::default();
        result.flag_structure_corrupt(
            StructureId::summary(InodeNumber(130)),
            Some(FileBlock(4)),
            "word 2 holds 1, recomputed 0".into(),
        );
        let records = EvidenceRecord::from_outcome(UUID, &outcome(result, ScrubStage::Compare));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event_type, EvidenceEventType::CorruptionDetected);
        assert_eq!(records[0].block_range, Some((4, 5)));
        let detail = records[0].corruption.as_ref().expect("detail");
        assert_eq!(detail.structure, RtFileKind::Summary);
        assert_eq!(detail.inode, 130);
        assert!(!records[1].scrub_cycle.as_ref().expect("cycle").clean);
    }

    #[test]
    fn bitmap_cross_reference_event() {
        let mut result = ScrubResult::default();
        result.flag_cross_structure_corrupt(
            StructureId::bitmap(InodeNumber(129)),
            "free extent out of range".into(),
        );
        let records = EvidenceRecord::from_outcome(UUID, &outcome(result, ScrubStage::Recompute));
        assert_eq!(records[0].event_type, EvidenceEventType::CrossReferenceCorrupt);
        assert!(records[0].block_range.is_none());
    }

    #[test]
    fn aborted_record_keeps_errno() {
        let record = EvidenceRecord::scrub_aborted(UUID, &RtsError::Cancelled).with_timestamp(5);
        let parsed = EvidenceRecord::from_json(&record.to_json().expect("json")).expect("parse");
        assert_eq!(parsed, record);
        assert_eq!(
            parsed.aborted.as_ref().map(|a| a.errno),
            Some(RtsError::Cancelled.to_errno())
        );
        assert!(parsed.corruption.is_none());
    }

    #[test]
    fn omitted_details_are_not_serialized() {
        let record = EvidenceRecord::scrub_aborted(UUID, &RtsError::NoMemory("staging".into()));
        let json = record.to_json().expect("json");
        assert!(json.contains("\"event_type\":\"scrub_aborted\""));
        assert!(!json.contains("corruption"));
        assert!(!json.contains("block_range"));
    }

    #[test]
    fn ledger_round_trip_skips_torn_lines() {
        let mut ledger = EvidenceLedger::new(Vec::new());
        let clean = outcome(ScrubResult::default(), ScrubStage::Done);
        let records = EvidenceRecord::from_outcome(UUID, &clean);
        for record in &records {
            ledger.append(record).expect("append");
        }
        ledger
            .append(&EvidenceRecord::scrub_aborted(UUID, &RtsError::Cancelled))
            .expect("append");
        let mut bytes = ledger.into_inner();
        bytes.extend_from_slice(b"\n   \n{\"timestamp_ns\":1,\"event_ty");

        let parsed = parse_evidence_ledger(&bytes);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], records[0]);
        assert_eq!(parsed[1].event_type, EvidenceEventType::ScrubAborted);
    }
}
