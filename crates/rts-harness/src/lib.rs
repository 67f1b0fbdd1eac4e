#![forbid(unsafe_code)]
//! Synthetic realtime volumes for exercising the summary scrubber.
//!
//! [`VolumeBuilder`] lays out a superblock, a bitmap and a summary for a
//! list of free extents. The summary is tallied here with a plain
//! `BTreeMap` and a geometry computed from first principles, never with
//! the scrub engine, so a clean scrub of a built volume is real evidence.
//! [`SyntheticVolume`] then offers hooks to damage specific words, headers,
//! sizes and mappings.

use anyhow::{Context, Result, bail, ensure};
use rts_block::{ByteBlockDevice, MemByteDevice};
use rts_extent::{ExtentList, MappedExtent, MetaFile};
use rts_ondisk::{
    IncompatFeatures, RtFileKind, RtSuperblock, RtWordCodec, SB_VERSION_5, stamp_rtbuf,
};
use rts_scrub::RtVolume;
use rts_types::{BlockSize, InodeNumber, VolumeUuid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const RBMINO: InodeNumber = InodeNumber(129);
pub const RSUMINO: InodeNumber = InodeNumber(130);
pub const SYNTHETIC_UUID: VolumeUuid = VolumeUuid([
    0x5c, 0x0f, 0xfe, 0xe0, 0x12, 0x34, 0x40, 0x00, 0x80, 0x00, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45,
]);

const HEADER_LEN: u64 = 48;
const WORD: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeFormat {
    /// Host-order words, headerless blocks.
    Legacy,
    /// Big-endian words behind a 48-byte block header.
    Current,
}

impl VolumeFormat {
    #[must_use]
    pub fn header_len(self) -> u64 {
        match self {
            Self::Legacy => 0,
            Self::Current => HEADER_LEN,
        }
    }

    #[must_use]
    pub fn codec(self) -> RtWordCodec {
        match self {
            Self::Legacy => RtWordCodec::Legacy,
            Self::Current => RtWordCodec::BigEndian,
        }
    }

    fn encode(self, value: u32) -> [u8; 4] {
        match self {
            Self::Legacy => value.to_ne_bytes(),
            Self::Current => value.to_be_bytes(),
        }
    }

    fn decode(self, raw: [u8; 4]) -> u32 {
        match self {
            Self::Legacy => u32::from_ne_bytes(raw),
            Self::Current => u32::from_be_bytes(raw),
        }
    }
}

// ── Reference model ─────────────────────────────────────────────────────────

/// Realtime geometry worked out longhand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceGeometry {
    pub block_size: u64,
    pub header_len: u64,
    pub words_per_block: u64,
    pub bits_per_block: u64,
    pub rextents: u64,
    pub rbmblocks: u64,
    pub rsumlevels: u32,
    pub rsumblocks: u64,
}

impl ReferenceGeometry {
    #[must_use]
    pub fn compute(rblocks: u64, block_size: u32, rextsize: u32, format: VolumeFormat) -> Self {
        let block_size = u64::from(block_size);
        let header_len = format.header_len();
        let words_per_block = (block_size - header_len) / WORD;
        let bits_per_block = words_per_block * 32;
        let mut geo = Self {
            block_size,
            header_len,
            words_per_block,
            bits_per_block,
            rextents: 0,
            rbmblocks: 0,
            rsumlevels: 0,
            rsumblocks: 0,
        };
        if rblocks == 0 {
            return geo;
        }
        geo.rextents = rblocks / u64::from(rextsize);
        geo.rbmblocks = geo.rextents.div_ceil(bits_per_block);
        let mut levels = 1;
        let mut n = geo.rextents;
        while n > 1 {
            n >>= 1;
            levels += 1;
        }
        geo.rsumlevels = levels;
        geo.rsumblocks = (u64::from(levels) * geo.rbmblocks).div_ceil(words_per_block);
        geo
    }

    /// Image block and byte offset within that block of summary cell
    /// `(lenlog, bbno)`.
    #[must_use]
    pub fn cell_location(&self, lenlog: u32, bbno: u64) -> (u64, u64) {
        let word = u64::from(lenlog) * self.rbmblocks + bbno;
        let block = word / self.words_per_block;
        let within = self.header_len + (word % self.words_per_block) * WORD;
        (block, within)
    }
}

/// Summary counters keyed by `(length class, bitmap block)`.
pub type SummaryCells = BTreeMap<(u32, u64), u32>;

/// Tally free runs into summary cells.
#[must_use]
pub fn reference_tally(geo: &ReferenceGeometry, runs: &[(u64, u64)]) -> SummaryCells {
    let mut cells = SummaryCells::new();
    for &(start, count) in runs {
        if count == 0 {
            continue;
        }
        let lenlog = 63 - count.leading_zeros();
        let bbno = start / geo.bits_per_block;
        let cell = cells.entry((lenlog, bbno)).or_insert(0);
        *cell = cell.wrapping_add(1);
    }
    cells
}

/// Sort free extents and merge touching ones into maximal runs, the way
/// a bitmap walk reports them.
pub fn normalize_runs(free: &[(u64, u64)]) -> Result<Vec<(u64, u64)>> {
    let mut sorted = free.to_vec();
    sorted.sort_unstable();
    let mut runs: Vec<(u64, u64)> = Vec::with_capacity(sorted.len());
    for (start, count) in sorted {
        ensure!(count > 0, "free extent at {start} has zero length");
        let end = start
            .checked_add(count)
            .with_context(|| format!("free extent at {start} overflows"))?;
        if let Some(last) = runs.last_mut() {
            let last_end = last.0 + last.1;
            if start < last_end {
                bail!("free extents [{}, +{}) and [{start}, +{count}) overlap", last.0, last.1);
            }
            if start == last_end {
                last.1 += count;
                continue;
            }
        }
        debug_assert!(end > start);
        runs.push((start, count));
    }
    Ok(runs)
}

// ── Builder ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VolumeBuilder {
    rblocks: u64,
    block_size: u32,
    rextsize: u32,
    format: VolumeFormat,
    sector_size: u16,
    free: Vec<(u64, u64)>,
    summary_slack_blocks: u64,
}

impl VolumeBuilder {
    /// A fully allocated volume of `rblocks` realtime blocks, 4 KiB blocks,
    /// one block per extent, legacy format.
    #[must_use]
    pub fn new(rblocks: u64) -> Self {
        Self {
            rblocks,
            block_size: 4096,
            rextsize: 1,
            format: VolumeFormat::Legacy,
            sector_size: 512,
            free: Vec::new(),
            summary_slack_blocks: 0,
        }
    }

    #[must_use]
    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    #[must_use]
    pub fn rextsize(mut self, rextsize: u32) -> Self {
        self.rextsize = rextsize;
        self
    }

    #[must_use]
    pub fn format(mut self, format: VolumeFormat) -> Self {
        self.format = format;
        self
    }

    /// Superblock sector size; the dumped superblock is this long.
    #[must_use]
    pub fn sector_size(mut self, sector_size: u16) -> Self {
        self.sector_size = sector_size;
        self
    }

    /// Mark `count` extents starting at extent `start` free.
    #[must_use]
    pub fn free(mut self, start: u64, count: u64) -> Self {
        self.free.push((start, count));
        self
    }

    #[must_use]
    pub fn free_extents(mut self, extents: &[(u64, u64)]) -> Self {
        self.free.extend_from_slice(extents);
        self
    }

    /// Allocate the summary file `blocks` larger than required, as after a
    /// grow that has not yet added extents.
    #[must_use]
    pub fn summary_slack(mut self, blocks: u64) -> Self {
        self.summary_slack_blocks = blocks;
        self
    }

    pub fn build(&self) -> Result<SyntheticVolume> {
        ensure!(self.rextsize > 0, "extent size must be nonzero");
        let block_size = BlockSize::new(self.block_size)
            .with_context(|| format!("block size {}", self.block_size))?;
        let format = self.format;
        let reference =
            ReferenceGeometry::compute(self.rblocks, self.block_size, self.rextsize, format);

        let runs = normalize_runs(&self.free)?;
        if let Some(&(start, count)) = runs.last() {
            ensure!(
                start + count <= reference.rextents,
                "free extent [{start}, +{count}) beyond {} extents",
                reference.rextents
            );
        }

        let bs = usize::try_from(reference.block_size)?;
        let bitmap_blocks = reference.rbmblocks;
        let summary_blocks = reference.rsumblocks + self.summary_slack_blocks;
        let mut vol = SyntheticVolume {
            sb: RtSuperblock {
                block_size,
                blocklog: u8::try_from(block_size.shift())?,
                sectsize: self.sector_size,
                dblocks: 1 << 20,
                rblocks: self.rblocks,
                rextents: reference.rextents,
                rextsize: self.rextsize,
                rbmblocks: u32::try_from(reference.rbmblocks)?,
                rextslog: u8::try_from(reference.rsumlevels.saturating_sub(1))?,
                frextents: runs.iter().map(|r| r.1).sum(),
                rbmino: RBMINO,
                rsumino: RSUMINO,
                rgcount: u32::from(format == VolumeFormat::Current),
                uuid: SYNTHETIC_UUID,
                meta_uuid: SYNTHETIC_UUID,
                fname: "synthetic".into(),
                versionnum: SB_VERSION_5,
                features_incompat: match format {
                    VolumeFormat::Legacy => IncompatFeatures::default(),
                    VolumeFormat::Current => IncompatFeatures::METADIR,
                },
                crc: 0,
            },
            format,
            reference,
            runs: Vec::new(),
            bitmap_image: vec![0; bs * usize::try_from(bitmap_blocks)?],
            summary_image: vec![0; bs * usize::try_from(summary_blocks)?],
            bitmap_fork: ExtentList::identity(bitmap_blocks)?,
            summary_fork: ExtentList::identity(summary_blocks)?,
            bitmap_size: bitmap_blocks * reference.block_size,
            summary_size: summary_blocks * reference.block_size,
        };

        for &(start, count) in &runs {
            vol.set_bitmap_bits(start, count);
        }
        vol.runs = runs;
        for ((lenlog, bbno), value) in vol.cells() {
            vol.write_cell(lenlog, bbno, value);
        }
        vol.restamp_all()?;
        Ok(vol)
    }
}

// ── Synthetic volume ────────────────────────────────────────────────────────

/// Images and mappings of one synthetic volume. Fields are public so tests
/// can damage anything; the hook methods keep block headers consistent
/// when the damage is meant to be in the payload only.
#[derive(Debug, Clone)]
pub struct SyntheticVolume {
    pub sb: RtSuperblock,
    pub format: VolumeFormat,
    pub reference: ReferenceGeometry,
    /// Maximal free runs encoded in the bitmap.
    pub runs: Vec<(u64, u64)>,
    pub bitmap_image: Vec<u8>,
    pub summary_image: Vec<u8>,
    pub bitmap_fork: ExtentList,
    pub summary_fork: ExtentList,
    pub bitmap_size: u64,
    pub summary_size: u64,
}

/// A volume wired onto in-memory devices.
#[derive(Debug)]
pub struct MountedVolume {
    pub volume: RtVolume,
    pub bitmap_dev: MemByteDevice,
    pub summary_dev: MemByteDevice,
}

/// Paths of a volume dumped to disk.
#[derive(Debug, Clone)]
pub struct DumpPaths {
    pub superblock: PathBuf,
    pub bitmap: PathBuf,
    pub summary: PathBuf,
}

impl SyntheticVolume {
    fn bs(&self) -> usize {
        // Built from a validated BlockSize.
        usize::try_from(self.reference.block_size).unwrap_or(usize::MAX)
    }

    /// Expected summary contents for the bitmap's free runs.
    #[must_use]
    pub fn cells(&self) -> SummaryCells {
        reference_tally(&self.reference, &self.runs)
    }

    fn set_bitmap_bits(&mut self, start: u64, count: u64) {
        let bs = self.bs();
        let geo = self.reference;
        for rtx in start..start + count {
            let block = usize::try_from(rtx / geo.bits_per_block).unwrap_or(usize::MAX);
            let bit = rtx % geo.bits_per_block;
            let within = usize::try_from(geo.header_len + (bit / 32) * WORD).unwrap_or(usize::MAX);
            let at = block * bs + within;
            let mut raw = [0; 4];
            raw.copy_from_slice(&self.bitmap_image[at..at + 4]);
            let word = self.format.decode(raw) | (1 << (bit % 32));
            self.bitmap_image[at..at + 4].copy_from_slice(&self.format.encode(word));
        }
    }

    fn write_cell(&mut self, lenlog: u32, bbno: u64, value: u32) -> u64 {
        let (block, within) = self.reference.cell_location(lenlog, bbno);
        let at = usize::try_from(block * self.reference.block_size + within).unwrap_or(usize::MAX);
        self.summary_image[at..at + 4].copy_from_slice(&self.format.encode(value));
        block
    }

    fn restamp(image: &mut [u8], bs: usize, kind: RtFileKind, owner: InodeNumber) -> Result<()> {
        for (i, block) in image.chunks_exact_mut(bs).enumerate() {
            stamp_rtbuf(block, kind, owner, i as u64, SYNTHETIC_UUID)
                .with_context(|| format!("stamp {kind} block {i}"))?;
        }
        Ok(())
    }

    fn restamp_all(&mut self) -> Result<()> {
        if self.format == VolumeFormat::Current {
            let bs = self.bs();
            Self::restamp(&mut self.bitmap_image, bs, RtFileKind::Bitmap, RBMINO)?;
            Self::restamp(&mut self.summary_image, bs, RtFileKind::Summary, RSUMINO)?;
        }
        Ok(())
    }

    // ── Damage hooks ────────────────────────────────────────────────────

    /// Overwrite summary cell `(lenlog, bbno)`; returns its logical block.
    pub fn set_summary_cell(&mut self, lenlog: u32, bbno: u64, value: u32) -> Result<u64> {
        ensure!(lenlog < self.reference.rsumlevels, "length class {lenlog} out of range");
        ensure!(bbno < self.reference.rbmblocks, "bitmap block {bbno} out of range");
        let block = self.write_cell(lenlog, bbno, value);
        self.restamp_all()?;
        Ok(block)
    }

    /// Free extents in the bitmap without updating the summary.
    pub fn free_in_bitmap_only(&mut self, start: u64, count: u64) -> Result<()> {
        let mut runs = self.runs.clone();
        runs.push((start, count));
        self.runs = normalize_runs(&runs)?;
        self.set_bitmap_bits(start, count);
        self.restamp_all()
    }

    /// Break the uuid in one summary block header.
    pub fn corrupt_summary_header(&mut self, block: u64) {
        let at = usize::try_from(block).unwrap_or(usize::MAX) * self.bs() + 32;
        self.summary_image[at] ^= 0xFF;
    }

    /// Break the magic of one bitmap block header.
    pub fn corrupt_bitmap_header(&mut self, block: u64) {
        let at = usize::try_from(block).unwrap_or(usize::MAX) * self.bs();
        self.bitmap_image[at] ^= 0xFF;
    }

    /// Replace a summary block's mapping with a hole.
    pub fn punch_summary_hole(&mut self, block: u64) -> Result<()> {
        let blocks = self.summary_size / self.reference.block_size;
        ensure!(block < blocks, "block {block} beyond the summary");
        let mut extents = Vec::new();
        if block > 0 {
            extents.push(MappedExtent::written(0, 0, block));
        }
        if block + 1 < blocks {
            extents.push(MappedExtent::written(block + 1, block + 1, blocks - block - 1));
        }
        self.summary_fork = ExtentList::new(extents)?;
        Ok(())
    }

    /// Turn a summary block's mapping into a preallocated, unwritten one.
    pub fn mark_summary_unwritten(&mut self, block: u64) -> Result<()> {
        let blocks = self.summary_size / self.reference.block_size;
        ensure!(block < blocks, "block {block} beyond the summary");
        let mut extents = vec![MappedExtent::unwritten(block, block, 1)];
        if block > 0 {
            extents.push(MappedExtent::written(0, 0, block));
        }
        if block + 1 < blocks {
            extents.push(MappedExtent::written(block + 1, block + 1, blocks - block - 1));
        }
        self.summary_fork = ExtentList::new(extents)?;
        Ok(())
    }

    /// Map one extra summary block past EOF.
    pub fn map_summary_past_eof(&mut self) -> Result<()> {
        let blocks = self.summary_size / self.reference.block_size;
        self.summary_fork = ExtentList::identity(blocks + 1)?;
        Ok(())
    }

    // ── Outputs ─────────────────────────────────────────────────────────

    pub fn superblock_sector(&self) -> Result<Vec<u8>> {
        Ok(self.sb.encode_sector()?)
    }

    fn meta_file(
        ino: InodeNumber,
        size: u64,
        fork: &ExtentList,
        dev: &MemByteDevice,
        block_size: u32,
    ) -> Result<MetaFile> {
        let blocks = ByteBlockDevice::new(dev.clone(), block_size)?;
        Ok(MetaFile::new(
            ino,
            size,
            Arc::new(fork.clone()),
            Arc::new(blocks),
        ))
    }

    /// Wire the images onto in-memory devices.
    pub fn mount(&self) -> Result<MountedVolume> {
        let bs = self.sb.block_size.get();
        let bitmap_dev = MemByteDevice::from_bytes(self.bitmap_image.clone());
        let summary_dev = MemByteDevice::from_bytes(self.summary_image.clone());
        let bitmap = Self::meta_file(RBMINO, self.bitmap_size, &self.bitmap_fork, &bitmap_dev, bs)?;
        let summary =
            Self::meta_file(RSUMINO, self.summary_size, &self.summary_fork, &summary_dev, bs)?;
        let volume = RtVolume::new(self.sb.clone(), bitmap, summary)?;
        Ok(MountedVolume {
            volume,
            bitmap_dev,
            summary_dev,
        })
    }

    /// Dump superblock, bitmap and summary into `dir`, each file sized to
    /// the recorded file size.
    pub fn write_dump(&self, dir: &Path) -> Result<DumpPaths> {
        let paths = DumpPaths {
            superblock: dir.join("superblock.bin"),
            bitmap: dir.join("rtbitmap.bin"),
            summary: dir.join("rtsummary.bin"),
        };
        let sized = |image: &[u8], size: u64| -> Result<Vec<u8>> {
            let mut out = image.to_vec();
            out.resize(usize::try_from(size)?, 0);
            Ok(out)
        };
        fs::write(&paths.superblock, self.superblock_sector()?)
            .with_context(|| format!("write {}", paths.superblock.display()))?;
        fs::write(&paths.bitmap, sized(&self.bitmap_image, self.bitmap_size)?)
            .with_context(|| format!("write {}", paths.bitmap.display()))?;
        fs::write(&paths.summary, sized(&self.summary_image, self.summary_size)?)
            .with_context(|| format!("write {}", paths.summary.display()))?;
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rts_ondisk::RtGeometry;
    use std::num::NonZeroU32;

    #[test]
    fn reference_geometry_agrees_with_engine() {
        for format in [VolumeFormat::Legacy, VolumeFormat::Current] {
            for bs in [512_u32, 4096, 65536] {
                for rblocks in [0_u64, 1, 5, 1024, 40_000, 1 << 22] {
                    for rextsize in [1_u32, 4, 7] {
                        let reference = ReferenceGeometry::compute(rblocks, bs, rextsize, format);
                        let engine = RtGeometry::derive(
                            rblocks,
                            BlockSize::new(bs).expect("bs"),
                            NonZeroU32::new(rextsize).expect("rextsize"),
                            format.codec(),
                        );
                        let case = format!("{format:?} bs={bs} rblocks={rblocks} rextsize={rextsize}");
                        assert_eq!(reference.rextents, engine.rextents, "{case}");
                        assert_eq!(reference.rbmblocks, engine.rbmblocks, "{case}");
                        if rblocks > 0 {
                            assert_eq!(reference.rsumlevels, engine.rsumlevels, "{case}");
                        }
                        assert_eq!(reference.rsumblocks, engine.rsumblocks, "{case}");
                    }
                }
            }
        }
    }

    #[test]
    fn runs_are_merged_and_checked() {
        assert_eq!(
            normalize_runs(&[(10, 2), (0, 3), (3, 1), (12, 1)]).expect("runs"),
            vec![(0, 4), (10, 3)]
        );
        assert!(normalize_runs(&[(0, 4), (3, 1)]).is_err());
        assert!(normalize_runs(&[(5, 0)]).is_err());
    }

    #[test]
    fn tally_matches_two_extent_scenario() {
        let geo = ReferenceGeometry::compute(1024, 4096, 1, VolumeFormat::Legacy);
        let cells = reference_tally(&geo, &[(0, 3), (100, 1)]);
        assert_eq!(cells.len(), 2);
        assert_eq!(cells.get(&(1, 0)), Some(&1));
        assert_eq!(cells.get(&(0, 0)), Some(&1));
    }

    #[test]
    fn builder_writes_cells_into_summary_image() {
        let vol = VolumeBuilder::new(1024)
            .format(VolumeFormat::Current)
            .free(0, 3)
            .free(100, 1)
            .build()
            .expect("build");
        let (block, within) = vol.reference.cell_location(1, 0);
        assert_eq!(block, 0);
        let at = usize::try_from(within).expect("offset");
        assert_eq!(vol.summary_image[at..at + 4], [0, 0, 0, 1]);
        assert_eq!(vol.sb.frextents, 4);
        assert_eq!(vol.bitmap_size, 4096);
    }

    #[test]
    fn builder_rejects_extents_past_the_volume() {
        assert!(VolumeBuilder::new(1024).free(1000, 25).build().is_err());
        assert!(VolumeBuilder::new(1024).rextsize(0).build().is_err());
    }
}
