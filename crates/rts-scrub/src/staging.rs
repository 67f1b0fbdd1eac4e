//! Scratch storage for the recomputed summary.
//!
//! The recomputed index is as large as the persisted summary, which can
//! run to many megabytes on big volumes. [`StagingStore`] hides whether it
//! lives on the heap or in an unlinked temporary file.

use crate::options::{ScrubOptions, StagingMode};
use rts_error::{Result, RtsError};
use std::fs::File;
use std::os::unix::fs::FileExt;

/// Byte-addressable scratch area owned by one scrub session.
pub trait StagingStore: Send {
    /// Size in bytes, fixed at creation.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill `buf` from `offset`.
    fn load(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `offset`.
    fn store(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Which backend this is, for statistics and logs.
    fn mode(&self) -> StagingMode;
}

fn check_bounds(len: u64, offset: u64, count: usize) -> Result<()> {
    let end = u64::try_from(count)
        .ok()
        .and_then(|c| offset.checked_add(c));
    match end {
        Some(end) if end <= len => Ok(()),
        _ => Err(RtsError::Format(format!(
            "staging access [{offset}, +{count}) outside {len}-byte store"
        ))),
    }
}

// ── Heap staging ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct MemStaging {
    bytes: Vec<u8>,
}

impl MemStaging {
    /// Zero-filled buffer of `len` bytes; allocation failure is `NoMemory`.
    pub fn new(len: u64) -> Result<Self> {
        let size = usize::try_from(len).map_err(|_| {
            RtsError::NoMemory(format!("{len}-byte staging buffer exceeds address space"))
        })?;
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(size).map_err(|e| {
            RtsError::NoMemory(format!("{len}-byte staging buffer: {e}"))
        })?;
        bytes.resize(size, 0);
        Ok(Self { bytes })
    }

    fn range(&self, offset: u64, count: usize) -> Result<std::ops::Range<usize>> {
        check_bounds(self.len(), offset, count)?;
        // In bounds of a Vec, so it fits in usize.
        let start = usize::try_from(offset)
            .map_err(|_| RtsError::Format(format!("staging offset {offset} overflows")))?;
        Ok(start..start + count)
    }
}

impl StagingStore for MemStaging {
    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn load(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn store(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let range = self.range(offset, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn mode(&self) -> StagingMode {
        StagingMode::Memory
    }
}

// ── Spill staging ───────────────────────────────────────────────────────────

/// Staging in an anonymous temporary file, removed when dropped.
#[derive(Debug)]
pub struct SpillStaging {
    file: File,
    len: u64,
}

impl SpillStaging {
    pub fn new(len: u64) -> Result<Self> {
        let file = tempfile::tempfile()?;
        // Sparse: unwritten ranges read back as zeros.
        file.set_len(len)?;
        Ok(Self { file, len })
    }
}

impl StagingStore for SpillStaging {
    fn len(&self) -> u64 {
        self.len
    }

    fn load(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(self.len, offset, buf.len())?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn store(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        check_bounds(self.len, offset, data.len())?;
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn mode(&self) -> StagingMode {
        StagingMode::Spill
    }
}

/// Create the staging area for `len` bytes using the backend `opts` selects.
pub fn open_staging(opts: &ScrubOptions, len: u64) -> Result<Box<dyn StagingStore>> {
    match opts.resolve_mode(len) {
        StagingMode::Spill => Ok(Box::new(SpillStaging::new(len)?)),
        StagingMode::Memory | StagingMode::Auto => Ok(Box::new(MemStaging::new(len)?)),
    }
}
