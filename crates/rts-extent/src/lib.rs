#![forbid(unsafe_code)]
//! Extent mapping: logical file block to physical block resolution.
//!
//! The realtime bitmap and summary are ordinary metadata files. Their data
//! forks map logical file blocks onto the data device, and each mapping is
//! either written, unwritten (preallocated) or a hole. Only written
//! mappings carry real content, so [`MetaFile::read_block`] refuses to read
//! anything else.

use asupersync::Cx;
use rts_block::{BlockBuf, BlockDevice};
use rts_error::{Result, RtsError};
use rts_types::{BlockNumber, FileBlock, InodeNumber};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| RtsError::Cancelled)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingState {
    Written,
    Unwritten,
    Hole,
}

/// One contiguous run of a file's logical address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkMapping {
    pub logical_start: FileBlock,
    /// `None` for holes.
    pub physical_start: Option<BlockNumber>,
    pub count: u64,
    pub state: MappingState,
}

impl ForkMapping {
    #[must_use]
    pub fn is_written(&self) -> bool {
        self.state == MappingState::Written
    }

    /// First logical block past this mapping (saturating).
    #[must_use]
    pub fn logical_end(&self) -> FileBlock {
        FileBlock(self.logical_start.0.saturating_add(self.count))
    }

    /// Physical block backing `offset`, if mapped and inside this run.
    #[must_use]
    pub fn physical_at(&self, offset: FileBlock) -> Option<BlockNumber> {
        if offset < self.logical_start || offset >= self.logical_end() {
            return None;
        }
        let start = self.physical_start?;
        start
            .0
            .checked_add(offset.0 - self.logical_start.0)
            .map(BlockNumber)
    }
}

/// Resolves logical offsets in a file's data fork.
pub trait ForkMapper: Send + Sync {
    /// The mapping containing `offset`. A hole after the last extent runs
    /// to the end of the address space.
    fn resolve(&self, cx: &Cx, offset: FileBlock) -> Result<ForkMapping>;

    /// The first non-hole mapping containing `offset` or starting after it.
    fn lookup_extent(&self, cx: &Cx, offset: FileBlock) -> Result<Option<ForkMapping>>;
}

/// A single allocated extent in an [`ExtentList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedExtent {
    pub logical_start: FileBlock,
    pub physical_start: BlockNumber,
    pub count: u64,
    pub unwritten: bool,
}

impl MappedExtent {
    #[must_use]
    pub fn written(logical_start: u64, physical_start: u64, count: u64) -> Self {
        Self {
            logical_start: FileBlock(logical_start),
            physical_start: BlockNumber(physical_start),
            count,
            unwritten: false,
        }
    }

    #[must_use]
    pub fn unwritten(logical_start: u64, physical_start: u64, count: u64) -> Self {
        Self {
            unwritten: true,
            ..Self::written(logical_start, physical_start, count)
        }
    }

    fn logical_end(&self) -> u64 {
        self.logical_start.0 + self.count
    }

    fn to_mapping(self) -> ForkMapping {
        ForkMapping {
            logical_start: self.logical_start,
            physical_start: Some(self.physical_start),
            count: self.count,
            state: if self.unwritten {
                MappingState::Unwritten
            } else {
                MappingState::Written
            },
        }
    }
}

/// In-core extent list, sorted by logical offset with no overlaps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentList {
    extents: Vec<MappedExtent>,
}

impl ExtentList {
    /// Build from extents in any order; rejects empty or overlapping runs.
    pub fn new(mut extents: Vec<MappedExtent>) -> Result<Self> {
        extents.sort_by_key(|e| e.logical_start);
        let mut prev_end = 0_u64;
        for (i, ext) in extents.iter().enumerate() {
            if ext.count == 0 {
                return Err(RtsError::Format(format!(
                    "extent {i} at logical block {} has zero length",
                    ext.logical_start
                )));
            }
            let Some(end) = ext.logical_start.0.checked_add(ext.count) else {
                return Err(RtsError::Format(format!(
                    "extent {i} overflows the logical address space"
                )));
            };
            if ext.physical_start.0.checked_add(ext.count).is_none() {
                return Err(RtsError::Format(format!(
                    "extent {i} overflows the physical address space"
                )));
            }
            if i > 0 && ext.logical_start.0 < prev_end {
                return Err(RtsError::Format(format!(
                    "extent {i} at logical block {} overlaps its predecessor",
                    ext.logical_start
                )));
            }
            prev_end = end;
        }
        Ok(Self { extents })
    }

    /// One written extent mapping `blocks` logical blocks onto the same
    /// physical block numbers, as for a dumped metadata file.
    pub fn identity(blocks: u64) -> Result<Self> {
        if blocks == 0 {
            return Ok(Self::default());
        }
        Self::new(vec![MappedExtent::written(0, 0, blocks)])
    }

    #[must_use]
    pub fn extents(&self) -> &[MappedExtent] {
        &self.extents
    }

    /// Index of the first extent whose end lies beyond `offset`.
    fn first_ending_after(&self, offset: FileBlock) -> usize {
        self.extents
            .partition_point(|e| e.logical_end() <= offset.0)
    }
}

impl ForkMapper for ExtentList {
    fn resolve(&self, cx: &Cx, offset: FileBlock) -> Result<ForkMapping> {
        cx_checkpoint(cx)?;
        let idx = self.first_ending_after(offset);
        match self.extents.get(idx) {
            Some(ext) if ext.logical_start <= offset => Ok(ext.to_mapping()),
            next => {
                let hole_start = idx
                    .checked_sub(1)
                    .map_or(0, |prev| self.extents[prev].logical_end());
                let hole_end = next.map_or(u64::MAX, |e| e.logical_start.0);
                Ok(ForkMapping {
                    logical_start: FileBlock(hole_start),
                    physical_start: None,
                    count: hole_end - hole_start,
                    state: MappingState::Hole,
                })
            }
        }
    }

    fn lookup_extent(&self, cx: &Cx, offset: FileBlock) -> Result<Option<ForkMapping>> {
        cx_checkpoint(cx)?;
        Ok(self
            .extents
            .get(self.first_ending_after(offset))
            .map(|e| e.to_mapping()))
    }
}

/// A metadata file: inode identity, reported size, data fork and the
/// device its blocks live on.
#[derive(Clone)]
pub struct MetaFile {
    ino: InodeNumber,
    disk_size: u64,
    fork: Arc<dyn ForkMapper>,
    dev: Arc<dyn BlockDevice>,
}

impl std::fmt::Debug for MetaFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaFile")
            .field("ino", &self.ino)
            .field("disk_size", &self.disk_size)
            .field("block_size", &self.dev.block_size())
            .finish_non_exhaustive()
    }
}

impl MetaFile {
    #[must_use]
    pub fn new(
        ino: InodeNumber,
        disk_size: u64,
        fork: Arc<dyn ForkMapper>,
        dev: Arc<dyn BlockDevice>,
    ) -> Self {
        Self {
            ino,
            disk_size,
            fork,
            dev,
        }
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    /// Size in bytes recorded in the inode.
    #[must_use]
    pub fn disk_size(&self) -> u64 {
        self.disk_size
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.dev.block_size()
    }

    /// Logical blocks covered by the file size, rounding up.
    #[must_use]
    pub fn size_in_blocks(&self) -> u64 {
        self.disk_size.div_ceil(u64::from(self.dev.block_size()))
    }

    #[must_use]
    pub fn fork(&self) -> &dyn ForkMapper {
        self.fork.as_ref()
    }

    /// Read logical block `offset` through the data fork.
    ///
    /// A hole or unwritten mapping is corruption of this file at `offset`.
    pub fn read_block(&self, cx: &Cx, offset: FileBlock) -> Result<BlockBuf> {
        let mapping = self.fork.resolve(cx, offset)?;
        if !mapping.is_written() {
            return Err(RtsError::Corruption {
                block: offset.0,
                detail: format!(
                    "inode {} block {offset} is not a written extent ({:?})",
                    self.ino, mapping.state
                ),
            });
        }
        let Some(physical) = mapping.physical_at(offset) else {
            return Err(RtsError::Corruption {
                block: offset.0,
                detail: format!("inode {} mapping does not cover block {offset}", self.ino),
            });
        };
        if physical.0 >= self.dev.block_count() {
            return Err(RtsError::Corruption {
                block: offset.0,
                detail: format!(
                    "inode {} block {offset} maps past the end of the device (physical {physical})",
                    self.ino
                ),
            });
        }
        self.dev.read_block(cx, physical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rts_block::{ByteBlockDevice, MemByteDevice};

    fn list() -> ExtentList {
        ExtentList::new(vec![
            MappedExtent::written(4, 100, 2),
            MappedExtent::written(0, 10, 3),
            MappedExtent::unwritten(6, 200, 1),
        ])
        .expect("list")
    }

    #[test]
    fn resolve_finds_containing_extent() {
        let cx = Cx::for_testing();
        let map = list().resolve(&cx, FileBlock(5)).expect("resolve");
        assert_eq!(map.state, MappingState::Written);
        assert_eq!(map.logical_start, FileBlock(4));
        assert_eq!(map.physical_at(FileBlock(5)), Some(BlockNumber(101)));
        assert_eq!(map.physical_at(FileBlock(6)), None);
    }

    #[test]
    fn resolve_reports_holes_between_and_after() {
        let cx = Cx::for_testing();
        let list = list();

        let gap = list.resolve(&cx, FileBlock(3)).expect("gap");
        assert_eq!(gap.state, MappingState::Hole);
        assert_eq!(gap.logical_start, FileBlock(3));
        assert_eq!(gap.count, 1);
        assert_eq!(gap.physical_at(FileBlock(3)), None);

        let tail = list.resolve(&cx, FileBlock(50)).expect("tail");
        assert_eq!(tail.state, MappingState::Hole);
        assert_eq!(tail.logical_start, FileBlock(7));
        assert_eq!(tail.count, u64::MAX - 7);

        let unwritten = list.resolve(&cx, FileBlock(6)).expect("unwritten");
        assert_eq!(unwritten.state, MappingState::Unwritten);
    }

    #[test]
    fn empty_list_is_one_big_hole() {
        let cx = Cx::for_testing();
        let map = ExtentList::default().resolve(&cx, FileBlock(0)).expect("hole");
        assert_eq!(map.state, MappingState::Hole);
        assert_eq!(map.count, u64::MAX);
        assert!(
            ExtentList::default()
                .lookup_extent(&cx, FileBlock(0))
                .expect("lookup")
                .is_none()
        );
    }

    #[test]
    fn lookup_extent_finds_containing_or_next() {
        let cx = Cx::for_testing();
        let list = list();
        let found = list.lookup_extent(&cx, FileBlock(3)).expect("lookup");
        assert_eq!(found.map(|m| m.logical_start), Some(FileBlock(4)));
        let found = list.lookup_extent(&cx, FileBlock(5)).expect("lookup");
        assert_eq!(found.map(|m| m.logical_start), Some(FileBlock(4)));
        assert!(list.lookup_extent(&cx, FileBlock(7)).expect("lookup").is_none());
    }

    #[test]
    fn invalid_lists_rejected() {
        assert!(ExtentList::new(vec![MappedExtent::written(0, 0, 0)]).is_err());
        assert!(
            ExtentList::new(vec![
                MappedExtent::written(0, 0, 4),
                MappedExtent::written(3, 10, 1),
            ])
            .is_err()
        );
        assert!(ExtentList::new(vec![MappedExtent::written(u64::MAX, 0, 2)]).is_err());
    }

    fn meta_file(fork: ExtentList, disk_size: u64) -> (MetaFile, MemByteDevice) {
        let mem = MemByteDevice::new(512 * 8);
        mem.with_bytes_mut(|bytes| {
            for (i, chunk) in bytes.chunks_mut(512).enumerate() {
                chunk.fill(u8::try_from(i).expect("small"));
            }
        });
        let dev = ByteBlockDevice::new(mem.clone(), 512).expect("dev");
        (
            MetaFile::new(InodeNumber(130), disk_size, Arc::new(fork), Arc::new(dev)),
            mem,
        )
    }

    #[test]
    fn meta_file_reads_through_fork() {
        let cx = Cx::for_testing();
        let fork = ExtentList::new(vec![MappedExtent::written(0, 5, 2)]).expect("fork");
        let (file, _) = meta_file(fork, 1000);
        assert_eq!(file.size_in_blocks(), 2);
        let block = file.read_block(&cx, FileBlock(1)).expect("read");
        assert!(block.as_slice().iter().all(|b| *b == 6));
    }

    #[test]
    fn meta_file_refuses_holes_and_unwritten() {
        let cx = Cx::for_testing();
        let fork = ExtentList::new(vec![
            MappedExtent::written(0, 0, 1),
            MappedExtent::unwritten(2, 2, 1),
        ])
        .expect("fork");
        let (file, _) = meta_file(fork, 512 * 3);

        let err = file.read_block(&cx, FileBlock(1)).expect_err("hole");
        assert!(matches!(err, RtsError::Corruption { block: 1, .. }));
        let err = file.read_block(&cx, FileBlock(2)).expect_err("unwritten");
        assert!(matches!(err, RtsError::Corruption { block: 2, .. }));
    }

    #[test]
    fn meta_file_mapping_past_device_is_corruption() {
        let cx = Cx::for_testing();
        let fork = ExtentList::new(vec![MappedExtent::written(0, 7, 4)]).expect("fork");
        let (file, _) = meta_file(fork, 512 * 4);
        file.read_block(&cx, FileBlock(0)).expect("in range");
        assert!(matches!(
            file.read_block(&cx, FileBlock(1)),
            Err(RtsError::Corruption { block: 1, .. })
        ));
    }

    #[test]
    fn identity_fork() {
        let cx = Cx::for_testing();
        let fork = ExtentList::identity(3).expect("identity");
        let map = fork.resolve(&cx, FileBlock(2)).expect("resolve");
        assert_eq!(map.physical_at(FileBlock(2)), Some(BlockNumber(2)));
        assert!(ExtentList::identity(0).expect("empty").extents().is_empty());
    }
}
