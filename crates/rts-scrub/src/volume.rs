//! A realtime volume and the exclusive lock a scrub runs under.
//!
//! Holding a [`LockedRtVolume`] guarantees nothing resizes the bitmap or
//! summary for the guard's lifetime, so geometry computed at setup stays
//! valid for the whole scan.

use parking_lot::{RwLock, RwLockWriteGuard};
use rts_error::{Result, RtsError};
use rts_extent::MetaFile;
use rts_ondisk::RtSuperblock;
use rts_types::VolumeUuid;
use std::fmt;

pub struct RtVolume {
    sb: RtSuperblock,
    bitmap: MetaFile,
    summary: MetaFile,
    lock: RwLock<()>,
}

impl fmt::Debug for RtVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtVolume")
            .field("uuid", &self.sb.uuid)
            .field("rblocks", &self.sb.rblocks)
            .field("bitmap", &self.bitmap)
            .field("summary", &self.summary)
            .finish_non_exhaustive()
    }
}

impl RtVolume {
    /// Bundle a superblock with its two realtime metadata files.
    ///
    /// The files must be the inodes the superblock names.
    pub fn new(sb: RtSuperblock, bitmap: MetaFile, summary: MetaFile) -> Result<Self> {
        if bitmap.ino() != sb.rbmino {
            return Err(RtsError::Format(format!(
                "bitmap file is inode {}, superblock names {}",
                bitmap.ino(),
                sb.rbmino
            )));
        }
        if summary.ino() != sb.rsumino {
            return Err(RtsError::Format(format!(
                "summary file is inode {}, superblock names {}",
                summary.ino(),
                sb.rsumino
            )));
        }
        for (name, file) in [("bitmap", &bitmap), ("summary", &summary)] {
            if file.block_size() != sb.block_size.get() {
                return Err(RtsError::InvalidGeometry(format!(
                    "{name} device uses {}-byte blocks, volume uses {}",
                    file.block_size(),
                    sb.block_size
                )));
            }
        }
        Ok(Self {
            sb,
            bitmap,
            summary,
            lock: RwLock::new(()),
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &RtSuperblock {
        &self.sb
    }

    /// Block until no other holder remains.
    pub fn lock_exclusive(&self) -> LockedRtVolume<'_> {
        LockedRtVolume {
            vol: self,
            _guard: self.lock.write(),
        }
    }

    #[must_use]
    pub fn try_lock_exclusive(&self) -> Option<LockedRtVolume<'_>> {
        self.lock.try_write().map(|guard| LockedRtVolume {
            vol: self,
            _guard: guard,
        })
    }
}

/// Exclusive view of an [`RtVolume`]; released on drop.
pub struct LockedRtVolume<'a> {
    vol: &'a RtVolume,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl fmt::Debug for LockedRtVolume<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LockedRtVolume").field(self.vol).finish()
    }
}

impl LockedRtVolume<'_> {
    #[must_use]
    pub fn superblock(&self) -> &RtSuperblock {
        &self.vol.sb
    }

    #[must_use]
    pub fn bitmap(&self) -> &MetaFile {
        &self.vol.bitmap
    }

    #[must_use]
    pub fn summary(&self) -> &MetaFile {
        &self.vol.summary
    }

    /// Uuid stamped into realtime block headers.
    #[must_use]
    pub fn metadata_uuid(&self) -> VolumeUuid {
        self.vol.sb.meta_uuid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rts_block::{ByteBlockDevice, MemByteDevice};
    use rts_extent::ExtentList;
    use rts_ondisk::{IncompatFeatures, SB_VERSION_4};
    use rts_types::{BlockSize, InodeNumber};
    use std::sync::Arc;

    fn superblock() -> RtSuperblock {
        RtSuperblock {
            block_size: BlockSize::new(4096).expect("bs"),
            blocklog: 12,
            sectsize: 512,
            dblocks: 1 << 16,
            rblocks: 1024,
            rextents: 1024,
            rextsize: 1,
            rbmblocks: 1,
            rextslog: 10,
            frextents: 0,
            rbmino: InodeNumber(129),
            rsumino: InodeNumber(130),
            rgcount: 0,
            uuid: VolumeUuid([3; 16]),
            meta_uuid: VolumeUuid([3; 16]),
            fname: String::new(),
            versionnum: SB_VERSION_4,
            features_incompat: IncompatFeatures::default(),
            crc: 0,
        }
    }

    fn file(ino: u64, block_size: u32) -> MetaFile {
        let dev = ByteBlockDevice::new(MemByteDevice::new(4096), block_size).expect("dev");
        MetaFile::new(
            InodeNumber(ino),
            4096,
            Arc::new(ExtentList::identity(1).expect("fork")),
            Arc::new(dev),
        )
    }

    #[test]
    fn exclusive_lock_excludes() {
        let vol = RtVolume::new(superblock(), file(129, 4096), file(130, 4096)).expect("vol");
        let held = vol.lock_exclusive();
        assert!(vol.try_lock_exclusive().is_none());
        assert_eq!(held.summary().ino(), InodeNumber(130));
        assert_eq!(held.metadata_uuid(), VolumeUuid([3; 16]));
        drop(held);
        assert!(vol.try_lock_exclusive().is_some());
    }

    #[test]
    fn inode_numbers_must_match_superblock() {
        let err = RtVolume::new(superblock(), file(130, 4096), file(130, 4096)).expect_err("ino");
        assert!(matches!(err, RtsError::Format(_)));
        let err = RtVolume::new(superblock(), file(129, 4096), file(131, 4096)).expect_err("ino");
        assert!(matches!(err, RtsError::Format(_)));
    }

    #[test]
    fn device_block_size_must_match() {
        let err = RtVolume::new(superblock(), file(129, 512), file(130, 4096)).expect_err("bs");
        assert!(matches!(err, RtsError::InvalidGeometry(_)));
    }
}
