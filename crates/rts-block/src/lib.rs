#![forbid(unsafe_code)]
//! Block I/O layer for realtime metadata.
//!
//! Provides the `ByteDevice` and `BlockDevice` traits the scrubber reads
//! through, a pread-backed file device, an in-memory device for synthetic
//! volumes, and the superblock sector reader. Every call takes a `&Cx` so a
//! long scan can be cancelled between blocks.

use asupersync::Cx;
use parking_lot::RwLock;
use rts_error::{Result, RtsError};
use rts_types::{BlockNumber, SB_SECTOR_SIZE};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| RtsError::Cancelled)
}

fn byte_range_end(offset: u64, len: usize, what: &str) -> Result<u64> {
    let len = u64::try_from(len)
        .map_err(|_| RtsError::Format(format!("{what} length overflows u64")))?;
    offset
        .checked_add(len)
        .ok_or_else(|| RtsError::Format(format!("{what} range overflows u64")))
}

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed, read-only device for fixed-offset I/O (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// File-backed byte device using `pread` style I/O. Images are opened
/// read-only.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).open(path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                RtsError::NotFound(path.display().to_string())
            } else {
                RtsError::Io(err)
            }
        })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let end = byte_range_end(offset, buf.len(), "read")?;
        if end > self.len {
            return Err(RtsError::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.read_exact_at(buf, offset)?;
        cx_checkpoint(cx)?;
        Ok(())
    }
}

/// In-memory byte device used for synthetic volumes and tests.
///
/// Clones share the same backing bytes, so a test can keep a handle and
/// damage the image after handing it to a volume.
#[derive(Debug, Clone, Default)]
pub struct MemByteDevice {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(bytes)),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }

    /// Mutate the backing bytes in place.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        let mut guard = self.bytes.write();
        f(&mut guard)
    }

    fn checked_range(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let start =
            usize::try_from(offset).map_err(|_| RtsError::Format("offset overflow".into()))?;
        let end = start
            .checked_add(len)
            .ok_or_else(|| RtsError::Format("range overflow".into()))?;
        let dev_len = self.bytes.read().len();
        if end > dev_len {
            return Err(RtsError::Format(format!(
                "memory device access out of bounds: offset={offset} len={len} dev_len={dev_len}"
            )));
        }
        Ok(start..end)
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.read().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let range = self.checked_range(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes.read()[range]);
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, cx: &Cx, block: BlockNumber) -> Result<BlockBuf>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;
}

#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    /// Wrap a byte device. A trailing partial block is not addressable.
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(RtsError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let block_count = inner.len_bytes() / u64::from(block_size);
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn block_offset(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(RtsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| RtsError::Format("block offset overflow".to_owned()))
    }

    fn block_len(&self) -> Result<usize> {
        usize::try_from(self.block_size)
            .map_err(|_| RtsError::Format("block_size does not fit usize".to_owned()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, cx: &Cx, block: BlockNumber) -> Result<BlockBuf> {
        cx_checkpoint(cx)?;
        let offset = self.block_offset(block)?;
        let mut buf = vec![0_u8; self.block_len()?];
        self.inner.read_exact_at(cx, offset, &mut buf)?;
        cx_checkpoint(cx)?;
        Ok(BlockBuf::new(buf))
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

/// Read the head of the primary superblock (512 bytes at offset 0).
pub fn read_superblock_region(cx: &Cx, dev: &dyn ByteDevice) -> Result<[u8; SB_SECTOR_SIZE]> {
    let mut buf = [0_u8; SB_SECTOR_SIZE];
    dev.read_exact_at(cx, 0, &mut buf)?;
    Ok(buf)
}

/// Read a whole superblock sector of `sectsize` bytes.
///
/// A device shorter than the sector yields what it holds, never less than
/// the 512-byte head; checksum validation then reports the shortfall.
pub fn read_superblock_sector(cx: &Cx, dev: &dyn ByteDevice, sectsize: usize) -> Result<Vec<u8>> {
    let available = usize::try_from(dev.len_bytes()).unwrap_or(usize::MAX);
    let len = sectsize.min(available).max(SB_SECTOR_SIZE);
    let mut buf = vec![0_u8; len];
    dev.read_exact_at(cx, 0, &mut buf)?;
    Ok(buf)
}
