#![forbid(unsafe_code)]
//! Error types for the realtime summary scrubber.
//!
//! # Error Taxonomy
//!
//! The workspace uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `rts-types` | Byte-level format violations in superblocks and realtime blocks |
//! | Runtime | `RtsError` | `rts-error` (this crate) | Errors surfaced by devices, the scrub engine and the CLI |
//!
//! `rts-error` does not depend on `rts-types`. The conversion from
//! `ParseError` to `RtsError` lives in `rts-ondisk`, which knows the file
//! block the bytes came from:
//!
//! | ParseError Variant | RtsError Variant |
//! |--------------------|------------------|
//! | `InsufficientData` | `Corruption { block, detail }` |
//! | `InvalidMagic` | `Corruption { block, detail }` (realtime blocks) / `Format` (superblock) |
//! | `InvalidField` | `Corruption` / `Format` / `InvalidGeometry` |
//! | `IntegerConversion` | `Corruption { block, detail }` |
//!
//! ## Scrub Classification
//!
//! The scrub engine never turns an error into a finding implicitly. It
//! inspects the variant at each stage boundary:
//!
//! - `Corruption` while reading the summary file is recorded as summary
//!   corruption at `block`.
//! - `Corruption` produced by the bitmap source is recorded as a
//!   cross-reference failure against the bitmap.
//! - Everything else, including `Cancelled`, aborts the scrub and means the
//!   result is indeterminate.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `UnsupportedFeature` | `EOPNOTSUPP` |
//! | `Cancelled` | `EINTR` |
//! | `NoMemory` | `ENOMEM` |
//! | `NotFound` | `ENOENT` |

use thiserror::Error;

/// Unified error type for all scrubber operations.
#[derive(Debug, Error)]
pub enum RtsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known block.
    ///
    /// `block` is the logical block within the metadata file being read
    /// (bitmap or summary), which is what scrub findings are keyed by.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Invalid on-disk format (wrong magic, bad superblock, bad range).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without block context.
    #[error("parse error: {0}")]
    Parse(String),

    /// The volume uses a feature this build does not scrub.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// On-disk geometry is numerically invalid.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Operation cancelled via `Cx` or an explicit stop request.
    #[error("operation cancelled")]
    Cancelled,

    /// Scratch space for the recomputed summary could not be allocated.
    #[error("out of memory: {0}")]
    NoMemory(String),

    /// A named object (file, inode, device) does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl RtsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive so adding a variant is a compile error
    /// until its errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::UnsupportedFeature(_) => libc::EOPNOTSUPP,
            Self::Cancelled => libc::EINTR,
            Self::NoMemory(_) => libc::ENOMEM,
            Self::NotFound(_) => libc::ENOENT,
        }
    }

    /// True for errors that describe damaged metadata rather than a failure
    /// to read it.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

/// Result alias using `RtsError`.
pub type Result<T> = std::result::Result<T, RtsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(RtsError, libc::c_int)> = vec![
            (RtsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                RtsError::Corruption {
                    block: 0,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (RtsError::Format("test".into()), libc::EINVAL),
            (RtsError::Parse("test".into()), libc::EINVAL),
            (
                RtsError::UnsupportedFeature("rtgroups".into()),
                libc::EOPNOTSUPP,
            ),
            (RtsError::InvalidGeometry("rextsize=0".into()), libc::EINVAL),
            (RtsError::Cancelled, libc::EINTR),
            (RtsError::NoMemory("staging".into()), libc::ENOMEM),
            (RtsError::NotFound("summary".into()), libc::ENOENT),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(RtsError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = RtsError::Corruption {
            block: 42,
            detail: "summary word mismatch".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt metadata at block 42: summary word mismatch"
        );
        assert_eq!(RtsError::Cancelled.to_string(), "operation cancelled");
        assert_eq!(
            RtsError::NoMemory("4096 bytes".into()).to_string(),
            "out of memory: 4096 bytes"
        );
    }

    #[test]
    fn only_corruption_is_corruption() {
        assert!(
            RtsError::Corruption {
                block: 1,
                detail: String::new()
            }
            .is_corruption()
        );
        assert!(!RtsError::Cancelled.is_corruption());
        assert!(!RtsError::Format("x".into()).is_corruption());
    }
}
