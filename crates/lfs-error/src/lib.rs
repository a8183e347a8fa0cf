#![forbid(unsafe_code)]
//! Error types for the segment manager.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Layout | `GeometryError` | `lfs-types` | Invalid main-area geometry detected at format/mount |
//! | Runtime | `LfsError` | `lfs-error` (this crate) | Errors surfaced by allocation, GC, discard and checkpoint |
//!
//! `lfs-error` does not depend on `lfs-types`; `GeometryError` is converted
//! into [`LfsError::InvalidGeometry`] by the crates that validate geometry.
//!
//! ## Propagation
//!
//! `NoVictim`, `RelocationFailed` and `Discard` are absorbed close to where
//! they are raised (the volume and the GC worker treat `NoVictim` as nothing
//! to do, the collector retries or blacklists, the discard manager logs and
//! moves on). `Cancelled` only ends a background run during shutdown. Only
//! `NoSpace` and `ConsistencyViolation` are expected to reach the write path.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one errno via [`LfsError::to_errno`]. The
//! mapping has no wildcard arm.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `ConsistencyViolation` | `EUCLEAN` |
//! | `NoVictim` | `ENODATA` |
//! | `NoSpace` | `ENOSPC` |
//! | `RelocationFailed` | `EIO` |
//! | `Discard` | `EIO` |
//! | `Checkpoint` | `EIO` |
//! | `Again` | `EAGAIN` |
//! | `Cancelled` | `EINTR` |
//! | `ReadOnly` | `EROFS` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `Config` | `EINVAL` |

use thiserror::Error;

/// Unified error type for all segment-manager operations.
#[derive(Debug, Error)]
pub enum LfsError {
    /// Operating system or device I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Segment metadata disagrees with the requested transition (double
    /// validate, double invalidate, address outside the main area, summary
    /// class mismatch). The volume is flagged for an offline check.
    #[error("consistency violation at block {block:#x}: {detail}")]
    ConsistencyViolation { block: u64, detail: String },

    /// Victim selection found no eligible candidate.
    #[error("no reclaimable victim")]
    NoVictim,

    /// No free segment could be acquired, even after emergency reclaim.
    #[error("no space left on device")]
    NoSpace,

    /// Moving live blocks out of a victim segment failed. The segment keeps
    /// all of its valid blocks.
    #[error("relocation of segment {segment} failed: {detail}")]
    RelocationFailed { segment: u32, detail: String },

    /// A TRIM command completed with an error.
    #[error("discard of {len} blocks at {start:#x} failed: {detail}")]
    Discard { start: u64, len: u64, detail: String },

    /// Persisting a checkpoint through the metadata store failed.
    #[error("checkpoint failed: {0}")]
    Checkpoint(String),

    /// Transient condition; the caller may retry.
    #[error("resource temporarily unavailable")]
    Again,

    /// Operation interrupted by shutdown.
    #[error("operation cancelled")]
    Cancelled,

    /// The volume refuses mutation after a consistency violation.
    #[error("read-only volume: consistency check required")]
    ReadOnly,

    /// Main-area geometry is invalid.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Configuration value out of range.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl LfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// Policy notes:
    /// - `ConsistencyViolation` → `EUCLEAN`: "structure needs cleaning".
    /// - `NoVictim` → `ENODATA`: nothing to collect is not an I/O failure.
    /// - `Cancelled` → `EINTR`.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::ConsistencyViolation { .. } => libc::EUCLEAN,
            Self::NoVictim => libc::ENODATA,
            Self::NoSpace => libc::ENOSPC,
            Self::RelocationFailed { .. } | Self::Discard { .. } | Self::Checkpoint(_) => {
                libc::EIO
            }
            Self::Again => libc::EAGAIN,
            Self::Cancelled => libc::EINTR,
            Self::ReadOnly => libc::EROFS,
            Self::InvalidGeometry(_) | Self::Config(_) => libc::EINVAL,
        }
    }

    /// Shorthand for a consistency violation at `block`.
    #[must_use]
    pub fn consistency(block: u64, detail: impl Into<String>) -> Self {
        Self::ConsistencyViolation {
            block,
            detail: detail.into(),
        }
    }

    /// Whether the device reported that the operation is unsupported.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        self.to_errno() == libc::EOPNOTSUPP
    }
}

/// Result alias using `LfsError`.
pub type Result<T> = std::result::Result<T, LfsError>;
