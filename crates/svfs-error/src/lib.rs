#![forbid(unsafe_code)]
//! Error types for svfs.
//!
//! Defines `SvfsError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for the VFS layer above the engine.

use thiserror::Error;

/// Unified error type for all svfs operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SvfsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("no space left in id range")]
    NoSpace,

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("out of memory")]
    OutOfMemory,

    /// On-disk state violates an invariant. Always logged with the ids
    /// involved at the point of detection; surfaces like `NotFound` to
    /// callers and triggers degraded operation at the filesystem layer.
    #[error("filesystem inconsistency: {0}")]
    Inconsistent(String),

    /// Transaction contention. Retried transparently by the transaction
    /// loop; never surfaced past it.
    #[error("transaction restart")]
    Restart,

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid on-disk record: {0}")]
    Format(String),
}

impl SvfsError {
    /// Convert this error into a POSIX errno for the VFS layer.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::NoSpace => libc::ENOSPC,
            Self::Invalid(_) | Self::Format(_) => libc::EINVAL,
            Self::OutOfMemory => libc::ENOMEM,
            Self::Inconsistent(_) => libc::EIO,
            Self::Restart => libc::EAGAIN,
            Self::Cancelled => libc::ECANCELED,
        }
    }

    /// Whether the caller should re-run the transaction body.
    #[must_use]
    pub fn is_restart(&self) -> bool {
        matches!(self, Self::Restart)
    }
}

/// Result alias using `SvfsError`.
pub type Result<T> = std::result::Result<T, SvfsError>;
