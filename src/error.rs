//! Loader error type
//!
//! `LoadError` covers every way a load can fail. Each variant maps to an
//! errno value so callers holding a C-style contract can turn any error
//! into a negative return code via [`LoadError::sysret`]. Syscall-backed
//! variants surface the kernel's own errno instead of a fixed code.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Operation not permitted (EPERM)
const EPERM: i32 = 1;
/// Exec format error (ENOEXEC)
const ENOEXEC: i32 = 8;
/// Invalid argument (EINVAL)
const EINVAL: i32 = 22;
/// Name not unique on network (ENOTUNIQ)
const ENOTUNIQ: i32 = 76;

/// Error returned by a load run
#[derive(Debug, Error)]
pub enum LoadError {
    /// Short ELF reads, bad record alignment, missing required sections
    #[error("malformed object: {0}")]
    Malformed(String),

    /// A present program type is not in the location's allow-list
    #[error("program type {0} not permitted here")]
    PermissionDenied(String),

    /// A pinned map disagrees with the object-declared attributes
    #[error("map {0} does not match its pinned attributes")]
    NotUnique(String),

    /// Missing program definition, unknown kernel version, tripped canary
    #[error("invalid object state: {0}")]
    Invalid(String),

    /// Map creation or program load rejected by the kernel
    #[error("kernel refused {what}: {source}")]
    KernelRefused {
        what: String,
        #[source]
        source: io::Error,
    },

    /// Pin, chmod, or chown syscall failed
    #[error("{op} {}: {source}", .path.display())]
    FilesystemOp {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LoadError {
    /// The positive errno value this error maps to
    pub fn errno(&self) -> i32 {
        match self {
            LoadError::Malformed(_) => ENOEXEC,
            LoadError::PermissionDenied(_) => EPERM,
            LoadError::NotUnique(_) => ENOTUNIQ,
            LoadError::Invalid(_) => EINVAL,
            LoadError::KernelRefused { source, .. } | LoadError::FilesystemOp { source, .. } => {
                source.raw_os_error().unwrap_or(EINVAL)
            }
        }
    }

    /// Negative errno for a C-style return contract
    ///
    /// Example: a pinned-map mismatch returns -76.
    pub fn sysret(&self) -> i32 {
        -self.errno()
    }
}

/// Result type alias for loader operations
pub type LoadResult<T> = Result<T, LoadError>;
