//! Crate-wide error type.

use std::io;

use thiserror::Error;

/// Convenience alias used by every fallible operation in the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the index and its storage layers.
///
/// Capacity exhaustion in the buffer pool and missing keys are *not* errors;
/// they are reported as ordinary `Option`/`bool` results. Everything here is
/// fatal for the operation that hit it.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying file I/O failed, including short reads and writes.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// An existing block file was opened with a different configured block size.
    #[error("block size mismatch: file uses {found} bytes, configured {expected}")]
    BlockSizeMismatch {
        /// Block size the caller configured.
        expected: u64,
        /// Block size stored in the file header.
        found: u64,
    },
    /// On-disk or in-memory state failed a structural check.
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    /// A caller-supplied parameter is unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
