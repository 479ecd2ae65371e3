//! Error types for the VMDK core library.

use std::path::PathBuf;

/// The main error type for VMDK read operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// The textual descriptor could not be parsed.
    #[error("malformed descriptor at line {line}: {reason}")]
    MalformedDescriptor { line: usize, reason: String },

    /// A sparse extent's binary header failed validation.
    #[error("sparse header error in extent {extent}: {reason}")]
    SparseHeaderError { extent: usize, reason: String },

    /// A grain directory or grain table failed validation.
    #[error("corrupt grain table in extent {extent}, directory entry {gd_index}: {reason}")]
    CorruptGrainTable {
        extent: usize,
        gd_index: u64,
        reason: String,
    },

    /// A stream-optimized compressed grain failed to decode.
    #[error("corrupt compressed grain in extent {extent}, grain {grain} ({phase}): {reason}")]
    CorruptCompressedGrain {
        extent: usize,
        grain: u64,
        phase: String,
        reason: String,
    },

    /// An extent names a backing file the pool has no entry for.
    #[error("backing file missing: {filename}")]
    BackingMissing { filename: String },

    /// The backing pool reported an I/O failure.
    #[error("backing I/O error on index {index} at offset {offset}: {cause}")]
    BackingIoError {
        index: u32,
        offset: u64,
        cause: String,
    },

    /// A parent handle's CID did not match the child's recorded `parentCID`.
    #[error("parent CID mismatch: expected {expected:#x}, got {actual:#x}")]
    ParentCidMismatch { expected: u32, actual: u32 },

    /// The parent chain exceeded the maximum permitted depth.
    #[error("parent chain too deep (limit is {limit})")]
    ParentChainTooDeep { limit: usize },

    /// `set_parent` was called after a hole had already been resolved.
    #[error("parent set too late: a hole was already resolved without one")]
    ParentSetTooLate,

    /// A seek or read targeted a negative or otherwise invalid offset.
    #[error("offset out of range")]
    OutOfRange,

    /// The operation was interrupted via `signal_abort`.
    #[error("operation aborted")]
    Aborted,
}

/// A specialized Result type for VMDK operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a malformed-descriptor error.
    pub fn malformed_descriptor(line: usize, reason: impl Into<String>) -> Self {
        Self::MalformedDescriptor {
            line,
            reason: reason.into(),
        }
    }

    /// Create a sparse-header error.
    pub fn sparse_header(extent: usize, reason: impl Into<String>) -> Self {
        Self::SparseHeaderError {
            extent,
            reason: reason.into(),
        }
    }

    /// Create a corrupt-grain-table error.
    pub fn corrupt_grain_table(extent: usize, gd_index: u64, reason: impl Into<String>) -> Self {
        Self::CorruptGrainTable {
            extent,
            gd_index,
            reason: reason.into(),
        }
    }

    /// Create a corrupt-compressed-grain error.
    pub fn corrupt_compressed_grain(
        extent: usize,
        grain: u64,
        phase: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::CorruptCompressedGrain {
            extent,
            grain,
            phase: phase.into(),
            reason: reason.into(),
        }
    }

    /// Create a backing-I/O error.
    pub fn backing_io(index: u32, offset: u64, cause: impl Into<String>) -> Self {
        Self::BackingIoError {
            index,
            offset,
            cause: cause.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}
