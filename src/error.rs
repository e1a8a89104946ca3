//! Error types for container and backend operations

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StowageError {
    #[error("Invalid magic number in container header")]
    InvalidMagic,

    #[error("Unsupported format version: {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("Truncated header: expected {expected} bytes, read {actual}")]
    TruncatedHeader { expected: usize, actual: usize },

    #[error("Invalid block descriptor at offset {0}")]
    InvalidDescriptor(u64),

    #[error("{kind} is not a supported backing type: {path:?}")]
    UnsupportedPathType { kind: PathKindName, path: PathBuf },

    #[error("Container file is empty: {0:?}")]
    EmptyContainer(PathBuf),

    #[error("Container is not formatted: {0:?}")]
    Unformatted(PathBuf),

    #[error("Container is already formatted: {0:?} (pass force to re-initialize)")]
    AlreadyFormatted(PathBuf),

    #[error(
        "Capacity exceeded: block at offset {offset} (+{block_size} bytes) \
         does not fit in container of {container_size} bytes"
    )]
    CapacityExceeded {
        offset: u64,
        block_size: u64,
        container_size: u64,
    },

    #[error("Out of range: offset {offset} with length {length} exceeds device size {size}")]
    OutOfRange { offset: u64, length: u64, size: u64 },

    #[error("Backend is closed")]
    BackendClosed,

    #[error("Unknown export: {0}")]
    UnknownExport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error during {op} on {path:?}: {source}")]
    PathIo {
        op: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Rejected path kinds, named for error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKindName {
    Symlink,
    Fifo,
    Directory,
    Socket,
}

impl std::fmt::Display for PathKindName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathKindName::Symlink => write!(f, "A symbolic link"),
            PathKindName::Fifo => write!(f, "A named pipe"),
            PathKindName::Directory => write!(f, "A directory"),
            PathKindName::Socket => write!(f, "A socket"),
        }
    }
}

impl StowageError {
    /// Attach path and operation context to a bare I/O error.
    pub fn io_context(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StowageError::PathIo {
            op,
            path: path.into(),
            source,
        }
    }

    /// Map to the errno carried in an NBD simple reply.
    pub fn to_nbd_errno(&self) -> u32 {
        use std::io::ErrorKind;

        match self {
            StowageError::OutOfRange { .. } => 22,       // EINVAL
            StowageError::CapacityExceeded { .. } => 28, // ENOSPC
            StowageError::BackendClosed => 108,          // ESHUTDOWN
            StowageError::UnknownExport(_) => 19,        // ENODEV
            StowageError::PathIo { source, .. } | StowageError::Io(source) => match source.kind() {
                ErrorKind::NotFound => 19,
                ErrorKind::PermissionDenied => 1,
                ErrorKind::InvalidInput => 22,
                _ => 5, // EIO
            },
            _ => 5,
        }
    }
}

pub type Result<T> = std::result::Result<T, StowageError>;
