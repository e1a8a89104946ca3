//! Path classification and container detection
//!
//! Gates which paths may back a container: regular files and device nodes
//! are usable, everything else is rejected with an error naming the kind.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::header::read_header;
use crate::error::{PathKindName, Result, StowageError};

/// Supported backing path kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathKind {
    /// Regular file
    RegularFile,
    /// Block device node
    BlockDevice,
    /// Character device node
    CharDevice,
}

impl PathKind {
    /// True for device-special paths
    pub fn is_device(&self) -> bool {
        matches!(self, PathKind::BlockDevice | PathKind::CharDevice)
    }
}

/// Classify a backing path
///
/// Symlinks are detected, not followed. Symlinks, named pipes, directories,
/// and sockets are rejected with an error naming the offending kind.
pub fn classify(path: impl AsRef<Path>) -> Result<PathKind> {
    use std::os::unix::fs::FileTypeExt;

    let path = path.as_ref();
    let meta = std::fs::symlink_metadata(path)
        .map_err(|e| StowageError::io_context("stat", path, e))?;
    let ft = meta.file_type();

    let reject = |kind| StowageError::UnsupportedPathType {
        kind,
        path: path.to_path_buf(),
    };

    if ft.is_symlink() {
        return Err(reject(PathKindName::Symlink));
    }
    if ft.is_fifo() {
        return Err(reject(PathKindName::Fifo));
    }
    if ft.is_dir() {
        return Err(reject(PathKindName::Directory));
    }
    if ft.is_socket() {
        return Err(reject(PathKindName::Socket));
    }

    if ft.is_block_device() {
        Ok(PathKind::BlockDevice)
    } else if ft.is_char_device() {
        Ok(PathKind::CharDevice)
    } else {
        Ok(PathKind::RegularFile)
    }
}

/// What `detect` found at a path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionReport {
    /// Inspected path
    pub path: PathBuf,
    /// Backing kind
    pub kind: PathKind,
    /// Whether the header magic matched; `None` for device paths, which
    /// are reported without header validation
    pub formatted: Option<bool>,
    /// Format version as (major, minor)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_version: Option<(u8, u8)>,
    /// Container id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<Uuid>,
    /// Declared container size (bytes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_size: Option<u64>,
    /// Number of appended blocks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_count: Option<u64>,
}

/// Inspect a backing path and report its container state
///
/// Device paths are reported as-is. For regular files, a zero-length file
/// is an error; otherwise the header is decoded and reported. A magic
/// mismatch is flagged in the report (`formatted: Some(false)`) rather than
/// failing, so callers can decide whether to initialize.
pub fn detect(path: impl AsRef<Path>) -> Result<DetectionReport> {
    let path = path.as_ref();
    let kind = classify(path)?;

    if kind.is_device() {
        debug!("Device mode starting for {:?}", path);
        return Ok(DetectionReport {
            path: path.to_path_buf(),
            kind,
            formatted: None,
            format_version: None,
            container_id: None,
            container_size: None,
            block_count: None,
        });
    }

    debug!("File mode starting for {:?}", path);
    let meta =
        std::fs::metadata(path).map_err(|e| StowageError::io_context("stat", path, e))?;
    if meta.len() == 0 {
        return Err(StowageError::EmptyContainer(path.to_path_buf()));
    }

    let header = read_header(path)?;
    let formatted = header.matches_format();
    if formatted {
        debug!(
            "Container header matches: v{}.{}, id {}, {} bytes, {} blocks",
            header.version_major,
            header.version_minor,
            header.container_id,
            header.container_size,
            header.block_count
        );
    } else {
        warn!("Incorrect container header in {:?}", path);
    }

    Ok(DetectionReport {
        path: path.to_path_buf(),
        kind,
        formatted: Some(formatted),
        format_version: Some((header.version_major, header.version_minor)),
        container_id: Some(header.container_id),
        container_size: Some(header.container_size),
        block_count: Some(header.block_count),
    })
}
