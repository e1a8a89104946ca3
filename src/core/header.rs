//! Container header codec
//!
//! The header is a fixed-layout, big-endian record at byte offset 0 of every
//! container. It identifies a formatted container (magic), carries the
//! immutable container id, and tracks the block ledger via `block_count`.
//! `container_size` is refreshed from the backing file's current size on
//! every header write, so it always reflects the container as it is on disk.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::net::Ipv4Addr;
use std::os::unix::fs::FileExt;
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, StowageError};

/// Magic identifying a formatted container.
pub const MAGIC: [u8; 4] = [0x70, 0x6f, 0x6f, 0x70];

/// Current format version (major).
pub const VERSION_MAJOR: u8 = 0;
/// Current format version (minor).
pub const VERSION_MINOR: u8 = 1;

/// Serialized header length for format version 0.1.
pub const HEADER_LEN: usize = 47;

/// Container header (offset 0)
///
/// Fixed offsets, big-endian:
///
/// ```text
/// 0   magic             4 bytes
/// 4   header_size       1 byte
/// 5   format_version    2 bytes (major, minor)
/// 7   container_id      16 bytes (binary UUID, v7)
/// 23  previous_address  4 bytes
/// 27  current_address   4 bytes
/// 31  container_size    8 bytes
/// 39  block_count       8 bytes
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    /// Magic bytes; anything other than [`MAGIC`] means unformatted
    pub magic: [u8; 4],

    /// Serialized header length, recorded at creation and never changed;
    /// block offsets are computed from this value
    pub header_size: u8,

    /// Format version (major)
    pub version_major: u8,

    /// Format version (minor)
    pub version_minor: u8,

    /// Unique, time-ordered container id, assigned once at initialization
    pub container_id: Uuid,

    /// Address of the initiator that attached before the current one
    pub previous_address: Ipv4Addr,

    /// Address of the most recently attached initiator
    pub current_address: Ipv4Addr,

    /// Total addressable size of the backing path (bytes)
    pub container_size: u64,

    /// Number of block descriptors appended so far
    pub block_count: u64,
}

impl ContainerHeader {
    /// Create a header for a fresh container
    ///
    /// Stamps the format magic, the current format version, and a newly
    /// generated time-ordered container id. Sizes start at zero;
    /// `container_size` is filled in by the first [`write_header`].
    pub fn new() -> Self {
        ContainerHeader {
            magic: MAGIC,
            header_size: HEADER_LEN as u8,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            container_id: Uuid::now_v7(),
            previous_address: Ipv4Addr::UNSPECIFIED,
            current_address: Ipv4Addr::UNSPECIFIED,
            container_size: 0,
            block_count: 0,
        }
    }

    /// True iff the magic marks this container as formatted
    pub fn matches_format(&self) -> bool {
        self.magic == MAGIC
    }

    /// Rotate the attachment-audit addresses for a newly attached initiator
    pub fn record_attachment(&mut self, addr: Ipv4Addr) {
        self.previous_address = self.current_address;
        self.current_address = addr;
    }

    /// Serialize to the on-disk layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        buf.put_slice(&self.magic);
        buf.put_u8(self.header_size);
        buf.put_u8(self.version_major);
        buf.put_u8(self.version_minor);
        buf.put_slice(self.container_id.as_bytes());
        buf.put_slice(&self.previous_address.octets());
        buf.put_slice(&self.current_address.octets());
        buf.put_u64(self.container_size);
        buf.put_u64(self.block_count);
        buf.to_vec()
    }

    /// Deserialize from the on-disk layout
    ///
    /// The version field is a dispatch key: a formatted header with a
    /// version this build does not know is rejected rather than decoded
    /// with the wrong layout. A header whose magic does not match is
    /// returned as-is so callers can report it as unformatted.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(StowageError::TruncatedHeader {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }

        let mut buf = bytes;
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);

        let header_size = buf.get_u8();
        let version_major = buf.get_u8();
        let version_minor = buf.get_u8();

        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);

        let mut prev = [0u8; 4];
        buf.copy_to_slice(&mut prev);
        let mut cur = [0u8; 4];
        buf.copy_to_slice(&mut cur);

        let container_size = buf.get_u64();
        let block_count = buf.get_u64();

        if magic == MAGIC && (version_major, version_minor) != (VERSION_MAJOR, VERSION_MINOR) {
            return Err(StowageError::UnsupportedVersion {
                major: version_major,
                minor: version_minor,
            });
        }

        Ok(ContainerHeader {
            magic,
            header_size,
            version_major,
            version_minor,
            container_id: Uuid::from_bytes(id),
            previous_address: Ipv4Addr::from(prev),
            current_address: Ipv4Addr::from(cur),
            container_size,
            block_count,
        })
    }
}

impl Default for ContainerHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the container header from the start of `path`
pub fn read_header(path: impl AsRef<Path>) -> Result<ContainerHeader> {
    let path = path.as_ref();
    debug!("Reading {} byte header from {:?}", HEADER_LEN, path);

    let file =
        File::open(path).map_err(|e| StowageError::io_context("open", path, e))?;

    let mut buf = Vec::with_capacity(HEADER_LEN);
    let n = file
        .take(HEADER_LEN as u64)
        .read_to_end(&mut buf)
        .map_err(|e| StowageError::io_context("read", path, e))?;
    debug!("Read {} header bytes from {:?}", n, path);

    ContainerHeader::from_bytes(&buf)
}

/// Write the container header at offset 0 of `path`
///
/// `container_size` is refreshed from the file's current size immediately
/// before serializing. The write is positioned, so it lands at offset 0
/// no matter what mode the file would otherwise be opened in.
pub fn write_header(path: impl AsRef<Path>, header: &mut ContainerHeader) -> Result<()> {
    let path = path.as_ref();

    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| StowageError::io_context("open", path, e))?;

    let meta = file
        .metadata()
        .map_err(|e| StowageError::io_context("stat", path, e))?;
    header.container_size = meta.len();

    let bytes = header.to_bytes();
    file.write_all_at(&bytes, 0)
        .map_err(|e| StowageError::io_context("write", path, e))?;
    debug!("Wrote {} header bytes to {:?}", bytes.len(), path);

    Ok(())
}

/// Initialize a container at `path`
///
/// Writes a fresh header and returns it. Refuses to overwrite an already
/// formatted container unless `force` is set. A file too small to even hold
/// a header is treated as unformatted.
pub fn initialize_container(path: impl AsRef<Path>, force: bool) -> Result<ContainerHeader> {
    let path = path.as_ref();

    match read_header(path) {
        Ok(existing) if existing.matches_format() && !force => {
            return Err(StowageError::AlreadyFormatted(path.to_path_buf()));
        }
        Ok(_) | Err(StowageError::TruncatedHeader { .. }) => {}
        // A formatted container from a newer build may still be wiped
        Err(StowageError::UnsupportedVersion { .. }) if force => {}
        Err(e) => return Err(e),
    }

    let mut header = ContainerHeader::new();
    write_header(path, &mut header)?;
    debug!(
        "Initialized container {:?} with id {}",
        path, header.container_id
    );
    Ok(header)
}
