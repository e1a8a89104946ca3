//! Block ledger
//!
//! Blocks are provisioned by appending fixed-size descriptors after the
//! container header, one per block, at `header_size + n * block_size`.
//! Allocation is strictly append-only and sequential: there is no free
//! list, no reclamation, and `block_count` never shrinks. Callers that
//! need reclaim must build it as a layer above this one.
//!
//! Appending is a read-modify-write of the header with no internal
//! locking; mutating operations on one container must be serialized by
//! the caller (in practice: run them while the device is not being
//! served, or behind a single-writer guard).

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::core::header::{read_header, write_header};
use crate::error::{Result, StowageError};

/// Magic identifying a valid block descriptor.
pub const BLOCK_MAGIC: [u8; 2] = [0x5c, 0x24];

/// Serialized block descriptor length.
pub const DESCRIPTOR_LEN: usize = 35;

/// Block descriptor
///
/// Big-endian, 35 bytes: magic (2), descriptor_size (1), block_position (8),
/// alternate_id (16), block_size (8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDescriptor {
    /// Descriptor magic; anything else marks the slot invalid
    pub magic: [u8; 2],

    /// Serialized length of this descriptor
    pub descriptor_size: u8,

    /// Byte offset of this descriptor within the container, stamped at
    /// creation so the position survives without external bookkeeping
    pub block_position: u64,

    /// Echo of the owning container's id, for cross-validation
    pub alternate_id: Uuid,

    /// Payload size this descriptor accounts for
    pub block_size: u64,
}

impl BlockDescriptor {
    /// Create a descriptor stamped with the block magic and its own size;
    /// position, id, and block size are filled in by the allocator
    pub fn new() -> Self {
        BlockDescriptor {
            magic: BLOCK_MAGIC,
            descriptor_size: DESCRIPTOR_LEN as u8,
            block_position: 0,
            alternate_id: Uuid::nil(),
            block_size: 0,
        }
    }

    /// True iff the magic marks this descriptor as valid
    pub fn matches_format(&self) -> bool {
        self.magic == BLOCK_MAGIC
    }

    /// Serialize to the on-disk layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(DESCRIPTOR_LEN);
        buf.put_slice(&self.magic);
        buf.put_u8(self.descriptor_size);
        buf.put_u64(self.block_position);
        buf.put_slice(self.alternate_id.as_bytes());
        buf.put_u64(self.block_size);
        buf.to_vec()
    }

    /// Deserialize from the on-disk layout
    pub fn from_bytes(bytes: &[u8], offset: u64) -> Result<Self> {
        if bytes.len() < DESCRIPTOR_LEN {
            return Err(StowageError::InvalidDescriptor(offset));
        }

        let mut buf = bytes;
        let mut magic = [0u8; 2];
        buf.copy_to_slice(&mut magic);
        let descriptor_size = buf.get_u8();
        let block_position = buf.get_u64();
        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let block_size = buf.get_u64();

        Ok(BlockDescriptor {
            magic,
            descriptor_size,
            block_position,
            alternate_id: Uuid::from_bytes(id),
            block_size,
        })
    }
}

impl Default for BlockDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

/// Append-only block allocator for one container
///
/// Block size is an explicit configuration value, so allocators with
/// different block sizes can coexist in one process.
#[derive(Debug, Clone)]
pub struct LedgerAllocator {
    config: StoreConfig,
}

impl LedgerAllocator {
    /// Create an allocator with the given configuration
    pub fn new(config: StoreConfig) -> Self {
        LedgerAllocator { config }
    }

    /// Configured block size (bytes)
    pub fn block_size(&self) -> u64 {
        self.config.block_size
    }

    /// Append one block to the container at `path`
    ///
    /// Computes the next ledger offset from the recorded header size and
    /// block count. The whole block must fit within the container; a
    /// container of size `D` with header size `H` therefore admits exactly
    /// `floor((D - H) / B)` appends before [`StowageError::CapacityExceeded`]
    /// is returned. The header's block count does not advance on failure.
    pub fn append_block(&self, path: impl AsRef<Path>) -> Result<BlockDescriptor> {
        let path = path.as_ref();
        let block_size = self.config.block_size;

        let mut header = read_header(path)?;
        if !header.matches_format() {
            return Err(StowageError::Unformatted(path.to_path_buf()));
        }

        let next_offset = header.header_size as u64 + header.block_count * block_size;
        if next_offset + block_size > header.container_size {
            return Err(StowageError::CapacityExceeded {
                offset: next_offset,
                block_size,
                container_size: header.container_size,
            });
        }

        let mut descriptor = BlockDescriptor::new();
        descriptor.block_position = next_offset;
        descriptor.alternate_id = header.container_id;
        descriptor.block_size = block_size;

        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| StowageError::io_context("open", path, e))?;
        file.write_all_at(&descriptor.to_bytes(), next_offset)
            .map_err(|e| StowageError::io_context("write", path, e))?;

        header.block_count += 1;
        write_header(path, &mut header)?;

        debug!(
            "Appended block {} at offset {} in {:?}",
            header.block_count, next_offset, path
        );
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::header::{initialize_container, HEADER_LEN};
    use std::io::Write;

    fn container_with_size(len: usize) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; len]).unwrap();
        initialize_container(tmp.path(), false).unwrap();
        tmp
    }

    #[test]
    fn test_descriptor_round_trip() {
        let mut desc = BlockDescriptor::new();
        desc.block_position = HEADER_LEN as u64;
        desc.alternate_id = Uuid::now_v7();
        desc.block_size = 512_000;

        let bytes = desc.to_bytes();
        assert_eq!(bytes.len(), DESCRIPTOR_LEN);
        assert_eq!(&bytes[0..2], &BLOCK_MAGIC);

        let decoded = BlockDescriptor::from_bytes(&bytes, 0).unwrap();
        assert_eq!(decoded, desc);
        assert!(decoded.matches_format());
    }

    #[test]
    fn test_descriptor_too_short() {
        let err = BlockDescriptor::from_bytes(&[0u8; 10], 47).unwrap_err();
        assert!(matches!(err, StowageError::InvalidDescriptor(47)));
    }

    #[test]
    fn test_append_advances_count_and_position() {
        let tmp = container_with_size(64 * 1024);
        let alloc = LedgerAllocator::new(StoreConfig::new().block_size(4096));

        let first = alloc.append_block(tmp.path()).unwrap();
        assert_eq!(first.block_position, HEADER_LEN as u64);

        let second = alloc.append_block(tmp.path()).unwrap();
        assert_eq!(second.block_position, HEADER_LEN as u64 + 4096);

        let header = read_header(tmp.path()).unwrap();
        assert_eq!(header.block_count, 2);
    }

    #[test]
    fn test_append_stamps_container_id() {
        let tmp = container_with_size(16 * 1024);
        let header = read_header(tmp.path()).unwrap();

        let alloc = LedgerAllocator::new(StoreConfig::new().block_size(4096));
        let desc = alloc.append_block(tmp.path()).unwrap();
        assert_eq!(desc.alternate_id, header.container_id);

        // The descriptor on disk matches what the allocator returned
        let data = std::fs::read(tmp.path()).unwrap();
        let on_disk = BlockDescriptor::from_bytes(
            &data[HEADER_LEN..HEADER_LEN + DESCRIPTOR_LEN],
            HEADER_LEN as u64,
        )
        .unwrap();
        assert_eq!(on_disk, desc);
    }

    #[test]
    fn test_capacity_exhaustion() {
        // 16 KiB container, 4 KiB blocks: floor((16384 - 47) / 4096) = 3
        let tmp = container_with_size(16 * 1024);
        let alloc = LedgerAllocator::new(StoreConfig::new().block_size(4096));

        for _ in 0..3 {
            alloc.append_block(tmp.path()).unwrap();
        }

        let err = alloc.append_block(tmp.path()).unwrap_err();
        assert!(matches!(err, StowageError::CapacityExceeded { .. }));

        // Count must not advance on failure
        let header = read_header(tmp.path()).unwrap();
        assert_eq!(header.block_count, 3);
    }

    #[test]
    fn test_append_refuses_unformatted() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; 16 * 1024]).unwrap();

        let alloc = LedgerAllocator::new(StoreConfig::default());
        let err = alloc.append_block(tmp.path()).unwrap_err();
        assert!(matches!(err, StowageError::Unformatted(_)));
    }
}
