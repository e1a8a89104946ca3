//! Backend adapter integration tests
//!
//! Drives the capability contract the protocol engine consumes: bounds
//! checking, durability flags, close semantics, and geometry.

use std::io::Write;

use stowage::{
    initialize_container, read_header, BackendRegistry, BlockBackend, ConnectionContext,
    ContainerBackend, ExportConfig, LedgerAllocator, StoreConfig, StowageError, HEADER_LEN,
};

fn formatted_export(len: usize, store: StoreConfig) -> (tempfile::NamedTempFile, ExportConfig) {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&vec![0u8; len]).unwrap();
    initialize_container(tmp.path(), false).unwrap();

    let export = ExportConfig {
        name: "vol0".to_string(),
        path: tmp.path().to_path_buf(),
        store,
    };
    (tmp, export)
}

#[test]
fn test_write_read_cycle_with_fua() {
    let (_tmp, export) = formatted_export(1024 * 1024, StoreConfig::default());
    let backend = ContainerBackend::open(&ConnectionContext::default(), &export).unwrap();

    let payload: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
    let written = backend.write_at(&payload, 4096, true).unwrap();
    assert_eq!(written, payload.len());

    let mut buf = vec![0u8; payload.len()];
    let read = backend.read_at(&mut buf, 4096).unwrap();
    assert_eq!(read, payload.len());
    assert_eq!(buf, payload);

    backend.flush().unwrap();
}

#[test]
fn test_device_size_shrinks_as_blocks_are_appended() {
    let (tmp, export) = formatted_export(10 * 1024 * 1024, StoreConfig::default());

    let before = ContainerBackend::open(&ConnectionContext::default(), &export).unwrap();
    let size_before = before.geometry().size;
    assert_eq!(size_before, 10_485_760 - HEADER_LEN as u64);
    before.close().unwrap();

    let allocator = LedgerAllocator::new(StoreConfig::default());
    allocator.append_block(tmp.path()).unwrap();

    let after = ContainerBackend::open(&ConnectionContext::default(), &export).unwrap();
    assert_eq!(after.geometry().size, size_before - 512_000);
}

#[test]
fn test_payload_never_touches_header_or_ledger() {
    let (tmp, export) = formatted_export(10 * 1024 * 1024, StoreConfig::default());
    let allocator = LedgerAllocator::new(StoreConfig::default());
    let descriptor = allocator.append_block(tmp.path()).unwrap();

    let backend = ContainerBackend::open(&ConnectionContext::default(), &export).unwrap();
    backend.write_at(&vec![0xFFu8; 4096], 0, false).unwrap();

    // Header still valid, descriptor still in place
    let header = read_header(tmp.path()).unwrap();
    assert!(header.matches_format());
    assert_eq!(header.block_count, 1);

    let raw = std::fs::read(tmp.path()).unwrap();
    let start = descriptor.block_position as usize;
    assert_eq!(&raw[start..start + 2], &stowage::BLOCK_MAGIC);
}

#[test]
fn test_out_of_range_at_device_boundary() {
    let (_tmp, export) = formatted_export(128 * 1024, StoreConfig::default());
    let backend = ContainerBackend::open(&ConnectionContext::default(), &export).unwrap();
    let size = backend.geometry().size;

    // At the boundary, any length fails
    for len in [0usize, 1, 4096] {
        let mut buf = vec![0u8; len];
        let err = backend.read_at(&mut buf, size).unwrap_err();
        assert!(
            matches!(err, StowageError::OutOfRange { .. }),
            "length {} at device size should be out of range",
            len
        );
    }

    // Far past the boundary too
    let mut buf = [0u8; 1];
    assert!(matches!(
        backend.read_at(&mut buf, u64::MAX).unwrap_err(),
        StowageError::OutOfRange { .. }
    ));

    // The last valid byte is readable
    let mut buf = [0u8; 1];
    backend.read_at(&mut buf, size - 1).unwrap();
}

#[test]
fn test_trim_reports_success_without_deallocating() {
    let (_tmp, export) = formatted_export(128 * 1024, StoreConfig::default());
    let backend = ContainerBackend::open(&ConnectionContext::default(), &export).unwrap();

    backend.write_at(b"persistent", 0, false).unwrap();
    assert_eq!(backend.trim(10, 0).unwrap(), 10);

    // Trim is a hint; the data is allowed to survive and here it does
    let mut buf = vec![0u8; 10];
    backend.read_at(&mut buf, 0).unwrap();
    assert_eq!(&buf, b"persistent");
}

#[test]
fn test_close_is_idempotent_and_final() {
    let (_tmp, export) = formatted_export(128 * 1024, StoreConfig::default());
    let backend = ContainerBackend::open(&ConnectionContext::default(), &export).unwrap();

    backend.close().unwrap();
    backend.close().unwrap();

    let mut buf = [0u8; 1];
    assert!(matches!(
        backend.read_at(&mut buf, 0).unwrap_err(),
        StowageError::BackendClosed
    ));
}

#[test]
fn test_capability_flags_advertised() {
    let (_tmp, export) = formatted_export(128 * 1024, StoreConfig::default());
    let backend = ContainerBackend::open(&ConnectionContext::default(), &export).unwrap();

    assert!(backend.has_fua());
    assert!(backend.has_flush());

    let geometry = backend.geometry();
    assert_eq!(geometry.minimum, 1);
    assert_eq!(geometry.preferred, 4096);
    assert_eq!(geometry.maximum, 32 * 1024 * 1024);
}

#[test]
fn test_registry_serves_independent_sessions() {
    let (_tmp, export) = formatted_export(256 * 1024, StoreConfig::default());

    let registry = BackendRegistry::new();
    registry.register_container(export);

    let first = registry.create("vol0", &ConnectionContext::default()).unwrap();
    let second = registry.create("vol0", &ConnectionContext::default()).unwrap();

    // Closing one session must not affect the other
    first.close().unwrap();
    let mut buf = [0u8; 16];
    second.read_at(&mut buf, 0).unwrap();
}
