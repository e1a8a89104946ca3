//! Storage backend capability contract
//!
//! The seam between container storage and the protocol engine. Any storage
//! that can satisfy [`BlockBackend`] can be registered under an export name
//! and served; [`ContainerBackend`] is the implementation over one
//! formatted container.
//!
//! All operations are synchronous blocking I/O and may be invoked
//! concurrently by the engine; reads and writes use positioned I/O so no
//! seek state is shared between sessions.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::core::header::{read_header, write_header};
use crate::error::{Result, StowageError};

/// Device geometry advertised to the protocol engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Minimum transfer granularity (bytes)
    pub minimum: u32,
    /// Preferred transfer granularity (bytes)
    pub preferred: u32,
    /// Maximum transfer granularity (bytes)
    pub maximum: u32,
    /// Total addressable size (bytes)
    pub size: u64,
}

/// Capability contract a storage backend must satisfy to be served
///
/// Once [`close`](BlockBackend::close) has been called, every other
/// operation fails with [`StowageError::BackendClosed`].
pub trait BlockBackend: Send + Sync + std::fmt::Debug {
    /// Read `buf.len()` bytes from the payload region at `offset`
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write `buf` into the payload region at `offset`; when `fua` is set
    /// the data must be on stable storage before this returns `Ok`
    fn write_at(&self, buf: &[u8], offset: u64, fua: bool) -> Result<usize>;

    /// Deallocation hint; may be a no-op that still reports success
    fn trim(&self, length: u32, offset: u64) -> Result<u32>;

    /// Force all previously accepted writes to stable storage
    fn flush(&self) -> Result<()>;

    /// Release session resources; idempotent
    fn close(&self) -> Result<()>;

    /// Addressable shape of the device
    fn geometry(&self) -> Geometry;

    /// Whether per-write force-unit-access is honored
    fn has_fua(&self) -> bool {
        true
    }

    /// Whether flush is honored
    fn has_flush(&self) -> bool {
        true
    }
}

/// Per-connection context handed to backend factories
#[derive(Debug, Clone, Default)]
pub struct ConnectionContext {
    /// Peer address of the initiator, when known
    pub peer_addr: Option<SocketAddr>,
}

impl ConnectionContext {
    /// Context for an initiator at `addr`
    pub fn for_peer(addr: SocketAddr) -> Self {
        ConnectionContext {
            peer_addr: Some(addr),
        }
    }
}

/// Configuration of one served export
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Export name clients negotiate for
    pub name: String,
    /// Container path backing the export
    pub path: PathBuf,
    /// Store configuration (block size) for ledger arithmetic
    pub store: StoreConfig,
}

/// Container-backed block device
///
/// The served payload region begins after the header and the appended
/// block region; offsets are payload-relative.
#[derive(Debug)]
pub struct ContainerBackend {
    file: std::fs::File,
    path: PathBuf,
    data_start: u64,
    size: u64,
    closed: AtomicBool,
}

impl ContainerBackend {
    /// Open the container at `export.path` for serving
    ///
    /// Requires a formatted container. When the initiator's address is
    /// IPv4 it is rotated into the header's attachment-audit fields and
    /// the header is re-persisted.
    pub fn open(ctx: &ConnectionContext, export: &ExportConfig) -> Result<Self> {
        let path = export.path.clone();

        let mut header = read_header(&path)?;
        if !header.matches_format() {
            return Err(StowageError::Unformatted(path));
        }

        if let Some(SocketAddr::V4(v4)) = ctx.peer_addr {
            header.record_attachment(*v4.ip());
            write_header(&path, &mut header)?;
        }

        let data_start =
            header.header_size as u64 + header.block_count * export.store.block_size;
        let size = header.container_size.saturating_sub(data_start);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| StowageError::io_context("open", &path, e))?;

        info!(
            "Opened container {:?} for serving: {} payload bytes after offset {}",
            path, size, data_start
        );

        Ok(ContainerBackend {
            file,
            path,
            data_start,
            size,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StowageError::BackendClosed);
        }
        Ok(())
    }

    /// Bounds-check a payload-relative range and translate it to the
    /// absolute file offset. Any request starting at or past the device
    /// size is out of range, whatever its length.
    fn check_range(&self, offset: u64, length: u64) -> Result<u64> {
        let out_of_range = || StowageError::OutOfRange {
            offset,
            length,
            size: self.size,
        };

        if offset >= self.size {
            return Err(out_of_range());
        }
        let end = offset.checked_add(length).ok_or_else(out_of_range)?;
        if end > self.size {
            return Err(out_of_range());
        }

        Ok(self.data_start + offset)
    }
}

impl BlockBackend for ContainerBackend {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.ensure_open()?;
        let abs = self.check_range(offset, buf.len() as u64)?;

        self.file
            .read_exact_at(buf, abs)
            .map_err(|e| StowageError::io_context("read", &self.path, e))?;
        Ok(buf.len())
    }

    fn write_at(&self, buf: &[u8], offset: u64, fua: bool) -> Result<usize> {
        self.ensure_open()?;
        let abs = self.check_range(offset, buf.len() as u64)?;

        self.file
            .write_all_at(buf, abs)
            .map_err(|e| StowageError::io_context("write", &self.path, e))?;

        if fua {
            self.file
                .sync_data()
                .map_err(|e| StowageError::io_context("sync", &self.path, e))?;
        }

        Ok(buf.len())
    }

    fn trim(&self, length: u32, offset: u64) -> Result<u32> {
        self.ensure_open()?;
        // The format has no sparse representation; accept the hint.
        debug!(
            "Trim of {} bytes at offset {} on {:?} accepted as no-op",
            length, offset, self.path
        );
        Ok(length)
    }

    fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.file
            .sync_data()
            .map_err(|e| StowageError::io_context("sync", &self.path, e))
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Closed backend for {:?}", self.path);
        }
        Ok(())
    }

    fn geometry(&self) -> Geometry {
        Geometry {
            minimum: 1,
            preferred: 4096,
            maximum: 32 * 1024 * 1024,
            size: self.size,
        }
    }
}

/// Factory producing a backend instance for one connection
pub type BackendFactory =
    Box<dyn Fn(&ConnectionContext, &ExportConfig) -> Result<Arc<dyn BlockBackend>> + Send + Sync>;

/// Named-backend registry
///
/// Exports are registered once at process start; the engine creates one
/// backend instance per served connection.
#[derive(Default)]
pub struct BackendRegistry {
    entries: RwLock<HashMap<String, (ExportConfig, BackendFactory)>>,
}

impl BackendRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `export.name`
    pub fn register(&self, export: ExportConfig, factory: BackendFactory) {
        info!("Registering backend for export '{}'", export.name);
        self.entries
            .write()
            .insert(export.name.clone(), (export, factory));
    }

    /// Register the container backend under `export.name`
    pub fn register_container(&self, export: ExportConfig) {
        self.register(
            export,
            Box::new(|ctx, export| {
                Ok(Arc::new(ContainerBackend::open(ctx, export)?) as Arc<dyn BlockBackend>)
            }),
        );
    }

    /// Create a backend instance for the named export
    pub fn create(&self, name: &str, ctx: &ConnectionContext) -> Result<Arc<dyn BlockBackend>> {
        let entries = self.entries.read();
        let (export, factory) = entries
            .get(name)
            .ok_or_else(|| StowageError::UnknownExport(name.to_string()))?;
        factory(ctx, export)
    }

    /// Registered export names
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}
