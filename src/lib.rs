//! # Stowage - Container-Backed Network Block Devices
//!
//! `stowage` exposes a file- or device-backed container as a remotely
//! mountable block device over NBD, without a full storage stack:
//!
//! - **Fixed binary container format** with a header and append-only block
//!   ledger
//! - **Capability-contract backends**: any storage implementing
//!   [`BlockBackend`] can be registered under an export name and served
//! - **Synchronous core, async engine**: the container core is plain
//!   blocking I/O; only the protocol engine runs on tokio
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stowage::{initialize_container, LedgerAllocator, Result, StoreConfig};
//!
//! # fn main() -> Result<()> {
//! // Format a pre-sized file as a container
//! let header = initialize_container("volume.img", false)?;
//! println!("container id: {}", header.container_id);
//!
//! // Provision a block
//! let allocator = LedgerAllocator::new(StoreConfig::default());
//! allocator.append_block("volume.img")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Serving
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stowage::{BackendRegistry, ExportConfig, NbdServer, ServerConfig, StoreConfig};
//!
//! # async fn serve() -> stowage::Result<()> {
//! let registry = Arc::new(BackendRegistry::new());
//! registry.register_container(ExportConfig {
//!     name: "stowage".into(),
//!     path: "volume.img".into(),
//!     store: StoreConfig::default(),
//! });
//!
//! let server = NbdServer::bind(&ServerConfig::default(), registry).await?;
//! server.serve().await
//! # }
//! ```
//!
//! ## Concurrency
//!
//! Mutating operations on a container (initialization, block appends,
//! header rewrites) perform unlocked read-modify-write cycles and must be
//! serialized by the caller; run them while the device is not being served.
//! Concurrent reads through a backend need no coordination.

pub mod config;
pub mod core;
pub mod error;
pub mod health;
pub mod nbd;

pub use crate::config::{ServerConfig, StoreConfig, DEFAULT_BLOCK_SIZE};
pub use crate::core::backend::{
    BackendRegistry, BlockBackend, ConnectionContext, ContainerBackend, ExportConfig, Geometry,
};
pub use crate::core::header::{
    initialize_container, read_header, write_header, ContainerHeader, HEADER_LEN, MAGIC,
};
pub use crate::core::inspect::{classify, detect, DetectionReport, PathKind};
pub use crate::core::ledger::{BlockDescriptor, LedgerAllocator, BLOCK_MAGIC, DESCRIPTOR_LEN};
pub use crate::error::{Result, StowageError};
pub use crate::nbd::NbdServer;
