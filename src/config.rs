//! Configuration types for the container store and the NBD server
//!
//! Block size and addresses are explicit values carried by these structs;
//! nothing here is process-global, so containers with different block sizes
//! can coexist in one process.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Default block size for newly appended blocks (bytes).
pub const DEFAULT_BLOCK_SIZE: u64 = 512_000;

/// Container store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Size of each appended block (bytes)
    pub block_size: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl StoreConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set block size
    pub fn block_size(mut self, size: u64) -> Self {
        self.block_size = size;
        self
    }
}

/// NBD server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP bind address for the NBD listener
    pub bind_addr: SocketAddr,
    /// Export name clients negotiate for
    pub export_name: String,
    /// Bind address for the health endpoint
    pub health_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:10809".parse().unwrap(),
            export_name: "stowage".to_string(),
            health_addr: "127.0.0.1:8080".parse().unwrap(),
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set export name
    pub fn export_name(mut self, name: impl Into<String>) -> Self {
        self.export_name = name.into();
        self
    }

    /// Set health endpoint address
    pub fn health_bind(mut self, addr: SocketAddr) -> Self {
        self.health_addr = addr;
        self
    }
}
