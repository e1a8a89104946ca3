//! NBD server accept loop

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::Connection;
use crate::config::ServerConfig;
use crate::core::backend::{BackendRegistry, ConnectionContext};
use crate::error::Result;

/// NBD server serving registered backends to connecting initiators
pub struct NbdServer {
    listener: TcpListener,
    registry: Arc<BackendRegistry>,
}

impl NbdServer {
    /// Bind the listener for `config.bind_addr`
    pub async fn bind(config: &ServerConfig, registry: Arc<BackendRegistry>) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("NBD server listening on {}", config.bind_addr);

        Ok(NbdServer { listener, registry })
    }

    /// Address the server is actually bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and serve connections until the task is dropped
    pub async fn serve(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Accepted NBD connection from {}", addr);
                    let connection = Connection::new(
                        stream,
                        self.registry.clone(),
                        ConnectionContext::for_peer(addr),
                    );
                    tokio::spawn(async move {
                        if let Err(e) = connection.run().await {
                            warn!("Connection from {} ended with error: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to accept NBD connection: {}", e);
                }
            }
        }
    }
}
