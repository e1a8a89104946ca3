//! Stowage server
//!
//! Serves a container as a network block device, with administrative
//! paths for initializing storage and appending blocks.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use stowage::{
    detect, initialize_container, read_header, BackendRegistry, ExportConfig, LedgerAllocator,
    NbdServer, ServerConfig, StoreConfig,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "stowage-server")]
#[command(about = "Serve a container file or device as a network block device")]
struct Args {
    /// Path to the backing storage (file or device)
    path: PathBuf,

    /// Enable the health check webserver
    #[arg(long, env = "STOWAGE_WEBSERVER")]
    webserver: bool,

    /// Initialize the storage container, then exit
    #[arg(long)]
    init_store: bool,

    /// Force an operation; CAUTION, can cause data loss
    #[arg(long)]
    force: bool,

    /// Append one storage block, then exit
    #[arg(long)]
    add_block: bool,

    /// Logging verbosity, 0 = none, 5 = debug
    #[arg(long, env = "STOWAGE_LOGGING", default_value_t = 4)]
    logging: u8,

    /// NBD bind address
    #[arg(long, default_value = "127.0.0.1:10809")]
    bind: SocketAddr,

    /// Export name served to initiators
    #[arg(long, default_value = "stowage")]
    export: String,

    /// Block size for ledger appends (bytes)
    #[arg(long, default_value_t = stowage::DEFAULT_BLOCK_SIZE)]
    block_size: u64,

    /// Health endpoint bind address
    #[arg(long, default_value = "127.0.0.1:8080")]
    health_bind: SocketAddr,
}

fn init_logging(level: u8) {
    let filter = match level {
        0 => "off",
        1 | 2 => "error",
        3 => "warn",
        4 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.logging);

    info!("Starting stowage");

    let store = StoreConfig::new().block_size(args.block_size);

    if args.init_store {
        let header = initialize_container(&args.path, args.force)?;
        info!(
            "Initialized container {:?}: id {}, {} bytes",
            args.path, header.container_id, header.container_size
        );
        return Ok(());
    }

    if args.add_block {
        let header = read_header(&args.path)?;
        anyhow::ensure!(
            header.matches_format(),
            "unformatted container: {:?}",
            args.path
        );
        let allocator = LedgerAllocator::new(store);
        let descriptor = allocator.append_block(&args.path)?;
        info!(
            "Appended block at offset {} in {:?}",
            descriptor.block_position, args.path
        );
        return Ok(());
    }

    let config = ServerConfig::new()
        .bind(args.bind)
        .export_name(args.export)
        .health_bind(args.health_bind);

    if args.webserver {
        stowage::health::start_webserver(config.health_addr).await?;
    }

    // Gate the path and report container state before serving
    match detect(&args.path) {
        Ok(report) => {
            info!("Detected storage: {}", serde_json::to_string(&report)?);
            if report.formatted == Some(false) {
                warn!("Container is unformatted; run with --init-store first");
            }
        }
        Err(e) => warn!("{}", e),
    }

    let registry = Arc::new(BackendRegistry::new());
    registry.register_container(ExportConfig {
        name: config.export_name.clone(),
        path: args.path.clone(),
        store,
    });

    let server = NbdServer::bind(&config, registry).await?;

    tokio::select! {
        result = server.serve() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
