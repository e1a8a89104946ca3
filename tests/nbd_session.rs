//! End-to-end NBD session tests
//!
//! Drives the server over a real loopback socket with a minimal test
//! client: fixed-newstyle negotiation, then transmission commands.

use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use stowage::nbd::{
    NBD_INIT_MAGIC, NBD_OPTS_MAGIC, NBD_REP_MAGIC, NBD_REQUEST_MAGIC, NBD_SIMPLE_REPLY_MAGIC,
};
use stowage::{
    initialize_container, read_header, BackendRegistry, ExportConfig, NbdServer, ServerConfig,
    StoreConfig, HEADER_LEN,
};

const OPT_EXPORT_NAME: u32 = 1;
const OPT_ABORT: u32 = 2;
const OPT_LIST: u32 = 3;
const OPT_GO: u32 = 7;

const REP_ACK: u32 = 1;
const REP_SERVER: u32 = 2;
const REP_INFO: u32 = 3;
const REP_ERR_UNKNOWN: u32 = (1 << 31) | 6;

const CMD_READ: u16 = 0;
const CMD_WRITE: u16 = 1;
const CMD_DISC: u16 = 2;
const CMD_FLUSH: u16 = 3;
const CMD_TRIM: u16 = 4;
const FLAG_FUA: u16 = 1;

struct Harness {
    _container: tempfile::NamedTempFile,
    path: std::path::PathBuf,
    addr: std::net::SocketAddr,
    _server: tokio::task::JoinHandle<()>,
}

async fn start_server(container_len: usize) -> Harness {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&vec![0u8; container_len]).unwrap();
    initialize_container(tmp.path(), false).unwrap();

    let registry = Arc::new(BackendRegistry::new());
    registry.register_container(ExportConfig {
        name: "stowage".to_string(),
        path: tmp.path().to_path_buf(),
        store: StoreConfig::default(),
    });

    let config = ServerConfig::new().bind("127.0.0.1:0".parse().unwrap());
    let server = NbdServer::bind(&config, registry).await.unwrap();
    let addr = server.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = server.serve().await;
    });

    Harness {
        path: tmp.path().to_path_buf(),
        _container: tmp,
        addr,
        _server: handle,
    }
}

/// Greeting + client flags (fixed newstyle, no zeroes)
async fn handshake(stream: &mut TcpStream) {
    assert_eq!(stream.read_u64().await.unwrap(), NBD_INIT_MAGIC);
    assert_eq!(stream.read_u64().await.unwrap(), NBD_OPTS_MAGIC);
    let flags = stream.read_u16().await.unwrap();
    assert_ne!(flags & 1, 0, "server must offer fixed newstyle");

    stream.write_u32(0b11).await.unwrap();
}

async fn send_option(stream: &mut TcpStream, option: u32, data: &[u8]) {
    stream.write_u64(NBD_OPTS_MAGIC).await.unwrap();
    stream.write_u32(option).await.unwrap();
    stream.write_u32(data.len() as u32).await.unwrap();
    stream.write_all(data).await.unwrap();
}

struct OptionReply {
    option: u32,
    reply_type: u32,
    data: Vec<u8>,
}

async fn read_option_reply(stream: &mut TcpStream) -> OptionReply {
    assert_eq!(stream.read_u64().await.unwrap(), NBD_REP_MAGIC);
    let option = stream.read_u32().await.unwrap();
    let reply_type = stream.read_u32().await.unwrap();
    let len = stream.read_u32().await.unwrap();
    let mut data = vec![0u8; len as usize];
    stream.read_exact(&mut data).await.unwrap();

    OptionReply {
        option,
        reply_type,
        data,
    }
}

/// Negotiate via GO; returns the advertised export size
async fn negotiate_go(stream: &mut TcpStream, name: &str) -> u64 {
    let mut data = Vec::new();
    data.extend_from_slice(&(name.len() as u32).to_be_bytes());
    data.extend_from_slice(name.as_bytes());
    data.extend_from_slice(&0u16.to_be_bytes());
    send_option(stream, OPT_GO, &data).await;

    let mut size = None;
    loop {
        let reply = read_option_reply(stream).await;
        assert_eq!(reply.option, OPT_GO);
        match reply.reply_type {
            REP_INFO => {
                let info_type = u16::from_be_bytes([reply.data[0], reply.data[1]]);
                if info_type == 0 {
                    size = Some(u64::from_be_bytes(reply.data[2..10].try_into().unwrap()));
                }
            }
            REP_ACK => break,
            other => panic!("unexpected reply type {:08x}", other),
        }
    }
    size.expect("server never sent NBD_INFO_EXPORT")
}

async fn send_request(
    stream: &mut TcpStream,
    command: u16,
    flags: u16,
    cookie: u64,
    offset: u64,
    length: u32,
) {
    stream.write_u32(NBD_REQUEST_MAGIC).await.unwrap();
    stream.write_u16(flags).await.unwrap();
    stream.write_u16(command).await.unwrap();
    stream.write_u64(cookie).await.unwrap();
    stream.write_u64(offset).await.unwrap();
    stream.write_u32(length).await.unwrap();
}

/// Read a simple reply header; returns the errno
async fn read_reply(stream: &mut TcpStream, expected_cookie: u64) -> u32 {
    assert_eq!(stream.read_u32().await.unwrap(), NBD_SIMPLE_REPLY_MAGIC);
    let errno = stream.read_u32().await.unwrap();
    let cookie = stream.read_u64().await.unwrap();
    assert_eq!(cookie, expected_cookie);
    errno
}

#[tokio::test(flavor = "multi_thread")]
async fn test_go_negotiation_and_data_path() {
    let harness = start_server(1024 * 1024).await;
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();

    handshake(&mut stream).await;
    let size = negotiate_go(&mut stream, "stowage").await;
    assert_eq!(size, 1024 * 1024 - HEADER_LEN as u64);

    // FUA write
    let payload = b"written over the wire";
    send_request(&mut stream, CMD_WRITE, FLAG_FUA, 1, 8192, payload.len() as u32).await;
    stream.write_all(payload).await.unwrap();
    assert_eq!(read_reply(&mut stream, 1).await, 0);

    // Read it back
    send_request(&mut stream, CMD_READ, 0, 2, 8192, payload.len() as u32).await;
    assert_eq!(read_reply(&mut stream, 2).await, 0);
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, payload);

    // Flush and trim both succeed
    send_request(&mut stream, CMD_FLUSH, 0, 3, 0, 0).await;
    assert_eq!(read_reply(&mut stream, 3).await, 0);
    send_request(&mut stream, CMD_TRIM, 0, 4, 8192, 4096).await;
    assert_eq!(read_reply(&mut stream, 4).await, 0);

    // Out-of-range read answers EINVAL in-band, the session survives
    send_request(&mut stream, CMD_READ, 0, 5, size, 512).await;
    assert_eq!(read_reply(&mut stream, 5).await, 22);

    send_request(&mut stream, CMD_READ, 0, 6, 0, 8).await;
    assert_eq!(read_reply(&mut stream, 6).await, 0);
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf).await.unwrap();

    send_request(&mut stream, CMD_DISC, 0, 7, 0, 0).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_export_name_attach() {
    let harness = start_server(512 * 1024).await;
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();

    handshake(&mut stream).await;
    send_option(&mut stream, OPT_EXPORT_NAME, b"stowage").await;

    // Old-style export info: size + transmission flags (no pad, NO_ZEROES)
    let size = stream.read_u64().await.unwrap();
    assert_eq!(size, 512 * 1024 - HEADER_LEN as u64);
    let flags = stream.read_u16().await.unwrap();
    assert_ne!(flags & (1 << 2), 0, "flush must be advertised");
    assert_ne!(flags & (1 << 3), 0, "fua must be advertised");
    assert_ne!(flags & (1 << 5), 0, "trim must be advertised");

    send_request(&mut stream, CMD_DISC, 0, 1, 0, 0).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_export_is_recoverable() {
    let harness = start_server(256 * 1024).await;
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();

    handshake(&mut stream).await;

    let mut data = Vec::new();
    data.extend_from_slice(&4u32.to_be_bytes());
    data.extend_from_slice(b"nope");
    data.extend_from_slice(&0u16.to_be_bytes());
    send_option(&mut stream, OPT_GO, &data).await;

    let reply = read_option_reply(&mut stream).await;
    assert_eq!(reply.reply_type, REP_ERR_UNKNOWN);

    // Negotiation continues; the right name still works
    let size = negotiate_go(&mut stream, "stowage").await;
    assert!(size > 0);

    send_request(&mut stream, CMD_DISC, 0, 1, 0, 0).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_list_and_abort() {
    let harness = start_server(256 * 1024).await;
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();

    handshake(&mut stream).await;
    send_option(&mut stream, OPT_LIST, &[]).await;

    let entry = read_option_reply(&mut stream).await;
    assert_eq!(entry.reply_type, REP_SERVER);
    let name_len = u32::from_be_bytes(entry.data[0..4].try_into().unwrap()) as usize;
    assert_eq!(&entry.data[4..4 + name_len], b"stowage");

    let ack = read_option_reply(&mut stream).await;
    assert_eq!(ack.reply_type, REP_ACK);

    send_option(&mut stream, OPT_ABORT, &[]).await;
    let reply = read_option_reply(&mut stream).await;
    assert_eq!(reply.reply_type, REP_ACK);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_attachment_recorded_in_header() {
    let harness = start_server(256 * 1024).await;
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();

    handshake(&mut stream).await;
    let _size = negotiate_go(&mut stream, "stowage").await;
    send_request(&mut stream, CMD_DISC, 0, 1, 0, 0).await;
    drop(stream);

    // The serving attach stamped the loopback peer into the audit fields
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    loop {
        let header = read_header(&harness.path).unwrap();
        if header.current_address == std::net::Ipv4Addr::LOCALHOST {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "attachment address never recorded"
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
