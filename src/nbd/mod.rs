//! NBD (Network Block Device) protocol engine
//!
//! Fixed-newstyle negotiation and simple-reply transmission, per
//! https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! The engine owns the wire; storage is reached only through the
//! [`BlockBackend`](crate::core::backend::BlockBackend) capability contract.

mod connection;
mod server;

pub use connection::Connection;
pub use server::NbdServer;

use bytes::{Buf, BufMut, BytesMut};

use crate::core::backend::BlockBackend;
use crate::error::{Result, StowageError};

/// Magic numbers
pub const NBD_INIT_MAGIC: u64 = 0x4e42444d41474943; // "NBDMAGIC"
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454f5054; // "IHAVEOPT"
pub const NBD_REP_MAGIC: u64 = 0x0003e889045565a9;
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

/// Handshake flags sent in the server greeting
pub mod handshake {
    /// Fixed newstyle negotiation
    pub const FIXED_NEWSTYLE: u16 = 1 << 0;
    /// Client may skip the 124-byte zero pad after export info
    pub const NO_ZEROES: u16 = 1 << 1;
}

/// Per-export transmission flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmissionFlags(u16);

impl TransmissionFlags {
    pub const HAS_FLAGS: u16 = 1 << 0;
    pub const SEND_FLUSH: u16 = 1 << 2;
    pub const SEND_FUA: u16 = 1 << 3;
    pub const SEND_TRIM: u16 = 1 << 5;

    /// Derive flags from a backend's advertised capabilities
    pub fn for_backend(backend: &dyn BlockBackend) -> Self {
        let mut flags = Self::HAS_FLAGS | Self::SEND_TRIM;
        if backend.has_flush() {
            flags |= Self::SEND_FLUSH;
        }
        if backend.has_fua() {
            flags |= Self::SEND_FUA;
        }
        TransmissionFlags(flags)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }
}

/// Option codes the engine answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NbdOption {
    ExportName = 1,
    Abort = 2,
    List = 3,
    Info = 6,
    Go = 7,
}

impl TryFrom<u32> for NbdOption {
    type Error = StowageError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::ExportName),
            2 => Ok(Self::Abort),
            3 => Ok(Self::List),
            6 => Ok(Self::Info),
            7 => Ok(Self::Go),
            _ => Err(StowageError::Protocol(format!("Unknown option: {}", value))),
        }
    }
}

/// Option reply types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OptionReply {
    Ack = 1,
    Server = 2,
    Info = 3,
    ErrUnsup = (1 << 31) | 1,
    ErrInvalid = (1 << 31) | 3,
    ErrUnknown = (1 << 31) | 6,
}

/// Transmission command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NbdCommand {
    Read = 0,
    Write = 1,
    Disc = 2,
    Flush = 3,
    Trim = 4,
    Cache = 5,
}

impl TryFrom<u16> for NbdCommand {
    type Error = StowageError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            2 => Ok(Self::Disc),
            3 => Ok(Self::Flush),
            4 => Ok(Self::Trim),
            5 => Ok(Self::Cache),
            _ => Err(StowageError::Protocol(format!(
                "Unknown command: {}",
                value
            ))),
        }
    }
}

/// Command flag: force unit access
pub const CMD_FLAG_FUA: u16 = 1 << 0;

/// Transmission request
#[derive(Debug, Clone)]
pub struct NbdRequest {
    /// Command flags (FUA)
    pub flags: u16,
    /// Command
    pub command: NbdCommand,
    /// Cookie echoed in the reply
    pub cookie: u64,
    /// Byte offset
    pub offset: u64,
    /// Byte length
    pub length: u32,
}

impl NbdRequest {
    /// Request frame size
    pub const SIZE: usize = 28;

    /// Parse a request frame
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(StowageError::Protocol("Request too short".to_string()));
        }

        let mut buf = data;
        let magic = buf.get_u32();
        if magic != NBD_REQUEST_MAGIC {
            return Err(StowageError::Protocol(format!(
                "Invalid request magic: {:08x}",
                magic
            )));
        }

        let flags = buf.get_u16();
        let command = NbdCommand::try_from(buf.get_u16())?;
        let cookie = buf.get_u64();
        let offset = buf.get_u64();
        let length = buf.get_u32();

        Ok(NbdRequest {
            flags,
            command,
            cookie,
            offset,
            length,
        })
    }

    /// FUA requested for this command
    pub fn wants_fua(&self) -> bool {
        self.flags & CMD_FLAG_FUA != 0
    }
}

/// Simple reply header
#[derive(Debug, Clone)]
pub struct SimpleReply {
    /// Errno, 0 for success
    pub errno: u32,
    /// Cookie from the request
    pub cookie: u64,
}

impl SimpleReply {
    /// Reply frame size
    pub const SIZE: usize = 16;

    pub fn ok(cookie: u64) -> Self {
        SimpleReply { errno: 0, cookie }
    }

    pub fn err(cookie: u64, errno: u32) -> Self {
        SimpleReply { errno, cookie }
    }

    /// Encode the reply frame
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(NBD_SIMPLE_REPLY_MAGIC);
        buf.put_u32(self.errno);
        buf.put_u64(self.cookie);
    }
}
