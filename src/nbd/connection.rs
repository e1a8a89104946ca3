//! Per-connection NBD protocol handler
//!
//! Runs the three protocol phases for one client: greeting, option
//! negotiation, transmission. A backend instance is created through the
//! registry when the client settles on an export and is closed when the
//! session ends, however it ends.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use super::{
    handshake, NbdCommand, NbdOption, NbdRequest, OptionReply, SimpleReply, TransmissionFlags,
    NBD_INIT_MAGIC, NBD_OPTS_MAGIC, NBD_REP_MAGIC,
};
use crate::core::backend::{BackendRegistry, BlockBackend, ConnectionContext};
use crate::error::{Result, StowageError};

/// Errno for commands the backend does not implement.
const ENOTSUP: u32 = 95;

/// Run a blocking backend call off the async executor.
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StowageError::Protocol(format!("backend task failed: {}", e)))?
}

/// Outcome of one negotiated option
enum OptionOutcome {
    Continue,
    Serve(Arc<dyn BlockBackend>),
    Abort,
}

/// NBD connection handler
pub struct Connection {
    stream: TcpStream,
    registry: Arc<BackendRegistry>,
    ctx: ConnectionContext,
    no_zeroes: bool,
}

impl Connection {
    /// Create a handler for an accepted stream
    pub fn new(stream: TcpStream, registry: Arc<BackendRegistry>, ctx: ConnectionContext) -> Self {
        Connection {
            stream,
            registry,
            ctx,
            no_zeroes: false,
        }
    }

    /// Drive the connection to completion
    pub async fn run(mut self) -> Result<()> {
        self.send_greeting().await?;
        self.receive_client_flags().await?;

        let backend = loop {
            match self.handle_option().await? {
                OptionOutcome::Continue => continue,
                OptionOutcome::Serve(backend) => break backend,
                OptionOutcome::Abort => {
                    debug!("Client aborted during negotiation");
                    return Ok(());
                }
            }
        };

        info!("Entering transmission phase");
        let result = self.transmission(backend.clone()).await;

        let close_result = run_blocking(move || backend.close()).await;
        result.and(close_result)
    }

    async fn send_greeting(&mut self) -> Result<()> {
        let mut buf = BytesMut::with_capacity(18);
        buf.put_u64(NBD_INIT_MAGIC);
        buf.put_u64(NBD_OPTS_MAGIC);
        buf.put_u16(handshake::FIXED_NEWSTYLE | handshake::NO_ZEROES);

        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        debug!("Sent server greeting");
        Ok(())
    }

    async fn receive_client_flags(&mut self) -> Result<()> {
        let flags = self.stream.read_u32().await?;
        self.no_zeroes = flags & handshake::NO_ZEROES as u32 != 0;
        debug!("Received client flags: {:08x}", flags);
        Ok(())
    }

    async fn handle_option(&mut self) -> Result<OptionOutcome> {
        let magic = self.stream.read_u64().await?;
        if magic != NBD_OPTS_MAGIC {
            return Err(StowageError::Protocol(format!(
                "Invalid option magic: {:016x}",
                magic
            )));
        }

        let option_code = self.stream.read_u32().await?;
        let data_len = self.stream.read_u32().await?;
        let mut data = vec![0u8; data_len as usize];
        if data_len > 0 {
            self.stream.read_exact(&mut data).await?;
        }
        trace!("Received option {} ({} data bytes)", option_code, data_len);

        match NbdOption::try_from(option_code) {
            Ok(NbdOption::ExportName) => {
                let name = String::from_utf8_lossy(&data).to_string();
                self.handle_export_name(&name).await
            }
            Ok(NbdOption::Abort) => {
                // Best effort; the client may already have hung up
                let _ = self
                    .send_option_reply(option_code, OptionReply::Ack, &[])
                    .await;
                Ok(OptionOutcome::Abort)
            }
            Ok(NbdOption::List) => {
                self.send_export_list(option_code).await?;
                Ok(OptionOutcome::Continue)
            }
            Ok(NbdOption::Info) => {
                self.handle_info(option_code, &data).await?;
                Ok(OptionOutcome::Continue)
            }
            Ok(NbdOption::Go) => self.handle_go(option_code, &data).await,
            Err(_) => {
                self.send_option_reply(option_code, OptionReply::ErrUnsup, &[])
                    .await?;
                Ok(OptionOutcome::Continue)
            }
        }
    }

    /// NBD_OPT_EXPORT_NAME: no reply header, raw export info or disconnect
    async fn handle_export_name(&mut self, name: &str) -> Result<OptionOutcome> {
        let backend = self.registry.create(name, &self.ctx)?;
        let geometry = backend.geometry();
        let flags = TransmissionFlags::for_backend(backend.as_ref());

        let mut buf = BytesMut::with_capacity(134);
        buf.put_u64(geometry.size);
        buf.put_u16(flags.bits());
        if !self.no_zeroes {
            buf.put_bytes(0, 124);
        }

        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        info!("Client attached to export '{}'", name);
        Ok(OptionOutcome::Serve(backend))
    }

    async fn handle_go(&mut self, option_code: u32, data: &[u8]) -> Result<OptionOutcome> {
        let name = match parse_option_name(data) {
            Ok(name) => name,
            Err(_) => {
                self.send_option_reply(option_code, OptionReply::ErrInvalid, &[])
                    .await?;
                return Ok(OptionOutcome::Continue);
            }
        };

        match self.registry.create(&name, &self.ctx) {
            Ok(backend) => {
                self.send_export_info(option_code, backend.as_ref()).await?;
                self.send_option_reply(option_code, OptionReply::Ack, &[])
                    .await?;
                info!("Client attached to export '{}' via GO", name);
                Ok(OptionOutcome::Serve(backend))
            }
            Err(StowageError::UnknownExport(_)) => {
                self.send_option_reply(option_code, OptionReply::ErrUnknown, &[])
                    .await?;
                Ok(OptionOutcome::Continue)
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_info(&mut self, option_code: u32, data: &[u8]) -> Result<()> {
        let name = match parse_option_name(data) {
            Ok(name) => name,
            Err(_) => {
                return self
                    .send_option_reply(option_code, OptionReply::ErrInvalid, &[])
                    .await;
            }
        };

        // Probe without a peer so the attachment audit fields stay untouched
        match self.registry.create(&name, &ConnectionContext::default()) {
            Ok(backend) => {
                self.send_export_info(option_code, backend.as_ref()).await?;
                self.send_option_reply(option_code, OptionReply::Ack, &[])
                    .await?;
                run_blocking(move || backend.close()).await?;
            }
            Err(StowageError::UnknownExport(_)) => {
                self.send_option_reply(option_code, OptionReply::ErrUnknown, &[])
                    .await?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn send_export_list(&mut self, option_code: u32) -> Result<()> {
        for name in self.registry.names() {
            let bytes = name.as_bytes();
            let mut data = BytesMut::with_capacity(4 + bytes.len());
            data.put_u32(bytes.len() as u32);
            data.put_slice(bytes);
            self.send_option_reply(option_code, OptionReply::Server, &data)
                .await?;
        }
        self.send_option_reply(option_code, OptionReply::Ack, &[])
            .await
    }

    /// NBD_INFO_EXPORT and NBD_INFO_BLOCK_SIZE for one export
    async fn send_export_info(
        &mut self,
        option_code: u32,
        backend: &dyn BlockBackend,
    ) -> Result<()> {
        let geometry = backend.geometry();
        let flags = TransmissionFlags::for_backend(backend);

        let mut data = BytesMut::with_capacity(12);
        data.put_u16(0); // NBD_INFO_EXPORT
        data.put_u64(geometry.size);
        data.put_u16(flags.bits());
        self.send_option_reply(option_code, OptionReply::Info, &data)
            .await?;

        let mut data = BytesMut::with_capacity(14);
        data.put_u16(3); // NBD_INFO_BLOCK_SIZE
        data.put_u32(geometry.minimum);
        data.put_u32(geometry.preferred);
        data.put_u32(geometry.maximum);
        self.send_option_reply(option_code, OptionReply::Info, &data)
            .await
    }

    async fn send_option_reply(
        &mut self,
        option_code: u32,
        reply: OptionReply,
        data: &[u8],
    ) -> Result<()> {
        let mut buf = BytesMut::with_capacity(20 + data.len());
        buf.put_u64(NBD_REP_MAGIC);
        buf.put_u32(option_code);
        buf.put_u32(reply as u32);
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);

        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn transmission(&mut self, backend: Arc<dyn BlockBackend>) -> Result<()> {
        let mut frame = [0u8; NbdRequest::SIZE];

        loop {
            match self.stream.read_exact(&mut frame).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("Client disconnected");
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let request = NbdRequest::parse(&frame)?;
            trace!(
                "Request: {:?} offset={} len={}",
                request.command,
                request.offset,
                request.length
            );

            match request.command {
                NbdCommand::Read => self.handle_read(&request, &backend).await?,
                NbdCommand::Write => self.handle_write(&request, &backend).await?,
                NbdCommand::Flush => {
                    let be = backend.clone();
                    let result = run_blocking(move || be.flush()).await;
                    self.reply_result(&request, result.map(|_| ())).await?;
                }
                NbdCommand::Trim => {
                    let be = backend.clone();
                    let (length, offset) = (request.length, request.offset);
                    let result = run_blocking(move || be.trim(length, offset)).await;
                    self.reply_result(&request, result.map(|_| ())).await?;
                }
                NbdCommand::Cache => {
                    self.send_reply(SimpleReply::ok(request.cookie)).await?;
                }
                NbdCommand::Disc => {
                    debug!("Client requested disconnect");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_read(
        &mut self,
        request: &NbdRequest,
        backend: &Arc<dyn BlockBackend>,
    ) -> Result<()> {
        let be = backend.clone();
        let (offset, length) = (request.offset, request.length as usize);

        let result = run_blocking(move || {
            let mut buf = vec![0u8; length];
            be.read_at(&mut buf, offset)?;
            Ok(buf)
        })
        .await;

        match result {
            Ok(data) => {
                let mut buf = BytesMut::with_capacity(SimpleReply::SIZE + data.len());
                SimpleReply::ok(request.cookie).encode(&mut buf);
                buf.put_slice(&data);
                self.stream.write_all(&buf).await?;
                Ok(())
            }
            Err(e) => {
                warn!("Read failed: {}", e);
                self.send_reply(SimpleReply::err(request.cookie, e.to_nbd_errno()))
                    .await
            }
        }
    }

    async fn handle_write(
        &mut self,
        request: &NbdRequest,
        backend: &Arc<dyn BlockBackend>,
    ) -> Result<()> {
        // The payload is always on the wire; drain it before any reply
        let mut data = vec![0u8; request.length as usize];
        self.stream.read_exact(&mut data).await?;

        if !backend.has_fua() && request.wants_fua() {
            return self
                .send_reply(SimpleReply::err(request.cookie, ENOTSUP))
                .await;
        }

        let be = backend.clone();
        let (offset, fua) = (request.offset, request.wants_fua());
        let result = run_blocking(move || be.write_at(&data, offset, fua)).await;

        self.reply_result(request, result.map(|_| ())).await
    }

    async fn reply_result(&mut self, request: &NbdRequest, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => self.send_reply(SimpleReply::ok(request.cookie)).await,
            Err(e) => {
                warn!("{:?} failed: {}", request.command, e);
                self.send_reply(SimpleReply::err(request.cookie, e.to_nbd_errno()))
                    .await
            }
        }
    }

    async fn send_reply(&mut self, reply: SimpleReply) -> Result<()> {
        let mut buf = BytesMut::with_capacity(SimpleReply::SIZE);
        reply.encode(&mut buf);
        self.stream.write_all(&buf).await?;
        Ok(())
    }
}

/// Parse the name-prefixed payload of GO and INFO options
/// (u32 name length, name bytes, u16 info-request count)
fn parse_option_name(data: &[u8]) -> Result<String> {
    if data.len() < 4 {
        return Err(StowageError::Protocol("Option data too short".to_string()));
    }

    let mut buf = data;
    let name_len = buf.get_u32() as usize;
    if buf.remaining() < name_len {
        return Err(StowageError::Protocol(
            "Option name length exceeds payload".to_string(),
        ));
    }

    Ok(String::from_utf8_lossy(&buf[..name_len]).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_option_name() {
        let mut data = BytesMut::new();
        data.put_u32(7);
        data.put_slice(b"stowage");
        data.put_u16(0);

        assert_eq!(parse_option_name(&data).unwrap(), "stowage");
    }

    #[test]
    fn test_parse_option_name_empty() {
        let mut data = BytesMut::new();
        data.put_u32(0);
        data.put_u16(0);

        assert_eq!(parse_option_name(&data).unwrap(), "");
    }

    #[test]
    fn test_parse_option_name_malformed() {
        assert!(parse_option_name(&[0, 0]).is_err());

        let mut data = BytesMut::new();
        data.put_u32(50); // claims more bytes than present
        data.put_slice(b"short");
        assert!(parse_option_name(&data).is_err());
    }
}
