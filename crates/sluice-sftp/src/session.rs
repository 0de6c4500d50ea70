//! SFTP protocol engine
//!
//! A [`Session`] drives one client conversation over an input and an output
//! stream: it negotiates the protocol version, decodes each request, calls the
//! [`SftpHandler`], and writes exactly one response per request id.
//!
//! NIST 800-53: SI-10 (Information Input Validation), SI-11 (Error Handling)
//! Implementation: Frame lengths are checked against the configured maximum
//! before anything is read, reads never cross a frame boundary, and every
//! non-fatal failure is answered with a status code.

use crate::attrs::NameEntry;
use crate::codec::{StreamReader, StreamWriter, response_mask};
use crate::config::{SessionConfig, SymlinkOrder};
use crate::error::{Error, Result};
use crate::handler::SftpHandler;
use crate::handles::{Handle, HandleTable, Target};
use crate::protocol::{MessageType, OpenFlags, SFTP_VERSION, StatusCode};
use bytes::Bytes;
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Type byte, request id and data length ahead of the bytes in a Data response
const DATA_HEADER_LEN: usize = 9;

/// Negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unversioned,
    Versioned(u32),
    Closed,
}

/// Outcome of one request, before encoding
enum Response {
    Status(StatusCode),
    Handle(Handle),
    Data(Bytes),
    Name(Vec<NameEntry>),
    Attrs(crate::attrs::Attributes),
    ExtendedReply(Bytes),
}

/// One SFTP session over a pair of byte streams
pub struct Session<R, W, H: SftpHandler> {
    input: R,
    output: W,
    config: SessionConfig,
    handler: H,
}

impl<R, W, H> Session<R, W, H>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    H: SftpHandler,
{
    /// Session reading requests from `input` and writing responses to `output`
    pub fn new(input: R, output: W, config: SessionConfig, handler: H) -> Self {
        Self {
            input,
            output,
            config,
            handler,
        }
    }

    /// Serve requests until the client ends the session
    ///
    /// Returns `Ok(())` on a zero-length frame, a clean end of input, or
    /// cancellation. Transport failures, truncated frames and oversize frames
    /// are returned as errors.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        self.config.validate()?;

        let Session {
            input,
            output,
            config,
            handler,
        } = self;

        let mut engine = Engine {
            reader: StreamReader::new(input, cancel.clone()),
            writer: StreamWriter::new(output, config.max_message_size, cancel),
            handles: HandleTable::new(config.page_size),
            handler,
            config,
            state: State::Unversioned,
        };

        info!(event = "session_started", user = %engine.config.user);

        let result = engine.serve().await;
        engine.state = State::Closed;
        engine.release_handles().await;

        match result {
            Ok(()) => {
                info!(event = "session_ended");
                Ok(())
            }
            Err(Error::Cancelled) => {
                info!(event = "session_cancelled");
                Ok(())
            }
            Err(e) => {
                error!(event = "session_failed", error = %e);
                Err(e)
            }
        }
    }
}

struct Engine<R, W, H: SftpHandler> {
    reader: StreamReader<R>,
    writer: StreamWriter<W>,
    handles: HandleTable<H::File>,
    handler: H,
    config: SessionConfig,
    state: State,
}

impl<R, W, H> Engine<R, W, H>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    H: SftpHandler,
{
    async fn serve(&mut self) -> Result<()> {
        loop {
            let len = match self.reader.read_frame_len().await? {
                None => {
                    debug!(event = "input_closed");
                    return Ok(());
                }
                Some(0) => {
                    debug!(event = "end_of_session_frame");
                    return Ok(());
                }
                Some(len) => len,
            };

            if len as usize > self.config.max_message_size {
                warn!(
                    event = "frame_too_large",
                    len,
                    max = self.config.max_message_size
                );
                return Err(Error::FrameTooLarge {
                    len,
                    max: self.config.max_message_size,
                });
            }

            self.reader.begin_frame(len as usize);
            self.process_frame().await?;
            self.reader.finish_frame().await?;

            if !self.writer.is_empty() {
                self.writer.flush().await?;
            }
        }
    }

    /// Handle one frame; only session-ending errors are returned
    async fn process_frame(&mut self) -> Result<()> {
        let type_byte = self.reader.read_u8().await?;
        let message_type = MessageType::try_from(type_byte);

        let version = match self.state {
            State::Versioned(version) => version,
            State::Unversioned | State::Closed => {
                if matches!(message_type, Ok(MessageType::Init)) {
                    return self.handle_init().await;
                }
                debug!(event = "ignored_before_init", message_type = type_byte);
                return Ok(());
            }
        };

        let request_id = match self.reader.read_u32().await {
            Ok(id) => id,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(event = "missing_request_id", message_type = type_byte, error = %e);
                return Ok(());
            }
        };

        let outcome = match message_type {
            Ok(message_type) if message_type.is_request() => {
                debug!(event = "request", request_id, message_type = ?message_type);
                self.dispatch(message_type, request_id).await
            }
            _ => {
                warn!(event = "unsupported_message", request_id, message_type = type_byte);
                Ok(Response::Status(StatusCode::OpUnsupported))
            }
        };

        let response = match outcome {
            Ok(response) => response,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                if e.is_security_event() {
                    warn!(
                        event = "request_denied",
                        request_id,
                        error = %e.sanitized_message()
                    );
                } else if e.is_client_error() {
                    debug!(event = "request_rejected", request_id, error = %e);
                } else {
                    warn!(event = "request_failed", request_id, error = %e);
                }
                Response::Status(e.to_status_code())
            }
        };

        self.write_response(version, request_id, response);
        Ok(())
    }

    async fn handle_init(&mut self) -> Result<()> {
        let client_version = match self.reader.read_u32().await {
            Ok(version) => version,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(event = "malformed_init", error = %e);
                return Ok(());
            }
        };

        let mut client_extensions = BTreeMap::new();
        while self.reader.remaining() > 0 {
            let pair = match self.reader.read_string().await {
                Ok(name) => self.reader.read_string().await.map(|value| (name, value)),
                Err(e) => Err(e),
            };
            match pair {
                Ok((name, value)) => {
                    client_extensions.insert(name, value);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(event = "malformed_init_extensions", error = %e);
                    break;
                }
            }
        }

        let negotiated = client_version.min(SFTP_VERSION);
        let server_extensions = self
            .handler
            .init(client_version, &self.config.user, &client_extensions)
            .await?;

        self.writer.write_u8(MessageType::Version as u8);
        self.writer.write_u32(negotiated);
        for (name, value) in &server_extensions {
            self.writer.write_string(name);
            self.writer.write_string(value);
        }

        if negotiated > 0 {
            self.state = State::Versioned(negotiated);
        }

        info!(
            event = "version_negotiated",
            client_version,
            version = negotiated,
            client_extensions = client_extensions.len(),
            server_extensions = server_extensions.len()
        );
        Ok(())
    }

    async fn dispatch(&mut self, message_type: MessageType, request_id: u32) -> Result<Response> {
        match message_type {
            MessageType::Open => self.handle_open().await,
            MessageType::Close => self.handle_close().await,
            MessageType::Read => self.handle_read().await,
            MessageType::Write => self.handle_write().await,
            MessageType::Lstat => {
                let path = self.reader.read_string().await?;
                Ok(Response::Attrs(self.handler.lstat(&path).await?))
            }
            MessageType::Stat => {
                let path = self.reader.read_string().await?;
                Ok(Response::Attrs(self.handler.stat(&path).await?))
            }
            MessageType::Fstat => self.handle_fstat().await,
            MessageType::Setstat => self.handle_setstat().await,
            MessageType::Fsetstat => self.handle_fsetstat().await,
            MessageType::Opendir => self.handle_opendir().await,
            MessageType::Readdir => self.handle_readdir().await,
            MessageType::Remove => {
                let path = self.reader.read_string().await?;
                self.handler.remove(&path).await?;
                info!(event = "file_removed", request_id, path = %path);
                Ok(Response::Status(StatusCode::Ok))
            }
            MessageType::Mkdir => {
                let path = self.reader.read_string().await?;
                let attrs = self.reader.read_attributes().await?;
                self.handler.mkdir(&path, &attrs).await?;
                info!(event = "directory_created", request_id, path = %path);
                Ok(Response::Status(StatusCode::Ok))
            }
            MessageType::Rmdir => {
                let path = self.reader.read_string().await?;
                self.handler.rmdir(&path).await?;
                info!(event = "directory_removed", request_id, path = %path);
                Ok(Response::Status(StatusCode::Ok))
            }
            MessageType::Realpath => self.handle_realpath().await,
            MessageType::Rename => {
                let old_path = self.reader.read_string().await?;
                let new_path = self.reader.read_string().await?;
                self.handler.rename(&old_path, &new_path).await?;
                info!(event = "renamed", request_id, from = %old_path, to = %new_path);
                Ok(Response::Status(StatusCode::Ok))
            }
            MessageType::Readlink => {
                let path = self.reader.read_string().await?;
                let entry = self.handler.read_link(&path).await?;
                Ok(Response::Name(vec![entry]))
            }
            MessageType::Symlink => self.handle_symlink(request_id).await,
            MessageType::Extended => self.handle_extended(request_id).await,
            other => Err(Error::not_supported(format!("{:?} request", other))),
        }
    }

    async fn read_handle(&mut self) -> Result<Handle> {
        Ok(Handle::from(self.reader.read_string().await?))
    }

    async fn handle_open(&mut self) -> Result<Response> {
        let path = self.reader.read_string().await?;
        let flags = OpenFlags::from_bits_truncate(self.reader.read_u32().await?);
        let attrs = self.reader.read_attributes().await?;

        let mode = flags.to_open_mode()?;
        let access = flags.to_access_mode();
        let file = self.handler.open(&path, mode, access, &attrs).await?;
        let handle = self.handles.create_file_handle(path.as_str(), file);

        debug!(event = "file_opened", path = %path, mode = ?mode, access = ?access, handle = %handle);
        Ok(Response::Handle(handle))
    }

    async fn handle_close(&mut self) -> Result<Response> {
        let handle = self.read_handle().await?;
        let path = self.handles.resolve(&handle)?.to_string();

        if let Some(file) = self.handles.close(&handle)? {
            self.handler.close(&path, file).await?;
        }

        debug!(event = "handle_closed", handle = %handle, path = %path);
        Ok(Response::Status(StatusCode::Ok))
    }

    async fn handle_read(&mut self) -> Result<Response> {
        let handle = self.read_handle().await?;
        let offset = self.reader.read_u64().await?;
        let requested = self.reader.read_u32().await?;

        let limit = self.config.max_message_size.saturating_sub(DATA_HEADER_LEN);
        let len = requested.min(u32::try_from(limit).unwrap_or(u32::MAX));

        let (path, file) = self.handles.resolve_stream(&handle)?;
        let data = self.handler.read(path, file, offset, len).await?;
        Ok(Response::Data(data))
    }

    async fn handle_write(&mut self) -> Result<Response> {
        let handle = self.read_handle().await?;
        let offset = self.reader.read_u64().await?;
        let data = self.reader.read_binary().await?;

        let (path, file) = self.handles.resolve_stream(&handle)?;
        self.handler.write(path, file, offset, data).await?;
        Ok(Response::Status(StatusCode::Ok))
    }

    async fn handle_fstat(&mut self) -> Result<Response> {
        let handle = self.read_handle().await?;

        let attrs = match self.handles.resolve_target(&handle)? {
            Target::File { path, file } => self.handler.fstat(path, file).await?,
            Target::Directory { path } => self.handler.stat(path).await?,
        };
        Ok(Response::Attrs(attrs))
    }

    async fn handle_setstat(&mut self) -> Result<Response> {
        let path = self.reader.read_string().await?;
        let attrs = self.reader.read_attributes().await?;

        self.handler.setstat(&path, &attrs).await?;
        info!(event = "attributes_set", path = %path, flags = attrs.flags().bits());
        Ok(Response::Status(StatusCode::Ok))
    }

    async fn handle_fsetstat(&mut self) -> Result<Response> {
        let handle = self.read_handle().await?;
        let attrs = self.reader.read_attributes().await?;

        match self.handles.resolve_target(&handle)? {
            Target::File { path, file } => self.handler.fsetstat(path, file, &attrs).await?,
            Target::Directory { path } => self.handler.setstat(path, &attrs).await?,
        }
        info!(event = "attributes_set", handle = %handle, flags = attrs.flags().bits());
        Ok(Response::Status(StatusCode::Ok))
    }

    async fn handle_opendir(&mut self) -> Result<Response> {
        let path = self.reader.read_string().await?;
        self.handler.open_dir(&path).await?;
        let handle = self.handles.create_dir_handle(path.as_str());

        debug!(event = "directory_opened", path = %path, handle = %handle);
        Ok(Response::Handle(handle))
    }

    async fn handle_readdir(&mut self) -> Result<Response> {
        let handle = self.read_handle().await?;

        if self.handles.needs_listing(&handle)? {
            let path = self.handles.resolve_dir(&handle)?.to_string();
            let entries = self.handler.read_dir(&path).await?;
            debug!(event = "directory_listed", path = %path, entries = entries.len());
            self.handles.begin_listing(&handle, entries)?;
        }

        match self.handles.next_page(&handle)? {
            Some(page) => Ok(Response::Name(page)),
            None => Ok(Response::Status(StatusCode::Eof)),
        }
    }

    async fn handle_realpath(&mut self) -> Result<Response> {
        let mut path = self.reader.read_string().await?;
        if path.is_empty() || path == "." {
            path = "/".to_string();
        }

        let resolved = self.handler.real_path(&path).await?;
        Ok(Response::Name(vec![NameEntry::from_path(resolved)]))
    }

    async fn handle_symlink(&mut self, request_id: u32) -> Result<Response> {
        let first = self.reader.read_string().await?;
        let second = self.reader.read_string().await?;

        let (link_path, target_path) = match self.config.symlink_order {
            SymlinkOrder::Openssh => (second, first),
            SymlinkOrder::Rfc => (first, second),
        };

        self.handler.symlink(&link_path, &target_path).await?;
        info!(event = "symlink_created", request_id, link = %link_path, target = %target_path);
        Ok(Response::Status(StatusCode::Ok))
    }

    async fn handle_extended(&mut self, request_id: u32) -> Result<Response> {
        let name = self.reader.read_string().await?;
        let payload = self.reader.read_remaining().await?;

        debug!(event = "extended_request", request_id, name = %name, len = payload.len());
        match self.handler.extended(&name, payload).await? {
            Some(reply) => Ok(Response::ExtendedReply(reply)),
            None => Ok(Response::Status(StatusCode::Ok)),
        }
    }

    fn write_response(&mut self, version: u32, request_id: u32, response: Response) {
        let writer = &mut self.writer;

        match response {
            Response::Status(code) => {
                writer.write_u8(MessageType::Status as u8);
                writer.write_u32(request_id);
                writer.write_u32(code.into());
                if version >= 3 {
                    writer.write_string(code.default_message());
                    writer.write_string("");
                }
            }
            Response::Handle(handle) => {
                writer.write_u8(MessageType::Handle as u8);
                writer.write_u32(request_id);
                writer.write_string(handle.as_str());
            }
            Response::Data(data) => {
                writer.write_u8(MessageType::Data as u8);
                writer.write_u32(request_id);
                writer.write_binary(&data);
            }
            Response::Name(entries) => {
                writer.write_u8(MessageType::Name as u8);
                writer.write_u32(request_id);
                writer.write_names(&entries);
            }
            Response::Attrs(attrs) => {
                writer.write_u8(MessageType::Attrs as u8);
                writer.write_u32(request_id);
                writer.write_attributes(&attrs, response_mask(&attrs));
            }
            Response::ExtendedReply(payload) => {
                writer.write_u8(MessageType::ExtendedReply as u8);
                writer.write_u32(request_id);
                writer.write_raw(&payload);
            }
        }
    }

    /// Close every file the client left open
    async fn release_handles(&mut self) {
        let open = self.handles.drain_files();
        if open.is_empty() {
            return;
        }

        info!(event = "releasing_handles", count = open.len(), state = ?self.state);
        for (path, file) in open {
            if let Err(e) = self.handler.close(&path, file).await {
                warn!(event = "handle_release_failed", path = %path, error = %e);
            }
        }
    }
}
