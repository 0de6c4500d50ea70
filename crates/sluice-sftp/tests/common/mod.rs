//! Shared wire-level test client
//!
//! Drives a [`Session`] over an in-memory duplex pipe and decodes its
//! responses by hand, independent of the crate's own writer.

#![allow(dead_code)]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sluice_sftp::attrs::timestamp_from_wire;
use sluice_sftp::codec::{get_string, put_string};
use sluice_sftp::protocol::{AttrFlags, MessageType, Permissions, StatusCode};
use sluice_sftp::{Attributes, Result, Session, SessionConfig, SftpHandler};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// A running session plus the client end of its pipe
pub struct Harness {
    pub client: TestClient,
    pub session: JoinHandle<Result<()>>,
    pub cancel: CancellationToken,
}

pub fn start<H>(handler: H, config: SessionConfig) -> Harness
where
    H: SftpHandler + 'static,
{
    let (client, server) = tokio::io::duplex(1 << 20);
    let (input, output) = tokio::io::split(server);
    let cancel = CancellationToken::new();

    let session = Session::new(input, output, config, handler);
    let task = tokio::spawn(session.run(cancel.clone()));

    Harness {
        client: TestClient {
            stream: client,
            next_id: 1,
        },
        session: task,
        cancel,
    }
}

/// Request payload builder
#[derive(Default)]
pub struct Payload(BytesMut);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u32(mut self, value: u32) -> Self {
        self.0.put_u32(value);
        self
    }

    pub fn u64(mut self, value: u64) -> Self {
        self.0.put_u64(value);
        self
    }

    pub fn string(mut self, value: &str) -> Self {
        put_string(&mut self.0, value);
        self
    }

    pub fn raw(mut self, value: &[u8]) -> Self {
        self.0.put_slice(value);
        self
    }

    pub fn attrs(mut self, attrs: &Attributes) -> Self {
        attrs.encode(&mut self.0, attrs.flags());
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

/// One decoded name entry
#[derive(Debug, Clone)]
pub struct Name {
    pub name: String,
    pub long_name: String,
    pub attrs: Attributes,
}

pub fn parse_attrs(buf: &mut Bytes) -> Attributes {
    let flags = AttrFlags::from_bits_truncate(buf.get_u32());
    let mut attrs = Attributes::default();

    if flags.contains(AttrFlags::SIZE) {
        attrs.size = Some(buf.get_u64());
    }
    if flags.contains(AttrFlags::UIDGID) {
        attrs.uid = Some(buf.get_u32());
        attrs.gid = Some(buf.get_u32());
    }
    if flags.contains(AttrFlags::PERMISSIONS) {
        attrs.permissions = Some(Permissions::from_bits_truncate(buf.get_u32()));
    }
    if flags.contains(AttrFlags::ACMODTIME) {
        attrs.atime = timestamp_from_wire(buf.get_u32());
        attrs.mtime = timestamp_from_wire(buf.get_u32());
    }
    if flags.contains(AttrFlags::EXTENDED) {
        let count = buf.get_u32();
        let mut extended = BTreeMap::new();
        for _ in 0..count {
            let name = get_string(buf).unwrap();
            let value = get_string(buf).unwrap();
            extended.insert(name, value);
        }
        attrs.extended = extended;
    }

    attrs
}

pub fn parse_names(mut body: Bytes) -> Vec<Name> {
    let count = body.get_u32();
    let names = (0..count)
        .map(|_| Name {
            name: get_string(&mut body).unwrap(),
            long_name: get_string(&mut body).unwrap(),
            attrs: parse_attrs(&mut body),
        })
        .collect();
    assert!(body.is_empty(), "trailing bytes after name list");
    names
}

/// Status code plus message and language tag when present
pub fn parse_status(mut body: Bytes) -> (StatusCode, Option<(String, String)>) {
    let code = StatusCode::try_from(body.get_u32()).unwrap();
    if body.is_empty() {
        return (code, None);
    }
    let message = get_string(&mut body).unwrap();
    let language = get_string(&mut body).unwrap();
    assert!(body.is_empty(), "trailing bytes after status");
    (code, Some((message, language)))
}

pub struct TestClient {
    stream: DuplexStream,
    next_id: u32,
}

impl TestClient {
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    pub async fn send_frame(&mut self, payload: &[u8]) {
        let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(payload);
        self.send_raw(&frame).await;
    }

    /// Next response frame as (type byte, rest of payload)
    pub async fn recv(&mut self) -> (u8, Bytes) {
        let mut len = [0u8; 4];
        tokio::time::timeout(REPLY_TIMEOUT, self.stream.read_exact(&mut len))
            .await
            .expect("timed out waiting for a response")
            .unwrap();

        let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
        self.stream.read_exact(&mut payload).await.unwrap();

        let mut payload = Bytes::from(payload);
        let kind = payload.get_u8();
        (kind, payload)
    }

    /// Whether the server closed its end without sending anything more
    pub async fn at_eof(&mut self) -> bool {
        let mut byte = [0u8; 1];
        let n = tokio::time::timeout(REPLY_TIMEOUT, self.stream.read(&mut byte))
            .await
            .expect("timed out waiting for end of stream")
            .unwrap();
        n == 0
    }

    /// Response to `id`, checked for type and id
    pub async fn reply(&mut self, id: u32) -> (MessageType, Bytes) {
        let (kind, mut body) = self.recv().await;
        let kind = MessageType::try_from(kind).unwrap();
        assert_eq!(body.get_u32(), id, "response carries the request id");
        (kind, body)
    }

    pub async fn init(&mut self, version: u32) -> (u32, BTreeMap<String, String>) {
        self.init_with(Payload::new().u32(version)).await
    }

    /// INIT with a caller-built body (version plus extension pairs)
    pub async fn init_with(&mut self, body: Payload) -> (u32, BTreeMap<String, String>) {
        let payload = [&[MessageType::Init as u8][..], body.bytes()].concat();
        self.send_frame(&payload).await;

        let (kind, mut body) = self.recv().await;
        assert_eq!(kind, MessageType::Version as u8);
        let version = body.get_u32();
        let mut extensions = BTreeMap::new();
        while !body.is_empty() {
            let name = get_string(&mut body).unwrap();
            let value = get_string(&mut body).unwrap();
            extensions.insert(name, value);
        }
        (version, extensions)
    }

    /// Send a request with the next request id
    pub async fn send(&mut self, kind: MessageType, body: Payload) -> u32 {
        self.send_typed(kind as u8, body).await
    }

    pub async fn send_typed(&mut self, kind: u8, body: Payload) -> u32 {
        let id = self.next_id;
        self.next_id += 1;

        let mut payload = vec![kind];
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(body.bytes());
        self.send_frame(&payload).await;
        id
    }

    pub async fn status(&mut self, id: u32) -> StatusCode {
        let (kind, body) = self.reply(id).await;
        assert_eq!(kind, MessageType::Status, "expected a status response");
        parse_status(body).0
    }

    /// Request expected to answer with a bare status
    pub async fn call(&mut self, kind: MessageType, body: Payload) -> StatusCode {
        let id = self.send(kind, body).await;
        self.status(id).await
    }

    async fn handle_reply(&mut self, id: u32) -> std::result::Result<String, StatusCode> {
        match self.reply(id).await {
            (MessageType::Handle, mut body) => Ok(get_string(&mut body).unwrap()),
            (MessageType::Status, body) => Err(parse_status(body).0),
            (other, _) => panic!("unexpected {:?} response", other),
        }
    }

    async fn names_reply(&mut self, id: u32) -> std::result::Result<Vec<Name>, StatusCode> {
        match self.reply(id).await {
            (MessageType::Name, body) => Ok(parse_names(body)),
            (MessageType::Status, body) => Err(parse_status(body).0),
            (other, _) => panic!("unexpected {:?} response", other),
        }
    }

    async fn attrs_reply(&mut self, id: u32) -> std::result::Result<Attributes, StatusCode> {
        match self.reply(id).await {
            (MessageType::Attrs, mut body) => {
                let attrs = parse_attrs(&mut body);
                assert!(body.is_empty(), "trailing bytes after attributes");
                Ok(attrs)
            }
            (MessageType::Status, body) => Err(parse_status(body).0),
            (other, _) => panic!("unexpected {:?} response", other),
        }
    }

    pub async fn open(&mut self, path: &str, pflags: u32) -> std::result::Result<String, StatusCode> {
        let body = Payload::new()
            .string(path)
            .u32(pflags)
            .attrs(&Attributes::default());
        let id = self.send(MessageType::Open, body).await;
        self.handle_reply(id).await
    }

    pub async fn close(&mut self, handle: &str) -> StatusCode {
        self.call(MessageType::Close, Payload::new().string(handle))
            .await
    }

    pub async fn read(
        &mut self,
        handle: &str,
        offset: u64,
        len: u32,
    ) -> std::result::Result<Bytes, StatusCode> {
        let body = Payload::new().string(handle).u64(offset).u32(len);
        let id = self.send(MessageType::Read, body).await;
        match self.reply(id).await {
            (MessageType::Data, mut body) => {
                let len = body.get_u32() as usize;
                assert_eq!(body.len(), len);
                Ok(body)
            }
            (MessageType::Status, body) => Err(parse_status(body).0),
            (other, _) => panic!("unexpected {:?} response", other),
        }
    }

    pub async fn write(&mut self, handle: &str, offset: u64, data: &[u8]) -> StatusCode {
        let body = Payload::new()
            .string(handle)
            .u64(offset)
            .u32(data.len() as u32)
            .raw(data);
        self.call(MessageType::Write, body).await
    }

    pub async fn opendir(&mut self, path: &str) -> std::result::Result<String, StatusCode> {
        let id = self.send(MessageType::Opendir, Payload::new().string(path)).await;
        self.handle_reply(id).await
    }

    pub async fn readdir(&mut self, handle: &str) -> std::result::Result<Vec<Name>, StatusCode> {
        let id = self.send(MessageType::Readdir, Payload::new().string(handle)).await;
        self.names_reply(id).await
    }

    pub async fn realpath(&mut self, path: &str) -> std::result::Result<Vec<Name>, StatusCode> {
        let id = self.send(MessageType::Realpath, Payload::new().string(path)).await;
        self.names_reply(id).await
    }

    pub async fn readlink(&mut self, path: &str) -> std::result::Result<Vec<Name>, StatusCode> {
        let id = self.send(MessageType::Readlink, Payload::new().string(path)).await;
        self.names_reply(id).await
    }

    pub async fn stat(&mut self, path: &str) -> std::result::Result<Attributes, StatusCode> {
        let id = self.send(MessageType::Stat, Payload::new().string(path)).await;
        self.attrs_reply(id).await
    }

    pub async fn lstat(&mut self, path: &str) -> std::result::Result<Attributes, StatusCode> {
        let id = self.send(MessageType::Lstat, Payload::new().string(path)).await;
        self.attrs_reply(id).await
    }

    pub async fn fstat(&mut self, handle: &str) -> std::result::Result<Attributes, StatusCode> {
        let id = self.send(MessageType::Fstat, Payload::new().string(handle)).await;
        self.attrs_reply(id).await
    }

    /// Send a zero-length frame, which ends the session
    pub async fn end(&mut self) {
        self.send_raw(&[0, 0, 0, 0]).await;
    }

    /// Close the client's write half
    pub async fn shutdown(&mut self) {
        self.stream.shutdown().await.unwrap();
    }
}
