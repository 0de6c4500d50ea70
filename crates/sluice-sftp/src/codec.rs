//! Binary encoding over async byte streams
//!
//! All integers are big-endian. Strings and binary blobs carry a `u32` length
//! prefix. Every frame on the wire is `u32 length || payload`.
//!
//! [`StreamReader`] tracks how much of the current frame is left so a
//! malformed request can never read into the next one, and [`StreamWriter`]
//! stages a whole response before emitting it with its length prefix.

use crate::attrs::{Attributes, NameEntry, timestamp_from_wire, timestamp_to_wire};
use crate::error::{Error, Result};
use crate::protocol::{AttrFlags, Permissions};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const LENGTH_PREFIX: usize = 4;
const DISCARD_CHUNK: usize = 8192;

/// Cancellation-aware reader for length-prefixed frames
pub struct StreamReader<R> {
    inner: R,
    cancel: CancellationToken,
    /// Bytes left in the current frame; `None` between frames
    remaining: Option<usize>,
}

impl<R: AsyncRead + Unpin> StreamReader<R> {
    /// Wrap `inner`; reads fail with `Cancelled` once `cancel` fires
    pub fn new(inner: R, cancel: CancellationToken) -> Self {
        Self {
            inner,
            cancel,
            remaining: None,
        }
    }

    /// Read the next frame length
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
    pub async fn read_frame_len(&mut self) -> Result<Option<u32>> {
        let mut buf = [0u8; LENGTH_PREFIX];
        let filled = self.fill(&mut buf).await?;

        match filled {
            0 => Ok(None),
            LENGTH_PREFIX => Ok(Some(u32::from_be_bytes(buf))),
            n => Err(Error::ConnectionClosed(format!(
                "stream ended after {} of {} length bytes",
                n, LENGTH_PREFIX
            ))),
        }
    }

    /// Start budgeting reads against a frame of `len` bytes
    pub fn begin_frame(&mut self, len: usize) {
        self.remaining = Some(len);
    }

    /// Bytes left in the current frame
    pub fn remaining(&self) -> usize {
        self.remaining.unwrap_or(0)
    }

    /// Discard whatever the handler did not consume and leave frame mode
    pub async fn finish_frame(&mut self) -> Result<()> {
        let mut left = self.remaining();
        let mut scratch = [0u8; DISCARD_CHUNK];

        while left > 0 {
            let chunk = left.min(DISCARD_CHUNK);
            self.read_exact_raw(&mut scratch[..chunk]).await?;
            left -= chunk;
        }

        self.remaining = None;
        Ok(())
    }

    /// Single byte
    pub async fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_framed(&mut buf).await?;
        Ok(buf[0])
    }

    /// Big-endian `u32`
    pub async fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_framed(&mut buf).await?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Big-endian `u64`
    pub async fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_framed(&mut buf).await?;
        Ok(u64::from_be_bytes(buf))
    }

    /// Length-prefixed byte string
    pub async fn read_binary(&mut self) -> Result<Bytes> {
        let len = self.read_u32().await? as usize;
        self.read_bytes(len).await
    }

    /// Length-prefixed UTF-8 string
    pub async fn read_string(&mut self) -> Result<String> {
        let raw = self.read_binary().await?;
        String::from_utf8(raw.to_vec()).map_err(|_| Error::protocol("string is not valid UTF-8"))
    }

    /// `u32` seconds since the epoch, zero meaning unset
    pub async fn read_time(&mut self) -> Result<Option<DateTime<Utc>>> {
        Ok(timestamp_from_wire(self.read_u32().await?))
    }

    /// Flag-driven attribute block
    pub async fn read_attributes(&mut self) -> Result<Attributes> {
        let flags = AttrFlags::from_bits_truncate(self.read_u32().await?);
        let mut attrs = Attributes::default();

        if flags.contains(AttrFlags::SIZE) {
            attrs.size = Some(self.read_u64().await?);
        }
        if flags.contains(AttrFlags::UIDGID) {
            attrs.uid = Some(self.read_u32().await?);
            attrs.gid = Some(self.read_u32().await?);
        }
        if flags.contains(AttrFlags::PERMISSIONS) {
            attrs.permissions = Some(Permissions::from_bits_truncate(self.read_u32().await?));
        }
        if flags.contains(AttrFlags::ACMODTIME) {
            attrs.atime = self.read_time().await?;
            attrs.mtime = self.read_time().await?;
        }
        if flags.contains(AttrFlags::EXTENDED) {
            let count = self.read_u32().await?;
            let mut extended = BTreeMap::new();
            for _ in 0..count {
                let name = self.read_string().await?;
                let value = self.read_string().await?;
                extended.insert(name, value);
            }
            attrs.extended = extended;
        }

        Ok(attrs)
    }

    /// Everything left in the current frame
    pub async fn read_remaining(&mut self) -> Result<Bytes> {
        let len = self.remaining();
        self.read_bytes(len).await
    }

    async fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        self.reserve(len)?;
        let mut buf = vec![0u8; len];
        self.read_exact_raw(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn read_framed(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reserve(buf.len())?;
        self.read_exact_raw(buf).await
    }

    /// Charge `len` bytes against the frame budget without touching the stream
    fn reserve(&mut self, len: usize) -> Result<()> {
        if let Some(remaining) = self.remaining.as_mut() {
            if len > *remaining {
                return Err(Error::protocol(format!(
                    "read of {} bytes overruns frame ({} bytes left)",
                    len, remaining
                )));
            }
            *remaining -= len;
        }
        Ok(())
    }

    async fn read_exact_raw(&mut self, buf: &mut [u8]) -> Result<()> {
        let filled = self.fill(buf).await?;
        if filled < buf.len() {
            return Err(Error::ConnectionClosed(format!(
                "stream ended {} bytes short of a {} byte read",
                buf.len() - filled,
                buf.len()
            )));
        }
        Ok(())
    }

    /// Read until `buf` is full or the stream ends, returning bytes filled
    async fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Self { inner, cancel, .. } = self;
        let mut filled = 0;

        while filled < buf.len() {
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                res = inner.read(&mut buf[filled..]) => res.map_err(Error::Transport)?,
            };
            if n == 0 {
                break;
            }
            filled += n;
        }

        Ok(filled)
    }
}

/// Staging writer that emits one length-prefixed frame per flush
pub struct StreamWriter<W> {
    inner: W,
    cancel: CancellationToken,
    /// Starts with a length placeholder that flush patches
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> StreamWriter<W> {
    /// Wrap `inner` with a staging buffer sized for `capacity` byte frames
    pub fn new(inner: W, capacity: usize, cancel: CancellationToken) -> Self {
        let mut buf = BytesMut::with_capacity(capacity + LENGTH_PREFIX);
        buf.put_u32(0);
        Self { inner, cancel, buf }
    }

    /// Whether nothing is staged
    pub fn is_empty(&self) -> bool {
        self.buf.len() == LENGTH_PREFIX
    }

    /// Size of the staged payload
    pub fn staged_len(&self) -> usize {
        self.buf.len() - LENGTH_PREFIX
    }

    /// Stage a single byte
    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    /// Stage a big-endian `u32`
    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    /// Stage a big-endian `u64`
    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    /// Stage a length-prefixed byte string
    pub fn write_binary(&mut self, value: &[u8]) {
        put_bytes(&mut self.buf, value);
    }

    /// Stage a length-prefixed string
    pub fn write_string(&mut self, value: &str) {
        put_string(&mut self.buf, value);
    }

    /// Stage a timestamp as `u32` seconds, zero when unset
    pub fn write_time(&mut self, value: Option<DateTime<Utc>>) {
        self.buf.put_u32(timestamp_to_wire(value));
    }

    /// Bytes appended as-is, without a length prefix
    pub fn write_raw(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    /// Stage an attribute block limited to `mask`
    pub fn write_attributes(&mut self, attrs: &Attributes, mask: AttrFlags) {
        attrs.encode(&mut self.buf, mask);
    }

    /// Count, then name, long name and attributes for each entry
    pub fn write_names(&mut self, entries: &[NameEntry]) {
        self.write_u32(entries.len() as u32);
        for entry in entries {
            self.write_string(&entry.name);
            self.write_string(&entry.long_name());
            self.write_attributes(&entry.attrs, response_mask(&entry.attrs));
        }
    }

    /// Emit the staged payload as one frame and reset the staging buffer
    pub async fn flush(&mut self) -> Result<()> {
        let len = u32::try_from(self.staged_len())
            .map_err(|_| Error::protocol("response exceeds u32 frame length"))?;
        self.buf[..LENGTH_PREFIX].copy_from_slice(&len.to_be_bytes());

        let Self { inner, cancel, buf } = self;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = async {
                inner.write_all(&buf[..]).await?;
                inner.flush().await
            } => res.map_err(Error::Transport)?,
        }

        self.buf.clear();
        self.buf.put_u32(0);
        Ok(())
    }
}

/// Attribute mask used for every outbound attribute block
///
/// The standard fields plus extended pairs when present, limited to what the
/// value actually carries.
pub fn response_mask(attrs: &Attributes) -> AttrFlags {
    (AttrFlags::DEFAULT | AttrFlags::EXTENDED) & attrs.flags()
}

/// Append a length-prefixed string
pub fn put_string(buf: &mut BytesMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

/// Append a length-prefixed byte string
pub fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

/// Split a length-prefixed byte string off the front of `buf`
pub fn get_bytes(buf: &mut Bytes) -> Result<Bytes> {
    if buf.remaining() < 4 {
        return Err(Error::protocol("truncated length prefix"));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(Error::protocol(format!(
            "string of {} bytes overruns buffer ({} bytes left)",
            len,
            buf.remaining()
        )));
    }
    Ok(buf.split_to(len))
}

/// Split a length-prefixed UTF-8 string off the front of `buf`
pub fn get_string(buf: &mut Bytes) -> Result<String> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::protocol("string is not valid UTF-8"))
}
