//! Handler contract between the protocol engine and a storage backend
//!
//! The session owns handles and paging state; a handler only ever sees paths
//! and its own open-file values.

use crate::attrs::{Attributes, NameEntry};
use crate::error::{Error, Result};
use crate::protocol::{AccessMode, OpenMode};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;

/// Storage backend driven by a [`Session`](crate::Session)
///
/// Every operation returns the crate [`Error`]; the session turns each error
/// into the matching status code, so implementations should pick the most
/// specific variant (`FileNotFound`, `PermissionDenied`, `EndOfFile`, ...).
#[async_trait]
pub trait SftpHandler: Send {
    /// An open file as held by the session between OPEN and CLOSE
    type File: Send;

    /// Called once on INIT; returns the server's extension pairs
    async fn init(
        &mut self,
        client_version: u32,
        user: &str,
        client_extensions: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>>;

    async fn open(
        &mut self,
        path: &str,
        mode: OpenMode,
        access: AccessMode,
        attrs: &Attributes,
    ) -> Result<Self::File>;

    async fn close(&mut self, path: &str, file: Self::File) -> Result<()>;

    /// Read up to `len` bytes at `offset`
    ///
    /// Returns [`Error::EndOfFile`] when `offset` is at or past the end.
    async fn read(&mut self, path: &str, file: &mut Self::File, offset: u64, len: u32)
    -> Result<Bytes>;

    async fn write(
        &mut self,
        path: &str,
        file: &mut Self::File,
        offset: u64,
        data: Bytes,
    ) -> Result<()>;

    /// Attributes, following symbolic links
    async fn stat(&mut self, path: &str) -> Result<Attributes>;

    /// Attributes of the link itself
    async fn lstat(&mut self, path: &str) -> Result<Attributes>;

    async fn fstat(&mut self, path: &str, file: &mut Self::File) -> Result<Attributes>;

    async fn setstat(&mut self, path: &str, attrs: &Attributes) -> Result<()>;

    async fn fsetstat(&mut self, path: &str, file: &mut Self::File, attrs: &Attributes)
    -> Result<()>;

    /// Check that `path` can be listed
    async fn open_dir(&mut self, path: &str) -> Result<()>;

    /// Full listing of `path`; the session pages it
    async fn read_dir(&mut self, path: &str) -> Result<Vec<NameEntry>>;

    async fn remove(&mut self, path: &str) -> Result<()>;

    async fn mkdir(&mut self, path: &str, attrs: &Attributes) -> Result<()>;

    async fn rmdir(&mut self, path: &str) -> Result<()>;

    /// Canonical absolute form of `path`
    async fn real_path(&mut self, path: &str) -> Result<String>;

    async fn rename(&mut self, old_path: &str, new_path: &str) -> Result<()>;

    async fn read_link(&mut self, path: &str) -> Result<NameEntry> {
        Err(Error::not_supported(format!("readlink {}", path)))
    }

    /// Create `link_path` pointing at `target_path`
    async fn symlink(&mut self, link_path: &str, target_path: &str) -> Result<()> {
        Err(Error::not_supported(format!(
            "symlink {} -> {}",
            link_path, target_path
        )))
    }

    /// Vendor extension request
    ///
    /// `Some(reply)` is sent back as SSH_FXP_EXTENDED_REPLY, `None` as an OK
    /// status.
    async fn extended(&mut self, name: &str, payload: Bytes) -> Result<Option<Bytes>> {
        let _ = payload;
        Err(Error::not_supported(format!("extension {}", name)))
    }
}
