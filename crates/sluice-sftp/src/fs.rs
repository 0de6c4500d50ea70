//! Local filesystem handler confined to a root directory
//!
//! NIST 800-53: AC-3 (Access Enforcement), SI-10 (Input Validation)
//! Implementation: Client paths are normalized lexically so ".." never climbs
//! above "/", then joined to the root. Existing targets are canonicalized and
//! rejected if a symbolic link leads outside the root.

use crate::attrs::{Attributes, NameEntry};
use crate::codec;
use crate::error::{Error, Result};
use crate::handler::SftpHandler;
use crate::protocol::{AccessMode, OpenMode};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// OpenSSH extension for a rename that replaces an existing target
pub const POSIX_RENAME: &str = "posix-rename@openssh.com";

/// Normalize a client path to an absolute virtual path
///
/// Empty and "." components are dropped and ".." at the top stays at "/".
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();

    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }

    format!("/{}", parts.join("/"))
}

/// Parent of a normalized virtual path
fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Handler serving a directory tree on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalFsHandler {
    root: PathBuf,
}

impl LocalFsHandler {
    /// Serve `root`, which must be an existing directory
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = std::fs::canonicalize(root.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Cannot resolve root directory {:?}: {}",
                root.as_ref(),
                e
            ))
        })?;

        if !root.is_dir() {
            return Err(Error::Config(format!(
                "Root path is not a directory: {:?}",
                root
            )));
        }

        Ok(Self { root })
    }

    /// Canonical root directory, shown to the client as "/"
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Physical location of a virtual path, without touching the filesystem
    fn physical(&self, path: &str) -> PathBuf {
        let normalized = normalize_path(path);
        let relative = normalized.trim_start_matches('/');
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    /// Resolve a path whose final component is followed if it is a link
    async fn resolve(&self, path: &str) -> Result<PathBuf> {
        let physical = self.physical(path);
        match fs::canonicalize(&physical).await {
            Ok(real) => {
                self.ensure_inside(path, &real)?;
                Ok(physical)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => self.resolve_entry(path).await,
            Err(e) => Err(io_error(path, e)),
        }
    }

    /// Resolve a path whose final component is used as-is (lstat, remove, ...)
    async fn resolve_entry(&self, path: &str) -> Result<PathBuf> {
        let physical = self.physical(path);
        if let Some(parent) = physical.parent() {
            if physical != self.root {
                match fs::canonicalize(parent).await {
                    Ok(real) => self.ensure_inside(path, &real)?,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(io_error(path, e)),
                }
            }
        }
        Ok(physical)
    }

    fn ensure_inside(&self, path: &str, real: &Path) -> Result<()> {
        if real.starts_with(&self.root) {
            Ok(())
        } else {
            warn!(event = "path_escape_blocked", path = %path);
            Err(Error::PermissionDenied(path.to_string()))
        }
    }

    async fn rename_paths(&self, old_path: &str, new_path: &str, overwrite: bool) -> Result<()> {
        let from = self.resolve_entry(old_path).await?;
        let to = self.resolve_entry(new_path).await?;

        fs::symlink_metadata(&from)
            .await
            .map_err(|e| io_error(old_path, e))?;

        if !overwrite && fs::symlink_metadata(&to).await.is_ok() {
            return Err(Error::Other(format!("{} already exists", new_path)));
        }

        fs::rename(&from, &to)
            .await
            .map_err(|e| io_error(old_path, e))
    }

    async fn apply_attributes(&self, path: &str, physical: PathBuf, attrs: &Attributes) -> Result<()> {
        let attrs = attrs.clone();
        tokio::task::spawn_blocking(move || set_attributes(&physical, &attrs))
            .await
            .map_err(|e| Error::Other(format!("setstat task failed: {}", e)))?
            .map_err(|e| io_error(path, e))
    }
}

/// Map an I/O error to the most specific error kind, keeping the path
fn io_error(path: &str, err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::NotFound => Error::FileNotFound(path.to_string()),
        io::ErrorKind::PermissionDenied => Error::PermissionDenied(path.to_string()),
        _ => Error::Io(err),
    }
}

fn set_attributes(path: &Path, attrs: &Attributes) -> io::Result<()> {
    if let Some(size) = attrs.size {
        std::fs::OpenOptions::new()
            .write(true)
            .open(path)?
            .set_len(size)?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if let Some(permissions) = attrs.permissions {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(permissions.mode()))?;
        }
        if attrs.uid.is_some() || attrs.gid.is_some() {
            std::os::unix::fs::chown(path, attrs.uid, attrs.gid)?;
        }
    }

    if let Some(times) = file_times(attrs) {
        std::fs::File::open(path)?.set_times(times)?;
    }

    Ok(())
}

/// Same as [`set_attributes`], applied through an open file
fn set_file_attributes(file: &std::fs::File, attrs: &Attributes) -> io::Result<()> {
    if let Some(size) = attrs.size {
        file.set_len(size)?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if let Some(permissions) = attrs.permissions {
            file.set_permissions(std::fs::Permissions::from_mode(permissions.mode()))?;
        }
        if attrs.uid.is_some() || attrs.gid.is_some() {
            std::os::unix::fs::fchown(file, attrs.uid, attrs.gid)?;
        }
    }

    if let Some(times) = file_times(attrs) {
        file.set_times(times)?;
    }

    Ok(())
}

fn file_times(attrs: &Attributes) -> Option<std::fs::FileTimes> {
    if attrs.atime.is_none() && attrs.mtime.is_none() {
        return None;
    }

    let mut times = std::fs::FileTimes::new();
    if let Some(atime) = attrs.atime {
        times = times.set_accessed(SystemTime::from(atime));
    }
    if let Some(mtime) = attrs.mtime {
        times = times.set_modified(SystemTime::from(mtime));
    }
    Some(times)
}

#[async_trait]
impl SftpHandler for LocalFsHandler {
    type File = File;

    async fn init(
        &mut self,
        client_version: u32,
        user: &str,
        client_extensions: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        debug!(
            event = "handler_init",
            client_version,
            user = %user,
            client_extensions = ?client_extensions.keys().collect::<Vec<_>>(),
            root = %self.root.display()
        );

        let mut extensions = BTreeMap::new();
        extensions.insert(POSIX_RENAME.to_string(), "1".to_string());
        Ok(extensions)
    }

    async fn open(
        &mut self,
        path: &str,
        mode: OpenMode,
        access: AccessMode,
        attrs: &Attributes,
    ) -> Result<File> {
        let physical = self.resolve(path).await?;

        let mut options = OpenOptions::new();
        options
            .read(access.can_read())
            .write(access.can_write() || mode.requires_write());

        match mode {
            OpenMode::Open => {}
            OpenMode::OpenOrCreate => {
                options.create(true);
            }
            OpenMode::Truncate => {
                options.truncate(true);
            }
            OpenMode::CreateOrTruncate => {
                options.create(true).truncate(true);
            }
            OpenMode::CreateNew => {
                options.create_new(true);
            }
            OpenMode::Append => {
                options.append(true);
            }
            OpenMode::AppendOrCreate => {
                options.append(true).create(true);
            }
        }

        #[cfg(unix)]
        if let Some(permissions) = attrs.permissions {
            options.mode(permissions.mode());
        }
        #[cfg(not(unix))]
        let _ = attrs;

        let file = options.open(&physical).await.map_err(|e| io_error(path, e))?;
        let metadata = file.metadata().await.map_err(|e| io_error(path, e))?;
        if metadata.is_dir() {
            return Err(Error::Other(format!("{} is a directory", path)));
        }

        Ok(file)
    }

    async fn close(&mut self, path: &str, mut file: File) -> Result<()> {
        file.flush().await.map_err(|e| io_error(path, e))
    }

    async fn read(&mut self, path: &str, file: &mut File, offset: u64, len: u32) -> Result<Bytes> {
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_error(path, e))?;

        let mut buf = BytesMut::zeroed(len as usize);
        let mut filled = 0;
        while filled < buf.len() {
            let n = file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| io_error(path, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 && len > 0 {
            return Err(Error::EndOfFile);
        }

        buf.truncate(filled);
        Ok(buf.freeze())
    }

    async fn write(&mut self, path: &str, file: &mut File, offset: u64, data: Bytes) -> Result<()> {
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_error(path, e))?;
        file.write_all(&data).await.map_err(|e| io_error(path, e))?;
        file.flush().await.map_err(|e| io_error(path, e))
    }

    async fn stat(&mut self, path: &str) -> Result<Attributes> {
        let physical = self.resolve(path).await?;
        let metadata = fs::metadata(&physical)
            .await
            .map_err(|e| io_error(path, e))?;
        Ok(Attributes::from(&metadata))
    }

    async fn lstat(&mut self, path: &str) -> Result<Attributes> {
        let physical = self.resolve_entry(path).await?;
        let metadata = fs::symlink_metadata(&physical)
            .await
            .map_err(|e| io_error(path, e))?;
        Ok(Attributes::from(&metadata))
    }

    async fn fstat(&mut self, path: &str, file: &mut File) -> Result<Attributes> {
        file.flush().await.map_err(|e| io_error(path, e))?;
        let metadata = file.metadata().await.map_err(|e| io_error(path, e))?;
        Ok(Attributes::from(&metadata))
    }

    async fn setstat(&mut self, path: &str, attrs: &Attributes) -> Result<()> {
        let physical = self.resolve(path).await?;
        self.apply_attributes(path, physical, attrs).await
    }

    async fn fsetstat(&mut self, path: &str, file: &mut File, attrs: &Attributes) -> Result<()> {
        file.flush().await.map_err(|e| io_error(path, e))?;
        let std_file = file
            .try_clone()
            .await
            .map_err(|e| io_error(path, e))?
            .into_std()
            .await;

        let attrs = attrs.clone();
        tokio::task::spawn_blocking(move || set_file_attributes(&std_file, &attrs))
            .await
            .map_err(|e| Error::Other(format!("fsetstat task failed: {}", e)))?
            .map_err(|e| io_error(path, e))
    }

    async fn open_dir(&mut self, path: &str) -> Result<()> {
        let physical = self.resolve(path).await?;
        let metadata = fs::metadata(&physical)
            .await
            .map_err(|e| io_error(path, e))?;

        if metadata.is_dir() {
            Ok(())
        } else {
            Err(Error::Other(format!("{} is not a directory", path)))
        }
    }

    async fn read_dir(&mut self, path: &str) -> Result<Vec<NameEntry>> {
        let virtual_path = normalize_path(path);
        let physical = self.resolve(&virtual_path).await?;

        let current = fs::metadata(&physical)
            .await
            .map_err(|e| io_error(path, e))?;
        let parent = if virtual_path == "/" {
            Attributes::dummy_directory()
        } else {
            let parent_physical = self.physical(parent_path(&virtual_path));
            match fs::metadata(&parent_physical).await {
                Ok(metadata) => Attributes::from(&metadata),
                Err(_) => Attributes::dummy_directory(),
            }
        };

        let mut children = Vec::new();
        let mut dir = fs::read_dir(&physical)
            .await
            .map_err(|e| io_error(path, e))?;
        while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(path, e))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            match fs::symlink_metadata(entry.path()).await {
                Ok(metadata) => children.push(NameEntry::new(name, Attributes::from(&metadata))),
                Err(e) => debug!(event = "dir_entry_skipped", path = %path, name = %name, error = %e),
            }
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));

        let mut entries = Vec::with_capacity(children.len() + 2);
        entries.push(NameEntry::new(".", Attributes::from(&current)));
        entries.push(NameEntry::new("..", parent));
        entries.extend(children);
        Ok(entries)
    }

    async fn remove(&mut self, path: &str) -> Result<()> {
        let physical = self.resolve_entry(path).await?;
        let metadata = fs::symlink_metadata(&physical)
            .await
            .map_err(|e| io_error(path, e))?;

        if metadata.is_dir() {
            return Err(Error::Other(format!("{} is a directory", path)));
        }

        fs::remove_file(&physical)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn mkdir(&mut self, path: &str, attrs: &Attributes) -> Result<()> {
        let physical = self.resolve_entry(path).await?;

        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        if let Some(permissions) = attrs.permissions {
            builder.mode(permissions.mode());
        }
        #[cfg(not(unix))]
        let _ = attrs;

        builder
            .create(&physical)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn rmdir(&mut self, path: &str) -> Result<()> {
        let physical = self.resolve_entry(path).await?;
        if physical == self.root {
            return Err(Error::PermissionDenied(path.to_string()));
        }

        fs::remove_dir(&physical)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn real_path(&mut self, path: &str) -> Result<String> {
        Ok(normalize_path(path))
    }

    async fn rename(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        self.rename_paths(old_path, new_path, false).await
    }

    async fn read_link(&mut self, path: &str) -> Result<NameEntry> {
        let physical = self.resolve_entry(path).await?;
        let target = fs::read_link(&physical)
            .await
            .map_err(|e| io_error(path, e))?;

        let rendered = if target.is_absolute() {
            let relative = target
                .strip_prefix(&self.root)
                .map_err(|_| Error::PermissionDenied(path.to_string()))?;
            format!("/{}", relative.to_string_lossy())
        } else {
            target.to_string_lossy().into_owned()
        };

        Ok(NameEntry::from_path(rendered))
    }

    #[cfg(unix)]
    async fn symlink(&mut self, link_path: &str, target_path: &str) -> Result<()> {
        let link = self.resolve_entry(link_path).await?;

        let virtual_target = if target_path.starts_with('/') {
            normalize_path(target_path)
        } else {
            let link_virtual = normalize_path(link_path);
            normalize_path(&format!("{}/{}", parent_path(&link_virtual), target_path))
        };
        let target = self.resolve(&virtual_target).await?;

        fs::symlink(&target, &link)
            .await
            .map_err(|e| io_error(link_path, e))?;

        info!(event = "symlink", link = %link_path, target = %virtual_target);
        Ok(())
    }

    async fn extended(&mut self, name: &str, payload: Bytes) -> Result<Option<Bytes>> {
        match name {
            POSIX_RENAME => {
                let mut payload = payload;
                let old_path = codec::get_string(&mut payload)?;
                let new_path = codec::get_string(&mut payload)?;
                self.rename_paths(&old_path, &new_path, true).await?;
                info!(event = "posix_rename", from = %old_path, to = %new_path);
                Ok(None)
            }
            _ => Err(Error::not_supported(format!("extension {}", name))),
        }
    }
}
