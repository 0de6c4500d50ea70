//! File attributes and directory entries
//!
//! The wire form is flag driven: a leading flags word announces which
//! optional fields follow, and the fields always appear in the same order
//! (size, uid/gid, permissions, atime/mtime, extended pairs).

use crate::protocol::{AttrFlags, Permissions};
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs::Metadata;
use std::time::SystemTime;

/// File attributes (draft-ietf-secsh-filexfer-02, section 5)
///
/// `None` fields are simply not carried; a zero timestamp on the wire decodes
/// to `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    /// File size in bytes
    pub size: Option<u64>,
    /// Owner user id
    pub uid: Option<u32>,
    /// Owner group id
    pub gid: Option<u32>,
    /// Permission and file type bits
    pub permissions: Option<Permissions>,
    /// Last access time
    pub atime: Option<DateTime<Utc>>,
    /// Last modification time
    pub mtime: Option<DateTime<Utc>>,
    /// Vendor extension pairs
    pub extended: BTreeMap<String, String>,
}

impl Attributes {
    fn dummy_permissions() -> Permissions {
        Permissions::USER_READ
            | Permissions::USER_WRITE
            | Permissions::USER_EXECUTE
            | Permissions::GROUP_READ
    }

    /// Preset for synthetic file entries with no backing object
    pub fn dummy_file() -> Self {
        Self {
            size: Some(0),
            uid: Some(0),
            gid: Some(0),
            permissions: Some(Self::dummy_permissions()),
            ..Default::default()
        }
    }

    /// Preset for synthetic directory entries, e.g. the parent of the virtual root
    pub fn dummy_directory() -> Self {
        Self {
            permissions: Some(Self::dummy_permissions() | Permissions::DIRECTORY),
            ..Self::dummy_file()
        }
    }

    /// Flags describing which fields this value carries
    pub fn flags(&self) -> AttrFlags {
        let mut flags = AttrFlags::empty();

        if self.size.is_some() {
            flags |= AttrFlags::SIZE;
        }
        if self.uid.is_some() || self.gid.is_some() {
            flags |= AttrFlags::UIDGID;
        }
        if self.permissions.is_some() {
            flags |= AttrFlags::PERMISSIONS;
        }
        if self.atime.is_some() || self.mtime.is_some() {
            flags |= AttrFlags::ACMODTIME;
        }
        if !self.extended.is_empty() {
            flags |= AttrFlags::EXTENDED;
        }

        flags
    }

    /// Encode the fields selected by `mask`
    ///
    /// A field in the mask but missing from the value is written as zero so
    /// the layout always matches the flags word.
    pub fn encode(&self, buf: &mut BytesMut, mask: AttrFlags) {
        buf.put_u32(mask.bits());

        if mask.contains(AttrFlags::SIZE) {
            buf.put_u64(self.size.unwrap_or(0));
        }
        if mask.contains(AttrFlags::UIDGID) {
            buf.put_u32(self.uid.unwrap_or(0));
            buf.put_u32(self.gid.unwrap_or(0));
        }
        if mask.contains(AttrFlags::PERMISSIONS) {
            buf.put_u32(self.permissions.map_or(0, |p| p.bits()));
        }
        if mask.contains(AttrFlags::ACMODTIME) {
            buf.put_u32(timestamp_to_wire(self.atime));
            buf.put_u32(timestamp_to_wire(self.mtime));
        }
        if mask.contains(AttrFlags::EXTENDED) {
            buf.put_u32(self.extended.len() as u32);
            for (name, value) in &self.extended {
                crate::codec::put_string(buf, name);
                crate::codec::put_string(buf, value);
            }
        }
    }

    /// Whether this describes a directory
    pub fn is_dir(&self) -> bool {
        self.permissions
            .is_some_and(|p| p.file_type() == crate::protocol::FileType::Directory)
    }
}

impl From<&Metadata> for Attributes {
    #[cfg(unix)]
    fn from(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Attributes {
            size: Some(metadata.len()),
            uid: Some(metadata.uid()),
            gid: Some(metadata.gid()),
            permissions: Some(Permissions::from_bits_truncate(metadata.mode())),
            atime: DateTime::from_timestamp(metadata.atime(), 0),
            mtime: DateTime::from_timestamp(metadata.mtime(), 0),
            extended: BTreeMap::new(),
        }
    }

    #[cfg(not(unix))]
    fn from(metadata: &Metadata) -> Self {
        let file_type = metadata.file_type();
        let mut permissions = if metadata.permissions().readonly() {
            Permissions::from_bits_truncate(0o555)
        } else {
            Permissions::from_bits_truncate(0o755)
        };
        if file_type.is_dir() {
            permissions |= Permissions::DIRECTORY;
        } else if file_type.is_symlink() {
            permissions |= Permissions::SYMLINK;
        } else {
            permissions |= Permissions::REGULAR_FILE;
        }

        Attributes {
            size: Some(metadata.len()),
            uid: None,
            gid: None,
            permissions: Some(permissions),
            atime: metadata.accessed().ok().and_then(system_time_to_utc),
            mtime: metadata.modified().ok().and_then(system_time_to_utc),
            extended: BTreeMap::new(),
        }
    }
}

/// Seconds since the epoch as carried on the wire; unset is zero
pub fn timestamp_to_wire(time: Option<DateTime<Utc>>) -> u32 {
    time.and_then(|t| u32::try_from(t.timestamp()).ok())
        .unwrap_or(0)
}

/// Inverse of [`timestamp_to_wire`]
pub fn timestamp_from_wire(secs: u32) -> Option<DateTime<Utc>> {
    if secs == 0 {
        None
    } else {
        DateTime::from_timestamp(i64::from(secs), 0)
    }
}

/// Convert a filesystem timestamp, dropping pre-epoch values
pub fn system_time_to_utc(time: SystemTime) -> Option<DateTime<Utc>> {
    let secs = time.duration_since(SystemTime::UNIX_EPOCH).ok()?.as_secs();
    DateTime::from_timestamp(i64::try_from(secs).ok()?, 0)
}

/// Display name for a numeric user or group id
pub fn identity_name(id: Option<u32>) -> String {
    match id {
        Some(0) => "root".to_string(),
        Some(65534) => "nobody".to_string(),
        Some(id) => id.to_string(),
        None => "unknown".to_string(),
    }
}

/// A name paired with its attributes, as carried by SSH_FXP_NAME
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    /// File name, or a full path for REALPATH and READLINK replies
    pub name: String,
    /// Attributes sent with the name
    pub attrs: Attributes,
}

impl NameEntry {
    /// Pair a name with its attributes
    pub fn new(name: impl Into<String>, attrs: Attributes) -> Self {
        Self {
            name: name.into(),
            attrs,
        }
    }

    /// Entry for a bare path string with no real object behind it
    pub fn from_path(path: impl Into<String>) -> Self {
        Self::new(path, Attributes::dummy_file())
    }

    /// `ls -l` style line clients display verbatim
    pub fn long_name(&self) -> String {
        let attrs = &self.attrs;
        let mode = attrs
            .permissions
            .unwrap_or_else(Permissions::empty)
            .to_mode_string();
        let mtime = attrs
            .mtime
            .unwrap_or_default()
            .format("%b %d %H:%M")
            .to_string();

        format!(
            "{} {:>3} {:<8} {:<8} {:>8} {:>12} {}",
            mode,
            1,
            identity_name(attrs.uid),
            identity_name(attrs.gid),
            attrs.size.unwrap_or(0),
            mtime,
            self.name
        )
    }
}
