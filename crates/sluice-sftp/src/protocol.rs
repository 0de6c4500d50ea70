//! SFTP Protocol Constants
//!
//! Message types, status codes, attribute and open flags as defined in
//! draft-ietf-secsh-filexfer-02 (protocol version 3).
//!
//! The SFTP protocol normally runs over the SSH connection protocol (RFC 4254)
//! as the "sftp" subsystem; this crate only sees the two byte streams.

use bitflags::bitflags;

/// Highest SFTP protocol version this server negotiates
pub const SFTP_VERSION: u32 = 3;

/// SFTP message types (draft-ietf-secsh-filexfer-02, section 3)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Initialize SFTP session
    Init = 1,
    /// Version response
    Version = 2,
    /// Open file
    Open = 3,
    /// Close file
    Close = 4,
    /// Read from file
    Read = 5,
    /// Write to file
    Write = 6,
    /// Get file attributes by path (do not follow symlinks)
    Lstat = 7,
    /// Get file attributes by handle
    Fstat = 8,
    /// Set file attributes by path
    Setstat = 9,
    /// Set file attributes by handle
    Fsetstat = 10,
    /// Open directory
    Opendir = 11,
    /// Read directory entries
    Readdir = 12,
    /// Remove file
    Remove = 13,
    /// Create directory
    Mkdir = 14,
    /// Remove directory
    Rmdir = 15,
    /// Get real path
    Realpath = 16,
    /// Get file attributes by path (follow symlinks)
    Stat = 17,
    /// Rename file or directory
    Rename = 18,
    /// Read symbolic link
    Readlink = 19,
    /// Create symbolic link
    Symlink = 20,
    /// Status response
    Status = 101,
    /// Handle response
    Handle = 102,
    /// Data response
    Data = 103,
    /// Name response (for directory listings)
    Name = 104,
    /// Attributes response
    Attrs = 105,
    /// Extended request
    Extended = 200,
    /// Extended reply
    ExtendedReply = 201,
}

impl MessageType {
    /// Whether a client may send this message type
    pub fn is_request(self) -> bool {
        matches!(self as u8, 1 | 3..=20 | 200)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Init),
            2 => Ok(MessageType::Version),
            3 => Ok(MessageType::Open),
            4 => Ok(MessageType::Close),
            5 => Ok(MessageType::Read),
            6 => Ok(MessageType::Write),
            7 => Ok(MessageType::Lstat),
            8 => Ok(MessageType::Fstat),
            9 => Ok(MessageType::Setstat),
            10 => Ok(MessageType::Fsetstat),
            11 => Ok(MessageType::Opendir),
            12 => Ok(MessageType::Readdir),
            13 => Ok(MessageType::Remove),
            14 => Ok(MessageType::Mkdir),
            15 => Ok(MessageType::Rmdir),
            16 => Ok(MessageType::Realpath),
            17 => Ok(MessageType::Stat),
            18 => Ok(MessageType::Rename),
            19 => Ok(MessageType::Readlink),
            20 => Ok(MessageType::Symlink),
            101 => Ok(MessageType::Status),
            102 => Ok(MessageType::Handle),
            103 => Ok(MessageType::Data),
            104 => Ok(MessageType::Name),
            105 => Ok(MessageType::Attrs),
            200 => Ok(MessageType::Extended),
            201 => Ok(MessageType::ExtendedReply),
            _ => Err(crate::Error::NotSupported(format!(
                "Unknown message type: {}",
                value
            ))),
        }
    }
}

/// SFTP Status codes (RFC draft-ietf-secsh-filexfer)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Success
    Ok = 0,
    /// End of file
    Eof = 1,
    /// No such file or directory
    NoSuchFile = 2,
    /// Permission denied
    PermissionDenied = 3,
    /// General failure
    Failure = 4,
    /// Bad message
    BadMessage = 5,
    /// No connection
    NoConnection = 6,
    /// Connection lost
    ConnectionLost = 7,
    /// Operation not supported
    OpUnsupported = 8,
}

impl StatusCode {
    /// Fixed message sent alongside the code to version 3 clients
    pub fn default_message(self) -> &'static str {
        match self {
            StatusCode::Ok => "Success",
            StatusCode::Eof => "End of file",
            StatusCode::NoSuchFile => "No such file",
            StatusCode::PermissionDenied => "Permission denied",
            StatusCode::Failure => "Failure",
            StatusCode::BadMessage => "Bad message",
            StatusCode::NoConnection => "No connection",
            StatusCode::ConnectionLost => "Connection lost",
            StatusCode::OpUnsupported => "Operation unsupported",
        }
    }
}

impl From<StatusCode> for u32 {
    fn from(code: StatusCode) -> u32 {
        code as u32
    }
}

impl TryFrom<u32> for StatusCode {
    type Error = crate::Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StatusCode::Ok),
            1 => Ok(StatusCode::Eof),
            2 => Ok(StatusCode::NoSuchFile),
            3 => Ok(StatusCode::PermissionDenied),
            4 => Ok(StatusCode::Failure),
            5 => Ok(StatusCode::BadMessage),
            6 => Ok(StatusCode::NoConnection),
            7 => Ok(StatusCode::ConnectionLost),
            8 => Ok(StatusCode::OpUnsupported),
            _ => Err(crate::Error::Protocol(format!(
                "Unknown status code: {}",
                value
            ))),
        }
    }
}

bitflags! {
    /// Attribute presence flags; fields follow the flags word in this order
    pub struct AttrFlags: u32 {
        const SIZE = 0x0000_0001;
        const UIDGID = 0x0000_0002;
        const PERMISSIONS = 0x0000_0004;
        const ACMODTIME = 0x0000_0008;
        const EXTENDED = 0x8000_0000;

        /// Mask used for attribute responses
        const DEFAULT = Self::SIZE.bits
            | Self::UIDGID.bits
            | Self::PERMISSIONS.bits
            | Self::ACMODTIME.bits;
    }
}

bitflags! {
    /// Open flags (pflags) of an SSH_FXP_OPEN request
    pub struct OpenFlags: u32 {
        const READ = 0x0000_0001;
        const WRITE = 0x0000_0002;
        const APPEND = 0x0000_0004;
        const CREAT = 0x0000_0008;
        const TRUNC = 0x0000_0010;
        const EXCL = 0x0000_0020;
        const TEXT = 0x0000_0040;
    }
}

bitflags! {
    /// POSIX permission and file type bits carried in the permissions field
    pub struct Permissions: u32 {
        const OTHER_EXECUTE = 0o0001;
        const OTHER_WRITE = 0o0002;
        const OTHER_READ = 0o0004;
        const GROUP_EXECUTE = 0o0010;
        const GROUP_WRITE = 0o0020;
        const GROUP_READ = 0o0040;
        const USER_EXECUTE = 0o0100;
        const USER_WRITE = 0o0200;
        const USER_READ = 0o0400;
        const STICKY = 0o1000;
        const SET_GID = 0o2000;
        const SET_UID = 0o4000;

        const FIFO = 0o010000;
        const CHARACTER_DEVICE = 0o020000;
        const DIRECTORY = 0o040000;
        const BLOCK_DEVICE = 0o060000;
        const REGULAR_FILE = 0o100000;
        const SYMLINK = 0o120000;
        const SOCKET = 0o140000;
    }
}

/// File type encoded in the high bits of the permissions field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Named pipe
    Fifo,
    /// Character device
    CharacterDevice,
    /// Directory
    Directory,
    /// Block device
    BlockDevice,
    /// Regular file
    RegularFile,
    /// Symbolic link
    Symlink,
    /// Unix domain socket
    Socket,
    /// No (or an unrecognized) type
    Unknown,
}

impl Permissions {
    const TYPE_MASK: u32 = 0o170000;

    /// Decode the file type bits
    pub fn file_type(self) -> FileType {
        match self.bits() & Self::TYPE_MASK {
            0o010000 => FileType::Fifo,
            0o020000 => FileType::CharacterDevice,
            0o040000 => FileType::Directory,
            0o060000 => FileType::BlockDevice,
            0o100000 => FileType::RegularFile,
            0o120000 => FileType::Symlink,
            0o140000 => FileType::Socket,
            _ => FileType::Unknown,
        }
    }

    /// Permission bits only, with the file type stripped
    pub fn mode(self) -> u32 {
        self.bits() & 0o7777
    }

    /// `ls -l` style rendering, e.g. `drwxr-x---`
    pub fn to_mode_string(self) -> String {
        let kind = match self.file_type() {
            FileType::Directory => 'd',
            FileType::Symlink => 'l',
            FileType::CharacterDevice => 'c',
            FileType::BlockDevice => 'b',
            FileType::Fifo => 'p',
            FileType::Socket => 's',
            FileType::RegularFile | FileType::Unknown => '-',
        };

        let bit = |flag: Permissions, c: char| if self.contains(flag) { c } else { '-' };

        let mut out = String::with_capacity(10);
        out.push(kind);
        out.push(bit(Self::USER_READ, 'r'));
        out.push(bit(Self::USER_WRITE, 'w'));
        out.push(bit(Self::USER_EXECUTE, 'x'));
        out.push(bit(Self::GROUP_READ, 'r'));
        out.push(bit(Self::GROUP_WRITE, 'w'));
        out.push(bit(Self::GROUP_EXECUTE, 'x'));
        out.push(bit(Self::OTHER_READ, 'r'));
        out.push(bit(Self::OTHER_WRITE, 'w'));
        out.push(bit(Self::OTHER_EXECUTE, 'x'));
        out
    }
}

/// How an open request treats an existing or missing file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// File must exist
    Open,
    /// Open an existing file or create it
    OpenOrCreate,
    /// File must exist and is truncated
    Truncate,
    /// Create a new file or truncate an existing one
    CreateOrTruncate,
    /// Create a new file; fail if it already exists
    CreateNew,
    /// File must exist; writes go to the end
    Append,
    /// Open or create; writes go to the end
    AppendOrCreate,
}

impl OpenMode {
    /// Whether this mode needs write access to the file
    pub fn requires_write(self) -> bool {
        !matches!(self, OpenMode::Open)
    }
}

/// Requested access to an opened file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Read only
    Read,
    /// Write only
    Write,
    /// Read and write
    ReadWrite,
}

impl AccessMode {
    /// Whether reads are allowed
    pub fn can_read(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    /// Whether writes are allowed
    pub fn can_write(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }
}

impl OpenFlags {
    /// Map the wire flags to an open mode
    ///
    /// Combinations without a faithful mapping fail instead of being
    /// silently reinterpreted.
    pub fn to_open_mode(self) -> crate::Result<OpenMode> {
        if self.contains(Self::TEXT) {
            return Err(crate::Error::NotSupported(
                "Text mode open is not supported".into(),
            ));
        }

        if self.contains(Self::EXCL) {
            if !self.contains(Self::CREAT) || self.intersects(Self::APPEND | Self::TRUNC) {
                return Err(crate::Error::NotSupported(
                    "Exclusive open requires CREAT without APPEND or TRUNC".into(),
                ));
            }
            return Ok(OpenMode::CreateNew);
        }

        let create = self.contains(Self::CREAT);
        match (self.contains(Self::APPEND), self.contains(Self::TRUNC)) {
            (true, true) => Err(crate::Error::NotSupported(
                "APPEND and TRUNC cannot be combined".into(),
            )),
            (true, false) if create => Ok(OpenMode::AppendOrCreate),
            (true, false) => Ok(OpenMode::Append),
            (false, true) if create => Ok(OpenMode::CreateOrTruncate),
            (false, true) => Ok(OpenMode::Truncate),
            (false, false) if create => Ok(OpenMode::OpenOrCreate),
            (false, false) => Ok(OpenMode::Open),
        }
    }

    /// Map the wire flags to an access mode
    pub fn to_access_mode(self) -> AccessMode {
        match (self.contains(Self::READ), self.contains(Self::WRITE)) {
            (true, true) => AccessMode::ReadWrite,
            (false, true) => AccessMode::Write,
            _ => AccessMode::Read,
        }
    }
}
