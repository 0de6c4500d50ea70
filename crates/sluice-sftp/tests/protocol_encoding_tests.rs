//! Protocol encoding/decoding tests
//!
//! NIST 800-53: SI-11 (Error Handling), SI-10 (Input Validation)
//! Implementation: Wire constants, flag mappings and attribute layout

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sluice_sftp::attrs::{timestamp_from_wire, timestamp_to_wire};
use sluice_sftp::codec::{get_string, put_string, response_mask};
use sluice_sftp::protocol::{
    AccessMode, AttrFlags, FileType, MessageType, OpenFlags, OpenMode, Permissions, SFTP_VERSION,
    StatusCode,
};
use sluice_sftp::{Attributes, Error, NameEntry};
use std::collections::BTreeMap;

/// NIST 800-53: SI-11 - Test protocol message type conversions
#[test]
fn test_all_message_type_conversions() {
    // Request types
    assert_eq!(MessageType::try_from(1).unwrap(), MessageType::Init);
    assert_eq!(MessageType::try_from(3).unwrap(), MessageType::Open);
    assert_eq!(MessageType::try_from(4).unwrap(), MessageType::Close);
    assert_eq!(MessageType::try_from(5).unwrap(), MessageType::Read);
    assert_eq!(MessageType::try_from(6).unwrap(), MessageType::Write);
    assert_eq!(MessageType::try_from(7).unwrap(), MessageType::Lstat);
    assert_eq!(MessageType::try_from(8).unwrap(), MessageType::Fstat);
    assert_eq!(MessageType::try_from(9).unwrap(), MessageType::Setstat);
    assert_eq!(MessageType::try_from(10).unwrap(), MessageType::Fsetstat);
    assert_eq!(MessageType::try_from(11).unwrap(), MessageType::Opendir);
    assert_eq!(MessageType::try_from(12).unwrap(), MessageType::Readdir);
    assert_eq!(MessageType::try_from(13).unwrap(), MessageType::Remove);
    assert_eq!(MessageType::try_from(14).unwrap(), MessageType::Mkdir);
    assert_eq!(MessageType::try_from(15).unwrap(), MessageType::Rmdir);
    assert_eq!(MessageType::try_from(16).unwrap(), MessageType::Realpath);
    assert_eq!(MessageType::try_from(17).unwrap(), MessageType::Stat);
    assert_eq!(MessageType::try_from(18).unwrap(), MessageType::Rename);
    assert_eq!(MessageType::try_from(19).unwrap(), MessageType::Readlink);
    assert_eq!(MessageType::try_from(20).unwrap(), MessageType::Symlink);
    assert_eq!(MessageType::try_from(200).unwrap(), MessageType::Extended);

    // Response types
    assert_eq!(MessageType::try_from(2).unwrap(), MessageType::Version);
    assert_eq!(MessageType::try_from(101).unwrap(), MessageType::Status);
    assert_eq!(MessageType::try_from(102).unwrap(), MessageType::Handle);
    assert_eq!(MessageType::try_from(103).unwrap(), MessageType::Data);
    assert_eq!(MessageType::try_from(104).unwrap(), MessageType::Name);
    assert_eq!(MessageType::try_from(105).unwrap(), MessageType::Attrs);
    assert_eq!(MessageType::try_from(201).unwrap(), MessageType::ExtendedReply);
}

/// NIST 800-53: SI-10 - Test invalid message type handling
#[test]
fn test_invalid_message_types() {
    for value in [0u8, 21, 100, 106, 199, 202, 255] {
        let err = MessageType::try_from(value).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)), "type {}", value);
    }
}

#[test]
fn test_request_classification() {
    assert!(MessageType::Init.is_request());
    assert!(MessageType::Open.is_request());
    assert!(MessageType::Symlink.is_request());
    assert!(MessageType::Extended.is_request());

    assert!(!MessageType::Version.is_request());
    assert!(!MessageType::Status.is_request());
    assert!(!MessageType::Attrs.is_request());
    assert!(!MessageType::ExtendedReply.is_request());
}

/// NIST 800-53: SI-11 - Test all status codes
#[test]
fn test_all_status_codes() {
    assert_eq!(u32::from(StatusCode::Ok), 0);
    assert_eq!(u32::from(StatusCode::Eof), 1);
    assert_eq!(u32::from(StatusCode::NoSuchFile), 2);
    assert_eq!(u32::from(StatusCode::PermissionDenied), 3);
    assert_eq!(u32::from(StatusCode::Failure), 4);
    assert_eq!(u32::from(StatusCode::BadMessage), 5);
    assert_eq!(u32::from(StatusCode::NoConnection), 6);
    assert_eq!(u32::from(StatusCode::ConnectionLost), 7);
    assert_eq!(u32::from(StatusCode::OpUnsupported), 8);

    assert_eq!(StatusCode::try_from(4).unwrap(), StatusCode::Failure);
    assert!(StatusCode::try_from(9).is_err());
}

#[test]
fn test_protocol_version() {
    assert_eq!(SFTP_VERSION, 3);
}

/// NIST 800-53: SI-10 - Test open flag mapping
#[test]
fn test_open_flags_to_open_mode() {
    let cases = [
        (OpenFlags::READ, OpenMode::Open),
        (OpenFlags::WRITE | OpenFlags::CREAT, OpenMode::OpenOrCreate),
        (OpenFlags::WRITE | OpenFlags::TRUNC, OpenMode::Truncate),
        (
            OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC,
            OpenMode::CreateOrTruncate,
        ),
        (
            OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::EXCL,
            OpenMode::CreateNew,
        ),
        (OpenFlags::WRITE | OpenFlags::APPEND, OpenMode::Append),
        (
            OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::CREAT,
            OpenMode::AppendOrCreate,
        ),
    ];

    for (flags, expected) in cases {
        assert_eq!(flags.to_open_mode().unwrap(), expected, "{:?}", flags);
    }
}

#[test]
fn test_open_flags_without_faithful_mapping() {
    let rejected = [
        OpenFlags::WRITE | OpenFlags::EXCL,
        OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::EXCL | OpenFlags::TRUNC,
        OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::EXCL | OpenFlags::APPEND,
        OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::TRUNC,
        OpenFlags::READ | OpenFlags::TEXT,
    ];

    for flags in rejected {
        let err = flags.to_open_mode().unwrap_err();
        assert_eq!(err.to_status_code(), StatusCode::OpUnsupported, "{:?}", flags);
    }
}

#[test]
fn test_open_flags_to_access_mode() {
    assert_eq!(OpenFlags::READ.to_access_mode(), AccessMode::Read);
    assert_eq!(OpenFlags::WRITE.to_access_mode(), AccessMode::Write);
    assert_eq!(
        (OpenFlags::READ | OpenFlags::WRITE).to_access_mode(),
        AccessMode::ReadWrite
    );
    assert_eq!(OpenFlags::empty().to_access_mode(), AccessMode::Read);

    assert!(AccessMode::ReadWrite.can_read());
    assert!(AccessMode::ReadWrite.can_write());
    assert!(!AccessMode::Read.can_write());
    assert!(!AccessMode::Write.can_read());

    assert!(!OpenMode::Open.requires_write());
    assert!(OpenMode::CreateNew.requires_write());
}

#[test]
fn test_permissions_rendering() {
    let dir = Permissions::from_bits_truncate(0o040755);
    assert_eq!(dir.file_type(), FileType::Directory);
    assert_eq!(dir.mode(), 0o755);
    assert_eq!(dir.to_mode_string(), "drwxr-xr-x");

    let link = Permissions::from_bits_truncate(0o120777);
    assert_eq!(link.file_type(), FileType::Symlink);
    assert_eq!(link.to_mode_string(), "lrwxrwxrwx");

    let file = Permissions::from_bits_truncate(0o100640);
    assert_eq!(file.to_mode_string(), "-rw-r-----");

    assert_eq!(Permissions::empty().file_type(), FileType::Unknown);
}

/// NIST 800-53: SI-10 - Test attribute layout follows the flags word
#[test]
fn test_attribute_field_order() {
    let mut extended = BTreeMap::new();
    extended.insert("vendor@test".to_string(), "1".to_string());

    let attrs = Attributes {
        size: Some(0x0102_0304_0506_0708),
        uid: Some(1000),
        gid: Some(100),
        permissions: Some(Permissions::from_bits_truncate(0o100644)),
        atime: timestamp_from_wire(1_700_000_000),
        mtime: timestamp_from_wire(1_700_000_100),
        extended,
    };
    assert_eq!(attrs.flags(), AttrFlags::DEFAULT | AttrFlags::EXTENDED);

    let mut buf = BytesMut::new();
    attrs.encode(&mut buf, attrs.flags());
    let mut wire = buf.freeze();

    assert_eq!(wire.get_u32(), 0x8000_000F);
    assert_eq!(wire.get_u64(), 0x0102_0304_0506_0708);
    assert_eq!(wire.get_u32(), 1000);
    assert_eq!(wire.get_u32(), 100);
    assert_eq!(wire.get_u32(), 0o100644);
    assert_eq!(wire.get_u32(), 1_700_000_000);
    assert_eq!(wire.get_u32(), 1_700_000_100);
    assert_eq!(wire.get_u32(), 1);
    assert_eq!(get_string(&mut wire).unwrap(), "vendor@test");
    assert_eq!(get_string(&mut wire).unwrap(), "1");
    assert!(wire.is_empty());
}

#[test]
fn test_attribute_mask_drops_unset_fields() {
    let attrs = Attributes {
        size: Some(42),
        ..Default::default()
    };
    assert_eq!(response_mask(&attrs), AttrFlags::SIZE);

    let mut buf = BytesMut::new();
    attrs.encode(&mut buf, response_mask(&attrs));
    assert_eq!(&buf[..], &[0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 42]);

    let mut buf = BytesMut::new();
    Attributes::default().encode(&mut buf, response_mask(&Attributes::default()));
    assert_eq!(&buf[..], &[0, 0, 0, 0]);
}

#[test]
fn test_timestamps_on_the_wire() {
    assert_eq!(timestamp_to_wire(None), 0);
    assert_eq!(timestamp_from_wire(0), None);
    assert_eq!(timestamp_to_wire(timestamp_from_wire(86_400)), 86_400);
}

#[test]
fn test_dummy_entries() {
    let file = Attributes::dummy_file();
    assert_eq!(file.permissions.map(Permissions::mode), Some(0o740));
    assert!(!file.is_dir());

    let dir = Attributes::dummy_directory();
    assert_eq!(dir.permissions.map(|p| p.bits()), Some(0o040740));
    assert!(dir.is_dir());

    let entry = NameEntry::from_path("/some/where");
    assert_eq!(entry.name, "/some/where");
    assert!(entry.long_name().starts_with("-rwxr----- "));
    assert!(entry.long_name().ends_with(" /some/where"));
}

/// NIST 800-53: SI-10 - Test string decoding bounds
#[test]
fn test_string_decoding_bounds() {
    let mut buf = BytesMut::new();
    put_string(&mut buf, "hello");
    put_string(&mut buf, "");
    let mut wire = buf.freeze();
    assert_eq!(get_string(&mut wire).unwrap(), "hello");
    assert_eq!(get_string(&mut wire).unwrap(), "");
    assert!(wire.is_empty());

    let mut overrun = BytesMut::new();
    overrun.put_u32(10);
    overrun.put_slice(b"short");
    let err = get_string(&mut overrun.freeze()).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));

    let err = get_string(&mut Bytes::from_static(&[0, 0])).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));

    let err = get_string(&mut Bytes::from_static(&[0, 0, 0, 2, 0xff, 0xfe])).unwrap_err();
    assert_eq!(err.to_status_code(), StatusCode::BadMessage);
}
