//! On-disk file formats of the index engine.
//!
//! Types and definitions shared by every file the engine owns: the primary
//! index (`<prefix>.index`), the transaction log pair (`<prefix>.log`,
//! `<prefix>.log.2`) and the message cache (`<prefix>.cache`). The formats
//! are versioned; a reader refuses files written by an incompatible build
//! (different endianness or file-offset width) via the compat bytes in each
//! header.
//!
//! All structures are `#[repr(C)]` and little-endian on disk. Multi-byte
//! fields are stored in native order and guarded by `COMPAT_LITTLE_ENDIAN`;
//! there is no byte-swapping path.

#![warn(missing_debug_implementations)]
#![allow(missing_docs)]

use bitflags::bitflags;
use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const INDEX_MAJOR_VERSION: u8 = 7;
pub const INDEX_MINOR_VERSION: u8 = 1;

pub const LOG_MAJOR_VERSION: u8 = 1;
pub const LOG_MINOR_VERSION: u8 = 0;

pub const CACHE_VERSION: u8 = 1;

/// Set in `compat_flags` when the file was written on a little-endian host.
pub const COMPAT_LITTLE_ENDIAN: u8 = 0x01;
/// Width of file offsets on the writing host. Files from a host with a
/// different offset width are refused.
pub const COMPAT_SIZEOF_FILE_OFFSET: u8 = std::mem::size_of::<u64>() as u8;

pub(crate) fn host_compat_flags() -> u8 {
    if cfg!(target_endian = "little") {
        COMPAT_LITTLE_ENDIAN
    } else {
        0
    }
}

/// Number of inline keyword-bitmap bytes in every record.
pub const KEYWORDS_BYTE_COUNT: usize = 3;
/// Highest keyword bit index representable in the inline bitmap.
pub const KEYWORDS_MAX: usize = KEYWORDS_BYTE_COUNT * 8;

/// File name suffixes appended to the index prefix.
pub const INDEX_SUFFIX: &str = ".index";
pub const LOG_SUFFIX: &str = ".log";
pub const LOG_ROTATED_SUFFIX: &str = ".log.2";
pub const CACHE_SUFFIX: &str = ".cache";
pub const TMP_SUFFIX: &str = ".tmp";
pub const DOTLOCK_SUFFIX: &str = ".lock";

/// Log records start on this boundary and are zero-padded up to it.
pub const LOG_RECORD_ALIGN: usize = 8;

/// Rounds `n` up to the log record boundary.
pub(crate) const fn align8(n: usize) -> usize {
    (n + LOG_RECORD_ALIGN - 1) & !(LOG_RECORD_ALIGN - 1)
}

/// Rounds `n` up to a 4-byte boundary (header blocks, cache data).
pub(crate) const fn align4(n: usize) -> usize {
    (n + 3) & !3
}

bitflags! {
    /// Per-mail flags byte. Bit positions are part of the file format.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serializable", derive(serde::Serialize, serde::Deserialize))]
    pub struct MailFlags: u8 {
        const ANSWERED = 0x01;
        const FLAGGED = 0x02;
        const DELETED = 0x04;
        const SEEN = 0x08;
        const DRAFT = 0x10;
        const RECENT = 0x20;
        /// The mail storage holds a newer flag value than the backend file.
        const DIRTY = 0x40;
        // bit 7 reserved
    }
}

bitflags! {
    /// Index header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u32 {
        /// At least one record carries [`MailFlags::DIRTY`].
        const HAVE_DIRTY = 0x01;
        /// Structural check failed; the file must be rebuilt.
        const CORRUPTED = 0x02;
    }
}

/// Header of `<prefix>.index`, at file offset 0.
///
/// `header_size` covers this struct plus the trailing extension block;
/// records follow at `header_size`, `messages_count` of them, each
/// `record_size` bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct IndexHeader {
    pub major_version: u8,
    pub minor_version: u8,
    pub base_header_size: u16,
    pub header_size: u32,
    pub record_size: u32,

    pub compat_flags: u8,
    pub compat_sizeof_file_offset: u8,
    pub unused: [u8; 2],

    pub flags: u32,

    pub indexid: u32,
    pub uid_validity: u32,
    pub next_uid: u32,

    pub messages_count: u32,
    pub seen_messages_count: u32,
    pub deleted_messages_count: u32,

    pub first_recent_uid_lowwater: u32,
    pub first_unseen_uid_lowwater: u32,
    pub first_deleted_uid_lowwater: u32,

    pub log_file_seq: u32,
    pub unused2: u32,
    pub log_file_int_offset: u64,
    pub log_file_ext_offset: u64,
}

pub const INDEX_BASE_HEADER_SIZE: usize = std::mem::size_of::<IndexHeader>();

impl IndexHeader {
    pub(crate) fn new(indexid: u32, uid_validity: u32) -> IndexHeader {
        IndexHeader {
            major_version: INDEX_MAJOR_VERSION,
            minor_version: INDEX_MINOR_VERSION,
            base_header_size: INDEX_BASE_HEADER_SIZE as u16,
            header_size: INDEX_BASE_HEADER_SIZE as u32,
            record_size: RECORD_BASE_SIZE as u32,
            compat_flags: host_compat_flags(),
            compat_sizeof_file_offset: COMPAT_SIZEOF_FILE_OFFSET,
            unused: [0; 2],
            flags: 0,
            indexid,
            uid_validity,
            next_uid: 1,
            messages_count: 0,
            seen_messages_count: 0,
            deleted_messages_count: 0,
            first_recent_uid_lowwater: 0,
            first_unseen_uid_lowwater: 0,
            first_deleted_uid_lowwater: 0,
            log_file_seq: 0,
            unused2: 0,
            log_file_int_offset: 0,
            log_file_ext_offset: 0,
        }
    }
}

/// Fixed prefix of every record. Extension slots follow up to the header's
/// `record_size`; their offsets come from the extension block, so older
/// readers skip suffixes they don't know.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Record {
    pub uid: u32,
    pub flags: u8,
    pub keywords: [u8; KEYWORDS_BYTE_COUNT],
}

pub const RECORD_BASE_SIZE: usize = std::mem::size_of::<Record>();

/// One entry of the extension block trailing the index header. Followed by
/// `name_size` name bytes padded to 4, then `hdr_size` bytes of
/// extension-header data padded to 4.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ExtHeader {
    pub hdr_size: u32,
    /// Bumped whenever the extension's derived state is reset (e.g. the
    /// cache file is rewritten). Readers holding stale state compare this.
    pub reset_id: u32,
    pub record_offset: u16,
    pub record_size: u16,
    pub record_align: u16,
    pub name_size: u16,
}

pub const EXT_HEADER_SIZE: usize = std::mem::size_of::<ExtHeader>();

/// Header of a transaction log file.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LogFileHeader {
    pub major_version: u8,
    pub minor_version: u8,
    pub compat_flags: u8,
    pub compat_sizeof_file_offset: u8,
    pub indexid: u32,
    pub file_seq: u32,
    pub prev_file_seq: u32,
    pub prev_file_offset: u64,
    pub create_stamp: u64,
}

pub const LOG_FILE_HEADER_SIZE: usize = std::mem::size_of::<LogFileHeader>();

/// Framing of one log record: this header, `size` payload bytes, zero
/// padding to [`LOG_RECORD_ALIGN`].
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LogRecordHeader {
    pub typ: u8,
    pub reserved: u8,
    pub unused: u16,
    pub size: u32,
}

pub const LOG_RECORD_HEADER_SIZE: usize = std::mem::size_of::<LogRecordHeader>();

/// Transaction log record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serializable", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum LogRecordType {
    /// Array of base [`Record`]s appended at the end of the mailbox.
    Append = 0x01,
    /// Array of [`UidRange`]s removed from the mailbox.
    Expunge = 0x02,
    /// Array of [`LogFlagUpdate`]s; set-wise, idempotent.
    FlagUpdate = 0x03,
    /// Keyword name plus UID ranges; adds or removes one keyword bit.
    KeywordUpdate = 0x04,
    /// Partial write into the base header area.
    HeaderUpdate = 0x05,
    /// Introduces or rebinds an extension in the map.
    ExtIntro = 0x06,
    /// Invalidates derived state of an extension.
    ExtReset = 0x07,
    /// Partial write into an extension's header area.
    ExtHdrUpdate = 0x08,
    /// Per-record extension slot writes.
    ExtRecUpdate = 0x09,
}

bitflags! {
    /// Change categories, used both as the view-sync interest mask and as
    /// the per-category fsync mask of the write path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SyncTypes: u32 {
        const APPEND = 0x01;
        const EXPUNGE = 0x02;
        const FLAGS = 0x04;
        const KEYWORDS = 0x08;
        const HEADER = 0x10;
        const EXT = 0x20;
    }
}

impl LogRecordType {
    /// The sync category a record of this type belongs to.
    pub fn sync_type(self) -> SyncTypes {
        match self {
            LogRecordType::Append => SyncTypes::APPEND,
            LogRecordType::Expunge => SyncTypes::EXPUNGE,
            LogRecordType::FlagUpdate => SyncTypes::FLAGS,
            LogRecordType::KeywordUpdate => SyncTypes::KEYWORDS,
            LogRecordType::HeaderUpdate => SyncTypes::HEADER,
            LogRecordType::ExtIntro
            | LogRecordType::ExtReset
            | LogRecordType::ExtHdrUpdate
            | LogRecordType::ExtRecUpdate => SyncTypes::EXT,
        }
    }
}

/// An inclusive UID range. Also the payload stride of expunge records.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct UidRange {
    pub uid1: u32,
    pub uid2: u32,
}

/// One flag-update payload entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LogFlagUpdate {
    pub uid1: u32,
    pub uid2: u32,
    pub add_flags: u8,
    pub remove_flags: u8,
    pub unused: [u8; 2],
}

/// Keyword-update payload prefix, followed by the keyword name padded to 4
/// and an array of [`UidRange`]s.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LogKeywordUpdate {
    pub modify: u8,
    pub unused: u8,
    pub name_size: u16,
}

pub const KEYWORD_MODIFY_ADD: u8 = 0;
pub const KEYWORD_MODIFY_REMOVE: u8 = 1;

/// Header-update payload prefix, followed by `size` bytes written at
/// `offset` into the base header.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LogHeaderUpdate {
    pub offset: u16,
    pub size: u16,
}

/// Ext-intro payload prefix, followed by the extension name padded to 4.
/// `ext_slot` of [`EXT_SLOT_BY_NAME`] means "resolve by name"; the record
/// then assigns the next free slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LogExtIntro {
    pub ext_slot: u32,
    pub reset_id: u32,
    pub hdr_size: u32,
    pub record_size: u16,
    pub record_align: u16,
    pub name_size: u16,
    pub unused: u16,
}

pub const EXT_SLOT_BY_NAME: u32 = u32::MAX;

/// Ext-reset payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LogExtReset {
    pub ext_slot: u32,
    pub new_reset_id: u32,
}

/// Ext-header-update payload prefix, followed by `size` bytes written at
/// `offset` into the extension header area.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LogExtHdrUpdate {
    pub ext_slot: u32,
    pub offset: u16,
    pub size: u16,
}

/// Ext-record-update payload prefix, followed by entries of
/// { uid u32, slot bytes } with the slot width taken from the extension's
/// `record_size`, each entry padded to 4.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LogExtRecUpdate {
    pub ext_slot: u32,
}

/// Header of `<prefix>.cache`, at file offset 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CacheHeader {
    pub version: u8,
    pub compat_sizeof_file_offset: u8,
    pub unused: [u8; 2],
    pub indexid: u32,
    /// Must equal the cache extension's reset_id in the index header;
    /// otherwise every cache offset held by a reader is stale.
    pub file_seq: u32,
    pub continued_record_count: u32,
    pub used_file_size: u32,
    pub deleted_space: u32,
    pub field_header_offset: u32,
}

pub const CACHE_HEADER_SIZE: usize = std::mem::size_of::<CacheHeader>();

/// Framing of one cache record: this header then `size - 8` data bytes of
/// { packed field id, field data } pairs. `prev_offset` links to the mail's
/// previous cache record, 0 terminates the chain.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CacheRecordHeader {
    pub prev_offset: u32,
    pub size: u32,
}

pub const CACHE_RECORD_HEADER_SIZE: usize = std::mem::size_of::<CacheRecordHeader>();

/// One entry of the cache file's field-name block, followed by `name_size`
/// name bytes padded to 4. The block makes cache files self-describing:
/// field ids are per-file and resolved back to registered fields by name.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CacheFieldHeader {
    pub typ: u8,
    pub unused: [u8; 3],
    pub field_size: u32,
    pub name_size: u32,
}

pub const CACHE_FIELD_HEADER_SIZE: usize = std::mem::size_of::<CacheFieldHeader>();

/// Cache field value encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serializable", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum CacheFieldType {
    /// `field_size` bytes, stored verbatim.
    Fixed = 0,
    /// u32 length prefix plus data padded to 4.
    Variable = 1,
    /// Like `Variable` but the data is NUL-free text.
    String = 2,
    /// 7-bit continuation varint (timestamps).
    Date = 3,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn struct_sizes_are_stable() {
        // These sizes are part of the file format.
        assert_eq!(INDEX_BASE_HEADER_SIZE, 80);
        assert_eq!(RECORD_BASE_SIZE, 8);
        assert_eq!(EXT_HEADER_SIZE, 16);
        assert_eq!(LOG_FILE_HEADER_SIZE, 32);
        assert_eq!(LOG_RECORD_HEADER_SIZE, 8);
        assert_eq!(CACHE_HEADER_SIZE, 28);
        assert_eq!(CACHE_RECORD_HEADER_SIZE, 8);
        assert_eq!(CACHE_FIELD_HEADER_SIZE, 12);
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(9), 16);
        assert_eq!(align4(5), 8);
        assert_eq!(align4(12), 12);
    }

    #[test]
    fn record_type_roundtrip() {
        for raw in 0x01..=0x09u8 {
            let typ = LogRecordType::try_from(raw).unwrap();
            assert_eq!(u8::from(typ), raw);
        }
        assert!(LogRecordType::try_from(0u8).is_err());
        assert!(LogRecordType::try_from(0x0au8).is_err());
    }
}
