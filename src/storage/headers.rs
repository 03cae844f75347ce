//! # File Header Definitions
//!
//! Every data file in a storage root starts with the same 128-byte header.
//! The first half is static identity written once at creation; the second
//! half holds eight u64 counter slots that each component updates atomically
//! through [`MappedRegion`](super::MappedRegion) while the file is open.
//!
//! ## Header Layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ---------------------------------------------
//!      0    16  magic ("vfstore data")
//!     16     4  format_version (layout of this crate's files)
//!     20     4  kind (FileKind)
//!     24     4  store_version (caller-supplied, checked at connect)
//!     28     4  flags (HEADER_FLAG_*)
//!     32     4  clean_shutdown (1 after close, 0 while open)
//!     36     4  chunk_size (mapping granularity of this file)
//!     40    24  reserved
//!     64    64  counters[8] (component-owned atomic slots)
//! ```
//!
//! A file whose magic, format version or kind do not match is reported as
//! `HeaderMismatch`. A file written under another store version is reported
//! as `VersionMismatch`. Both are corruption-kind errors, so connect answers
//! them by rebuilding the root.
//!
//! ## Endianness
//!
//! Multi-byte fields are little-endian. The counters are also read and
//! written as native atomics, which only agrees with the on-disk encoding on
//! little-endian targets; [`FileHeader`] asserts this at compile time.

use std::path::Path;

use eyre::Result;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{FILE_HEADER_SIZE, HEADER_COUNTERS_OFFSET, HEADER_COUNTER_SLOTS};
use crate::error::StoreError;

pub const STORE_MAGIC: &[u8; 16] = b"vfstore data\x00\x00\x00\x00";

pub const FORMAT_VERSION: u32 = 1;

/// Names in this file compare case-insensitively.
pub const HEADER_FLAG_CASE_INSENSITIVE: u32 = 1 << 0;
/// Hash map file holds several values per key.
pub const HEADER_FLAG_MULTI_VALUED: u32 = 1 << 1;

pub const CLEAN_SHUTDOWN_OFFSET: u64 = 32;

const _: () = assert!(
    cfg!(target_endian = "little"),
    "header counters are accessed as native atomics"
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FileKind {
    Records = 1,
    EnumeratorLog = 2,
    HashMap = 3,
    Attributes = 4,
    FastInt = 5,
}

impl FileKind {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(FileKind::Records),
            2 => Some(FileKind::EnumeratorLog),
            3 => Some(FileKind::HashMap),
            4 => Some(FileKind::Attributes),
            5 => Some(FileKind::FastInt),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic: [u8; 16],
    format_version: U32,
    kind: U32,
    store_version: U32,
    flags: U32,
    clean_shutdown: U32,
    chunk_size: U32,
    reserved: [u8; 24],
    counters: [U64; HEADER_COUNTER_SLOTS],
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);
const _: () = assert!(std::mem::offset_of!(FileHeader, clean_shutdown) == CLEAN_SHUTDOWN_OFFSET as usize);
const _: () = assert!(std::mem::offset_of!(FileHeader, counters) == HEADER_COUNTERS_OFFSET);

impl FileHeader {
    pub fn new(kind: FileKind, store_version: u32, flags: u32, chunk_size: u32) -> Self {
        Self {
            magic: *STORE_MAGIC,
            format_version: U32::new(FORMAT_VERSION),
            kind: U32::new(kind as u32),
            store_version: U32::new(store_version),
            flags: U32::new(flags),
            clean_shutdown: U32::new(1),
            chunk_size: U32::new(chunk_size),
            reserved: [0u8; 24],
            counters: [U64::new(0); HEADER_COUNTER_SLOTS],
        }
    }

    pub fn read_from(bytes: &[u8]) -> Result<Self> {
        let Some(raw) = bytes.get(..FILE_HEADER_SIZE) else {
            eyre::bail!(
                "buffer too small for FileHeader: {} < {}",
                bytes.len(),
                FILE_HEADER_SIZE
            );
        };
        Self::read_from_bytes(raw)
            .map_err(|e| eyre::eyre!("failed to parse FileHeader: {:?}", e))
    }

    /// Checks identity fields against what the opener expects.
    pub fn validate(&self, path: &Path, kind: FileKind, store_version: u32) -> Result<()> {
        let mismatch = |reason: String| StoreError::HeaderMismatch {
            path: path.to_path_buf(),
            reason,
        };

        if &self.magic != STORE_MAGIC {
            return Err(mismatch("invalid magic bytes".to_string()).into());
        }
        if self.format_version.get() != FORMAT_VERSION {
            return Err(mismatch(format!(
                "unsupported format version {} (expected {})",
                self.format_version.get(),
                FORMAT_VERSION
            ))
            .into());
        }
        if self.kind.get() != kind as u32 {
            return Err(mismatch(format!(
                "file kind {:?} where {:?} was expected",
                FileKind::from_u32(self.kind.get()),
                kind
            ))
            .into());
        }
        if self.store_version.get() != store_version {
            return Err(StoreError::VersionMismatch {
                path: path.to_path_buf(),
                found: self.store_version.get(),
                expected: store_version,
            }
            .into());
        }
        Ok(())
    }

    pub fn kind(&self) -> Option<FileKind> {
        FileKind::from_u32(self.kind.get())
    }

    pub fn store_version(&self) -> u32 {
        self.store_version.get()
    }

    pub fn flags(&self) -> u32 {
        self.flags.get()
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.get() & flag != 0
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size.get()
    }

    pub fn was_clean_shutdown(&self) -> bool {
        self.clean_shutdown.get() == 1
    }
}

/// Byte offset of counter slot `slot` within a file.
pub const fn counter_offset(slot: usize) -> u64 {
    assert!(slot < HEADER_COUNTER_SLOTS);
    (HEADER_COUNTERS_OFFSET + slot * 8) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{store_error, ErrorKind};

    #[test]
    fn header_round_trips_through_bytes() {
        let header = FileHeader::new(FileKind::HashMap, 7, HEADER_FLAG_MULTI_VALUED, 4096);
        let parsed = FileHeader::read_from(header.as_bytes()).unwrap();

        assert_eq!(parsed.kind(), Some(FileKind::HashMap));
        assert_eq!(parsed.store_version(), 7);
        assert!(parsed.has_flag(HEADER_FLAG_MULTI_VALUED));
        assert!(!parsed.has_flag(HEADER_FLAG_CASE_INSENSITIVE));
        assert_eq!(parsed.chunk_size(), 4096);
        assert!(parsed.was_clean_shutdown());
    }

    #[test]
    fn validate_reports_version_mismatch_as_corruption() {
        let header = FileHeader::new(FileKind::Records, 1, 0, 4096);
        let err = header
            .validate(Path::new("records.dat"), FileKind::Records, 2)
            .unwrap_err();

        assert!(matches!(
            store_error(&err),
            Some(StoreError::VersionMismatch {
                found: 1,
                expected: 2,
                ..
            })
        ));
        assert_eq!(crate::error::error_kind(&err), ErrorKind::Corruption);
    }

    #[test]
    fn validate_rejects_wrong_kind() {
        let header = FileHeader::new(FileKind::Records, 1, 0, 4096);
        let err = header
            .validate(Path::new("names.log"), FileKind::EnumeratorLog, 1)
            .unwrap_err();

        assert!(matches!(
            store_error(&err),
            Some(StoreError::HeaderMismatch { .. })
        ));
    }

    #[test]
    fn validate_rejects_bad_magic() {
        let mut bytes = FileHeader::new(FileKind::Records, 1, 0, 4096)
            .as_bytes()
            .to_vec();
        bytes[0] = b'X';
        let header = FileHeader::read_from(&bytes).unwrap();

        assert!(header
            .validate(Path::new("records.dat"), FileKind::Records, 1)
            .is_err());
    }

    #[test]
    fn read_from_short_buffer_fails() {
        assert!(FileHeader::read_from(&[0u8; 64]).is_err());
    }

    #[test]
    fn counter_offsets_fill_header_tail() {
        assert_eq!(counter_offset(0), 64);
        assert_eq!(counter_offset(7), 120);
    }
}
