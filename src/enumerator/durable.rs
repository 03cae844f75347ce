//! Value log plus hash map enumerator.
//!
//! ## Value Log
//!
//! ```text
//! offset 0      file header  (slot 0: tail offset, slot 1: entry count)
//! offset 128    [hash u32][len u32][utf8 bytes][pad to 8]   id = 16
//! offset ...    [hash u32][len u32][utf8 bytes][pad to 8]   id = offset / 8
//! ```
//!
//! The hash is CRC-32C of the (normalized) value. The companion map stores
//! `hash -> id` in multi-valued mode, so colliding values each keep their
//! own entry and are told apart by comparing the stored bytes.
//!
//! ## Publication Order
//!
//! 1. entry bytes are written past the tail
//! 2. the tail is advanced (release)
//! 3. `hash -> id` is put into the map
//!
//! A reader that finds the id in the map is therefore guaranteed to find
//! the entry inside the tail. A crash between 2 and 3 leaves an unmapped
//! entry, which [`DurableEnumerator::recover`] re-inserts before the
//! enumerator is used again.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISCSI};
use eyre::{Result, WrapErr};
use parking_lot::Mutex;

use super::{check_value, normalize, reject_null_id, Enumerator};
use crate::config::{DEFAULT_CHUNK_SIZE, FILE_HEADER_SIZE, LOG_ENTRY_HEADER_SIZE};
use crate::error::StoreError;
use crate::hashmap::{ExtendibleHashMap, MapMode};
use crate::storage::{
    counter_offset, FileHeader, FileKind, MappedRegion, HEADER_FLAG_CASE_INSENSITIVE,
};

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const SLOT_TAIL: usize = 0;
const SLOT_COUNT: usize = 1;

#[inline]
fn entry_len(value_len: usize) -> u64 {
    (LOG_ENTRY_HEADER_SIZE + value_len).next_multiple_of(8) as u64
}

pub struct DurableEnumerator {
    log: MappedRegion,
    map: ExtendibleHashMap,
    case_sensitive: bool,
    clean_at_open: bool,
    writer: Mutex<()>,
}

impl std::fmt::Debug for DurableEnumerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableEnumerator")
            .field("log", &self.log.path())
            .field("case_sensitive", &self.case_sensitive)
            .finish()
    }
}

impl DurableEnumerator {
    pub fn log_path(root: &Path, stem: &str) -> PathBuf {
        root.join(format!("{}.log", stem))
    }

    pub fn map_path(root: &Path, stem: &str) -> PathBuf {
        root.join(format!("{}.map", stem))
    }

    /// Opens `<stem>.log` and `<stem>.map` under `root`, creating both when
    /// the log is missing. `case_sensitive` only applies at creation.
    pub fn open_or_create(
        root: &Path,
        stem: &str,
        store_version: u32,
        case_sensitive: bool,
    ) -> Result<Self> {
        let log_path = Self::log_path(root, stem);
        let map_path = Self::map_path(root, stem);

        if !log_path.exists() {
            let flags = if case_sensitive {
                0
            } else {
                HEADER_FLAG_CASE_INSENSITIVE
            };
            let header = FileHeader::new(
                FileKind::EnumeratorLog,
                store_version,
                flags,
                DEFAULT_CHUNK_SIZE as u32,
            );
            let log = MappedRegion::create(&log_path, &header)?;
            log.write_u64(counter_offset(SLOT_TAIL), FILE_HEADER_SIZE as u64)?;
            log.write_u64(counter_offset(SLOT_COUNT), 0)?;
            let map = ExtendibleHashMap::create(&map_path, store_version, MapMode::Multi)?;
            return Ok(Self {
                log,
                map,
                case_sensitive,
                clean_at_open: true,
                writer: Mutex::new(()),
            });
        }

        let (log, header) = MappedRegion::open(&log_path, FileKind::EnumeratorLog, store_version)
            .wrap_err_with(|| format!("failed to open enumerator '{}'", stem))?;
        let map = ExtendibleHashMap::open_or_create(&map_path, store_version, MapMode::Multi)?;
        let persisted = !header.has_flag(HEADER_FLAG_CASE_INSENSITIVE);
        if persisted != case_sensitive {
            tracing::debug!(
                enumerator = stem,
                case_sensitive = persisted,
                "keeping case sensitivity chosen at creation"
            );
        }

        let enumerator = Self {
            log,
            clean_at_open: header.was_clean_shutdown() && map.was_clean_at_open(),
            map,
            case_sensitive: persisted,
            writer: Mutex::new(()),
        };
        let tail = enumerator.tail()?;
        if tail < FILE_HEADER_SIZE as u64 || tail > enumerator.log.len() || tail % 8 != 0 {
            return Err(enumerator.corruption(format!("log tail {} is invalid", tail)));
        }
        Ok(enumerator)
    }

    pub fn was_clean_at_open(&self) -> bool {
        self.clean_at_open
    }

    fn corruption(&self, reason: String) -> eyre::Report {
        StoreError::EnumeratorCorruption {
            path: self.log.path().to_path_buf(),
            reason,
        }
        .into()
    }

    fn tail(&self) -> Result<u64> {
        self.log.read_u64(counter_offset(SLOT_TAIL))
    }

    fn hash(&self, normalized: &str) -> u32 {
        CRC32C.checksum(normalized.as_bytes())
    }

    /// Reads the entry for `id`, validating its bounds, hash and encoding,
    /// and hands the stored hash and value to `f`.
    fn with_entry<R>(&self, id: u32, f: impl FnOnce(u32, &str) -> R) -> Result<R> {
        let offset = id as u64 * 8;
        let tail = self.tail()?;
        if offset < FILE_HEADER_SIZE as u64 || offset + LOG_ENTRY_HEADER_SIZE as u64 > tail {
            return Err(self.corruption(format!("id {} is outside the log (tail {})", id, tail)));
        }
        let stored_hash = self.log.read_u32(offset)?;
        let len = self.log.read_u32(offset + 4)? as usize;
        let start = offset + LOG_ENTRY_HEADER_SIZE as u64;
        if len == 0 || start + len as u64 > tail {
            return Err(self.corruption(format!("entry {} has invalid length {}", id, len)));
        }

        let bytes: Cow<'_, [u8]> = match self.log.slice(start, len) {
            Some(view) => Cow::Borrowed(view),
            None => {
                let mut buf = vec![0u8; len];
                self.log.read_bytes(start, &mut buf)?;
                Cow::Owned(buf)
            }
        };
        let Ok(value) = std::str::from_utf8(&bytes) else {
            return Err(self.corruption(format!("entry {} is not valid UTF-8", id)));
        };
        if self.hash(&normalize(value, self.case_sensitive)) != stored_hash {
            return Err(self.corruption(format!("entry {} fails its hash check", id)));
        }
        Ok(f(stored_hash, value))
    }

    fn find(&self, hash: u32, normalized: &str) -> Result<Option<u32>> {
        self.map.lookup(hash, |id| {
            self.with_entry(id, |stored_hash, value| {
                stored_hash == hash && normalize(value, self.case_sensitive) == normalized
            })
        })
    }

    fn append(&self, hash: u32, value: &str) -> Result<u32> {
        let offset = self.tail()?;
        let end = offset + entry_len(value.len());
        let id = u32::try_from(offset / 8)
            .map_err(|_| self.corruption(format!("log offset {} exceeds id space", offset)))?;

        self.log.ensure_capacity(end)?;
        let mut entry = Vec::with_capacity((end - offset) as usize);
        entry.extend_from_slice(&hash.to_le_bytes());
        entry.extend_from_slice(&(value.len() as u32).to_le_bytes());
        entry.extend_from_slice(value.as_bytes());
        entry.resize((end - offset) as usize, 0);
        self.log.write_bytes(offset, &entry)?;

        self.log.write_u64(counter_offset(SLOT_TAIL), end)?;
        self.log.fetch_add_u64(counter_offset(SLOT_COUNT), 1)?;
        Ok(id)
    }

    /// Walks the log and puts any entry missing from the hash map back in.
    /// Returns the number of entries re-inserted.
    pub fn recover(&self) -> Result<usize> {
        let _writer = self.writer.lock();
        let tail = self.tail()?;
        let mut offset = FILE_HEADER_SIZE as u64;
        let mut count = 0u64;
        let mut repaired = 0usize;
        while offset < tail {
            let id = (offset / 8) as u32;
            let (hash, len) = self.with_entry(id, |hash, value| (hash, value.len()))?;
            if !self.map.contains(hash, id)? {
                self.map.put(hash, id)?;
                repaired += 1;
            }
            count += 1;
            offset += entry_len(len);
        }
        self.log.write_u64(counter_offset(SLOT_COUNT), count)?;
        if repaired > 0 {
            tracing::warn!(
                path = %self.log.path().display(),
                repaired,
                "re-inserted enumerator entries missing from hash map"
            );
        }
        Ok(repaired)
    }

    pub fn verify(&self) -> Result<()> {
        self.map.verify()?;
        self.recover()?;
        Ok(())
    }

    pub fn set_clean_shutdown(&self, clean: bool) -> Result<()> {
        self.log.set_clean_shutdown(clean)?;
        self.map.set_clean_shutdown(clean)
    }
}

impl Enumerator for DurableEnumerator {
    fn enumerate(&self, value: &str) -> Result<u32> {
        check_value(value)?;
        let normalized = normalize(value, self.case_sensitive);
        let hash = self.hash(&normalized);
        if let Some(id) = self.find(hash, &normalized)? {
            return Ok(id);
        }

        let _writer = self.writer.lock();
        if let Some(id) = self.find(hash, &normalized)? {
            return Ok(id);
        }
        let id = self
            .append(hash, value)
            .wrap_err_with(|| format!("failed to append '{}' to enumerator", value))?;
        self.map.put(hash, id)?;
        Ok(id)
    }

    fn try_enumerate(&self, value: &str) -> Result<Option<u32>> {
        check_value(value)?;
        let normalized = normalize(value, self.case_sensitive);
        self.find(self.hash(&normalized), &normalized)
    }

    fn value_of(&self, id: u32) -> Result<String> {
        reject_null_id(id)?;
        self.with_entry(id, |_, value| value.to_owned())
    }

    fn len(&self) -> Result<u64> {
        self.log.read_u64(counter_offset(SLOT_COUNT))
    }

    fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    fn for_each(&self, visitor: &mut dyn FnMut(u32, &str) -> bool) -> Result<()> {
        let tail = self.tail()?;
        let mut offset = FILE_HEADER_SIZE as u64;
        while offset < tail {
            let id = (offset / 8) as u32;
            let (len, keep_going) = self.with_entry(id, |_, value| (value.len(), visitor(id, value)))?;
            if !keep_going {
                break;
            }
            offset += entry_len(len);
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.log.flush()?;
        self.map.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_kind, store_error, ErrorKind};
    use tempfile::tempdir;

    #[test]
    fn first_id_follows_header() {
        let dir = tempdir().unwrap();
        let names = DurableEnumerator::open_or_create(dir.path(), "names", 1, true).unwrap();

        assert_eq!(names.enumerate("a").unwrap(), (FILE_HEADER_SIZE / 8) as u32);
        assert_eq!(names.enumerate("b").unwrap(), (FILE_HEADER_SIZE / 8) as u32 + 2);
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempdir().unwrap();
        let ids: Vec<u32> = {
            let names = DurableEnumerator::open_or_create(dir.path(), "names", 1, true).unwrap();
            let ids = (0..500)
                .map(|i| names.enumerate(&format!("persisted-{}", i)).unwrap())
                .collect();
            names.flush().unwrap();
            ids
        };

        let names = DurableEnumerator::open_or_create(dir.path(), "names", 1, true).unwrap();
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(names.value_of(*id).unwrap(), format!("persisted-{}", i));
            assert_eq!(
                names.try_enumerate(&format!("persisted-{}", i)).unwrap(),
                Some(*id)
            );
        }
        assert_eq!(names.len().unwrap(), 500);
    }

    #[test]
    fn values_spanning_chunks_round_trip() {
        let dir = tempdir().unwrap();
        let names = DurableEnumerator::open_or_create(dir.path(), "big", 1, true).unwrap();

        let long: Vec<String> = (0..40)
            .map(|i| format!("{}-{}", i, "x".repeat(60_000)))
            .collect();
        let ids: Vec<u32> = long.iter().map(|v| names.enumerate(v).unwrap()).collect();

        for (value, id) in long.iter().zip(ids) {
            assert_eq!(&names.value_of(id).unwrap(), value);
        }
    }

    #[test]
    fn id_past_tail_is_corruption() {
        let dir = tempdir().unwrap();
        let names = DurableEnumerator::open_or_create(dir.path(), "names", 1, true).unwrap();
        names.enumerate("only").unwrap();

        let err = names.value_of(10_000).unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Corruption);
    }

    #[test]
    fn damaged_entry_is_enumerator_corruption() {
        let dir = tempdir().unwrap();
        let names = DurableEnumerator::open_or_create(dir.path(), "names", 1, true).unwrap();
        let id = names.enumerate("victim.txt").unwrap();

        names
            .log
            .write_bytes(id as u64 * 8 + LOG_ENTRY_HEADER_SIZE as u64, b"V")
            .unwrap();

        let err = names.value_of(id).unwrap_err();
        assert!(matches!(
            store_error(&err),
            Some(StoreError::EnumeratorCorruption { .. })
        ));
    }

    #[test]
    fn recover_reinserts_unmapped_entries() {
        let dir = tempdir().unwrap();
        let names = DurableEnumerator::open_or_create(dir.path(), "names", 1, true).unwrap();
        let kept = names.enumerate("kept").unwrap();

        let normalized = "orphan";
        let hash = names.hash(normalized);
        let orphan = names.append(hash, normalized).unwrap();
        assert_eq!(names.try_enumerate("orphan").unwrap(), None);

        assert_eq!(names.recover().unwrap(), 1);
        assert_eq!(names.try_enumerate("orphan").unwrap(), Some(orphan));
        assert_eq!(names.enumerate("kept").unwrap(), kept);
        assert_eq!(names.len().unwrap(), 2);
    }

    #[test]
    fn case_sensitivity_is_fixed_at_creation() {
        let dir = tempdir().unwrap();
        {
            let names = DurableEnumerator::open_or_create(dir.path(), "names", 1, false).unwrap();
            names.enumerate("Makefile").unwrap();
        }

        let names = DurableEnumerator::open_or_create(dir.path(), "names", 1, true).unwrap();
        assert!(!names.is_case_sensitive());
        assert!(names.try_enumerate("makefile").unwrap().is_some());
    }
}
