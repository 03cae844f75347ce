//! # Fixed-Width Record Table
//!
//! One record per entity (file or directory), addressed by a dense entity id
//! starting at 1. Records are never removed; deletion sets
//! [`RecordFlags::FREE`].
//!
//! ## Record Layout (48 bytes)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ----------------------------
//!      0     4  seq (seqlock, odd mid-write)
//!      4     4  mod_count
//!      8     4  parent_id
//!     12     4  name_id
//!     16     4  flags
//!     20     4  content_record_id
//!     24     8  length
//!     32     8  timestamp
//!     40     4  attribute_record_id
//!     44     4  reserved
//! ```
//!
//! ## Snapshot Reads
//!
//! Writers for one record are serialized on a striped mutex and bracket
//! their field stores with the sequence word:
//!
//! ```text
//! writer: seq = s+1 ; fence(Release) ; store fields ; seq = s+2 (Release)
//! reader: s1 = seq (Acquire) ; load fields ; fence(Acquire) ; s2 = seq
//!         retry while s1 is odd or s1 != s2
//! ```
//!
//! A reader therefore sees either the whole pre-update record or the whole
//! post-update record. After `MAX_TORN_READ_RETRIES` attempts the read fails
//! with `TornRead`. Single-field getters skip the protocol and do one
//! acquire load.
//!
//! ## Implementations
//!
//! - [`MappedRecordTable`]: `records.dat`, persistent.
//! - [`HeapRecordTable`]: in-memory, for ephemeral stores and tests.

mod heap;
mod mapped;

pub use heap::HeapRecordTable;
pub use mapped::MappedRecordTable;

use bitflags::bitflags;
use eyre::Result;

use crate::error::StoreError;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RecordFlags: u32 {
        const DIRECTORY = 1 << 0;
        const SYMLINK = 1 << 1;
        const SPECIAL = 1 << 2;
        const HIDDEN = 1 << 3;
        const READ_ONLY = 1 << 4;
        /// The children list attribute reflects the directory's contents.
        const CHILDREN_CACHED = 1 << 5;
        /// Tombstone; the id is not a live entity.
        const FREE = 1 << 31;
    }
}

/// The mutable fields of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordFields {
    pub parent_id: u32,
    pub name_id: u32,
    pub flags: RecordFlags,
    pub length: i64,
    pub timestamp: i64,
    pub content_record_id: u32,
    pub attribute_record_id: u32,
}

/// A consistent copy of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSnapshot {
    pub id: u32,
    pub mod_count: u32,
    pub fields: RecordFields,
}

impl RecordSnapshot {
    pub fn is_free(&self) -> bool {
        self.fields.flags.contains(RecordFlags::FREE)
    }

    pub fn is_directory(&self) -> bool {
        self.fields.flags.contains(RecordFlags::DIRECTORY)
    }
}

/// Outcome of [`RecordStorage::verify`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordTableReport {
    pub allocated: u32,
    pub free: u32,
}

pub trait RecordStorage: Send + Sync {
    /// Allocates a zeroed record and returns its id.
    fn allocate_record(&self) -> Result<u32>;

    /// Number of ids handed out; valid ids are `1..=record_count()`.
    fn record_count(&self) -> u32;

    fn read_record(&self, id: u32) -> Result<RecordSnapshot>;

    /// Applies `mutator` to the record's fields and publishes the result as
    /// one unit, incrementing `mod_count`.
    fn update_record(
        &self,
        id: u32,
        mutator: &mut dyn FnMut(&mut RecordFields),
    ) -> Result<RecordSnapshot>;

    /// Swaps the attribute pointer when it still equals `expected`. Does not
    /// count as a metadata change, so `mod_count` is left alone.
    fn set_attribute_record_id_if(&self, id: u32, expected: u32, new: u32) -> Result<bool>;

    fn mod_count(&self, id: u32) -> Result<u32>;

    /// Total number of record updates since creation.
    fn global_mod_count(&self) -> u64;

    /// Checks every allocated record for torn writes.
    fn verify(&self) -> Result<RecordTableReport>;

    fn flush(&self) -> Result<()>;

    fn check_id(&self, id: u32) -> Result<()> {
        let allocated = self.record_count();
        if id == 0 || id > allocated {
            return Err(StoreError::InvalidEntityId { id, allocated }.into());
        }
        Ok(())
    }

    fn set_parent(&self, id: u32, parent_id: u32) -> Result<()> {
        self.update_record(id, &mut |f| f.parent_id = parent_id)?;
        Ok(())
    }

    fn set_name_id(&self, id: u32, name_id: u32) -> Result<()> {
        self.update_record(id, &mut |f| f.name_id = name_id)?;
        Ok(())
    }

    fn set_flags(&self, id: u32, flags: RecordFlags) -> Result<()> {
        self.update_record(id, &mut |f| f.flags = flags)?;
        Ok(())
    }

    fn set_length(&self, id: u32, length: i64) -> Result<()> {
        self.update_record(id, &mut |f| f.length = length)?;
        Ok(())
    }

    fn set_timestamp(&self, id: u32, timestamp: i64) -> Result<()> {
        self.update_record(id, &mut |f| f.timestamp = timestamp)?;
        Ok(())
    }

    fn set_content_record_id(&self, id: u32, content_record_id: u32) -> Result<()> {
        self.update_record(id, &mut |f| f.content_record_id = content_record_id)?;
        Ok(())
    }

    fn parent_id(&self, id: u32) -> Result<u32> {
        Ok(self.read_record(id)?.fields.parent_id)
    }

    fn name_id(&self, id: u32) -> Result<u32> {
        Ok(self.read_record(id)?.fields.name_id)
    }

    fn flags(&self, id: u32) -> Result<RecordFlags> {
        Ok(self.read_record(id)?.fields.flags)
    }

    fn length(&self, id: u32) -> Result<i64> {
        Ok(self.read_record(id)?.fields.length)
    }

    fn timestamp(&self, id: u32) -> Result<i64> {
        Ok(self.read_record(id)?.fields.timestamp)
    }

    fn content_record_id(&self, id: u32) -> Result<u32> {
        Ok(self.read_record(id)?.fields.content_record_id)
    }

    fn attribute_record_id(&self, id: u32) -> Result<u32> {
        Ok(self.read_record(id)?.fields.attribute_record_id)
    }

    /// Tombstones the record. Its id is not handed out again this session.
    fn mark_free(&self, id: u32) -> Result<()> {
        self.update_record(id, &mut |f| f.flags.insert(RecordFlags::FREE))?;
        Ok(())
    }

    fn is_free(&self, id: u32) -> Result<bool> {
        Ok(self.flags(id)?.contains(RecordFlags::FREE))
    }

    /// Visits every non-free record in id order until `visitor` returns
    /// `Ok(false)`.
    fn for_each_live(
        &self,
        visitor: &mut dyn FnMut(&RecordSnapshot) -> Result<bool>,
    ) -> Result<()> {
        for id in 1..=self.record_count() {
            let record = self.read_record(id)?;
            if record.is_free() {
                continue;
            }
            if !visitor(&record)? {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_kind, ErrorKind};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn implementations(dir: &std::path::Path) -> Vec<Arc<dyn RecordStorage>> {
        vec![
            Arc::new(MappedRecordTable::open_or_create(&dir.join("records.dat"), 1, false).unwrap()),
            Arc::new(HeapRecordTable::new()),
        ]
    }

    #[test]
    fn allocation_and_parent_scenario() {
        let dir = tempdir().unwrap();
        for records in implementations(dir.path()) {
            assert_eq!(records.allocate_record().unwrap(), 1);
            assert_eq!(records.allocate_record().unwrap(), 2);
            assert_eq!(records.allocate_record().unwrap(), 3);

            records.update_record(2, &mut |f| f.parent_id = 1).unwrap();
            assert_eq!(records.read_record(2).unwrap().fields.parent_id, 1);
            assert_eq!(records.parent_id(2).unwrap(), 1);
        }
    }

    #[test]
    fn invalid_ids_are_programming_errors() {
        let dir = tempdir().unwrap();
        for records in implementations(dir.path()) {
            records.allocate_record().unwrap();

            for id in [0, 2, u32::MAX] {
                let err = records.read_record(id).unwrap_err();
                assert_eq!(error_kind(&err), ErrorKind::Programming);
                assert!(records.set_length(id, 1).is_err());
            }
            assert_eq!(records.read_record(1).unwrap().mod_count, 0);
        }
    }

    #[test]
    fn setters_bump_mod_count() {
        let dir = tempdir().unwrap();
        for records in implementations(dir.path()) {
            let id = records.allocate_record().unwrap();
            let before = records.global_mod_count();

            records.set_name_id(id, 77).unwrap();
            records.set_flags(id, RecordFlags::DIRECTORY).unwrap();
            records.set_length(id, -5).unwrap();
            records.set_timestamp(id, 1_700_000_000_000).unwrap();
            records.set_content_record_id(id, 9).unwrap();

            let record = records.read_record(id).unwrap();
            assert_eq!(record.mod_count, 5);
            assert_eq!(records.mod_count(id).unwrap(), 5);
            assert_eq!(records.global_mod_count(), before + 5);
            assert_eq!(record.fields.name_id, 77);
            assert!(record.is_directory());
            assert_eq!(records.length(id).unwrap(), -5);
            assert_eq!(records.timestamp(id).unwrap(), 1_700_000_000_000);
            assert_eq!(records.content_record_id(id).unwrap(), 9);
        }
    }

    #[test]
    fn attribute_pointer_cas_leaves_mod_count() {
        let dir = tempdir().unwrap();
        for records in implementations(dir.path()) {
            let id = records.allocate_record().unwrap();

            assert!(records.set_attribute_record_id_if(id, 0, 40).unwrap());
            assert!(!records.set_attribute_record_id_if(id, 0, 41).unwrap());
            assert_eq!(records.attribute_record_id(id).unwrap(), 40);
            assert_eq!(records.mod_count(id).unwrap(), 0);
        }
    }

    #[test]
    fn mark_free_hides_from_live_scan() {
        let dir = tempdir().unwrap();
        for records in implementations(dir.path()) {
            for _ in 0..5 {
                records.allocate_record().unwrap();
            }
            records.mark_free(2).unwrap();
            records.mark_free(4).unwrap();

            let mut live = Vec::new();
            records
                .for_each_live(&mut |r| {
                    live.push(r.id);
                    Ok(true)
                })
                .unwrap();
            assert_eq!(live, vec![1, 3, 5]);
            assert!(records.is_free(2).unwrap());
            assert_eq!(records.allocate_record().unwrap(), 6);

            let report = records.verify().unwrap();
            assert_eq!(report, RecordTableReport { allocated: 6, free: 2 });
        }
    }

    #[test]
    fn concurrent_updates_never_mix_writers() {
        let dir = tempdir().unwrap();
        for records in implementations(dir.path()) {
            let id = records.allocate_record().unwrap();
            let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

            let writers: Vec<_> = (1..=4u32)
                .map(|w| {
                    let records = Arc::clone(&records);
                    std::thread::spawn(move || {
                        for i in 0..2_000u32 {
                            let tag = w * 1_000_000 + i;
                            records
                                .update_record(id, &mut |f| {
                                    f.parent_id = tag;
                                    f.name_id = tag;
                                    f.content_record_id = tag;
                                    f.attribute_record_id = tag;
                                    f.length = tag as i64;
                                    f.timestamp = -(tag as i64);
                                })
                                .unwrap();
                        }
                    })
                })
                .collect();
            let reader = {
                let records = Arc::clone(&records);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    let mut reads = 0u32;
                    while !stop.load(std::sync::atomic::Ordering::Relaxed) || reads == 0 {
                        let f = records.read_record(id).unwrap().fields;
                        assert_eq!(f.name_id, f.parent_id);
                        assert_eq!(f.content_record_id, f.parent_id);
                        assert_eq!(f.attribute_record_id, f.parent_id);
                        assert_eq!(f.length, f.parent_id as i64);
                        assert_eq!(f.timestamp, -(f.parent_id as i64));
                        reads += 1;
                    }
                })
            };
            for writer in writers {
                writer.join().unwrap();
            }
            stop.store(true, std::sync::atomic::Ordering::Relaxed);
            reader.join().unwrap();

            assert_eq!(records.mod_count(id).unwrap(), 8_000);
        }
    }

    #[test]
    fn concurrent_allocation_is_dense() {
        let dir = tempdir().unwrap();
        for records in implementations(dir.path()) {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let records = Arc::clone(&records);
                    std::thread::spawn(move || {
                        (0..500).map(|_| records.allocate_record().unwrap()).collect::<Vec<_>>()
                    })
                })
                .collect();
            let mut ids: Vec<u32> = handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect();
            ids.sort_unstable();
            assert_eq!(ids, (1..=2_000).collect::<Vec<u32>>());
        }
    }
}
