//! Record table stored in `records.dat`.
//!
//! Header counter slots: 0 = allocated record count, 1 = global mod count.
//! Record `id` lives at `FILE_HEADER_SIZE + (id - 1) * RECORD_SIZE`.

use std::path::Path;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

use eyre::{Result, WrapErr};
use parking_lot::Mutex;

use super::{RecordFields, RecordFlags, RecordSnapshot, RecordStorage, RecordTableReport};
use crate::config::{
    FILE_HEADER_SIZE, MAX_TORN_READ_RETRIES, RECORDS_CHUNK_SIZE, RECORD_SIZE,
    RECORD_WRITE_STRIPES,
};
use crate::error::StoreError;
use crate::storage::{counter_offset, FileHeader, FileKind, MappedRegion};

const SLOT_COUNT: usize = 0;
const SLOT_MOD_COUNT: usize = 1;

const SEQ: u64 = 0;
const MOD_COUNT: u64 = 4;
const PARENT: u64 = 8;
const NAME: u64 = 12;
const FLAGS: u64 = 16;
const CONTENT: u64 = 20;
const LENGTH: u64 = 24;
const TIMESTAMP: u64 = 32;
const ATTRIBUTE: u64 = 40;

#[inline]
fn record_offset(id: u32) -> u64 {
    FILE_HEADER_SIZE as u64 + (id as u64 - 1) * RECORD_SIZE as u64
}

/// Atomic views of one record's words.
struct Slot<'a> {
    seq: &'a AtomicU32,
    mod_count: &'a AtomicU32,
    parent: &'a AtomicU32,
    name: &'a AtomicU32,
    flags: &'a AtomicU32,
    content: &'a AtomicU32,
    length: &'a AtomicU64,
    timestamp: &'a AtomicU64,
    attribute: &'a AtomicU32,
}

impl Slot<'_> {
    fn load(&self, order: Ordering) -> (u32, RecordFields) {
        let fields = RecordFields {
            parent_id: self.parent.load(order),
            name_id: self.name.load(order),
            flags: RecordFlags::from_bits_retain(self.flags.load(order)),
            length: self.length.load(order) as i64,
            timestamp: self.timestamp.load(order) as i64,
            content_record_id: self.content.load(order),
            attribute_record_id: self.attribute.load(order),
        };
        (self.mod_count.load(order), fields)
    }

    /// Stores every word inside a seqlock write section. The caller holds
    /// the record's stripe lock.
    fn publish(&self, mod_count: u32, fields: &RecordFields) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        self.mod_count.store(mod_count, Ordering::Relaxed);
        self.parent.store(fields.parent_id, Ordering::Relaxed);
        self.name.store(fields.name_id, Ordering::Relaxed);
        self.flags.store(fields.flags.bits(), Ordering::Relaxed);
        self.content.store(fields.content_record_id, Ordering::Relaxed);
        self.length.store(fields.length as u64, Ordering::Relaxed);
        self.timestamp.store(fields.timestamp as u64, Ordering::Relaxed);
        self.attribute
            .store(fields.attribute_record_id, Ordering::Relaxed);

        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }
}

pub struct MappedRecordTable {
    region: MappedRegion,
    stripes: Box<[Mutex<()>]>,
    alloc_lock: Mutex<Vec<u32>>,
    clean_at_open: bool,
}

impl std::fmt::Debug for MappedRecordTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRecordTable")
            .field("path", &self.region.path())
            .field("records", &self.record_count())
            .finish()
    }
}

impl MappedRecordTable {
    /// Opens or creates the table. With `reuse_freed_ids`, ids tombstoned in
    /// earlier sessions are handed out again before new ids are allocated.
    pub fn open_or_create(path: &Path, store_version: u32, reuse_freed_ids: bool) -> Result<Self> {
        let (region, clean_at_open) = if path.exists() {
            let (region, header) = MappedRegion::open(path, FileKind::Records, store_version)
                .wrap_err_with(|| format!("failed to open record table '{}'", path.display()))?;
            (region, header.was_clean_shutdown())
        } else {
            let header =
                FileHeader::new(FileKind::Records, store_version, 0, RECORDS_CHUNK_SIZE as u32);
            (MappedRegion::create(path, &header)?, true)
        };

        let table = Self {
            region,
            stripes: (0..RECORD_WRITE_STRIPES).map(|_| Mutex::new(())).collect(),
            alloc_lock: Mutex::new(Vec::new()),
            clean_at_open,
        };

        let count = table.record_count();
        let end = record_offset(count + 1);
        if end > table.region.len() {
            return Err(StoreError::RecordCorruption {
                path: path.to_path_buf(),
                reason: format!("{} records do not fit in {} bytes", count, table.region.len()),
            }
            .into());
        }

        if reuse_freed_ids {
            let mut freed = Vec::new();
            for id in (1..=count).rev() {
                if table.flags(id)?.contains(RecordFlags::FREE) {
                    freed.push(id);
                }
            }
            if !freed.is_empty() {
                tracing::debug!(count = freed.len(), "recycling freed record ids");
            }
            *table.alloc_lock.lock() = freed;
        }
        Ok(table)
    }

    pub fn was_clean_at_open(&self) -> bool {
        self.clean_at_open
    }

    pub fn set_clean_shutdown(&self, clean: bool) -> Result<()> {
        self.region.set_clean_shutdown(clean)
    }

    fn slot(&self, id: u32) -> Result<Slot<'_>> {
        self.check_id(id)?;
        let base = record_offset(id);
        let r = &self.region;
        Ok(Slot {
            seq: r.atomic_u32_at(base + SEQ)?,
            mod_count: r.atomic_u32_at(base + MOD_COUNT)?,
            parent: r.atomic_u32_at(base + PARENT)?,
            name: r.atomic_u32_at(base + NAME)?,
            flags: r.atomic_u32_at(base + FLAGS)?,
            content: r.atomic_u32_at(base + CONTENT)?,
            length: r.atomic_u64_at(base + LENGTH)?,
            timestamp: r.atomic_u64_at(base + TIMESTAMP)?,
            attribute: r.atomic_u32_at(base + ATTRIBUTE)?,
        })
    }

    #[inline]
    fn stripe(&self, id: u32) -> &Mutex<()> {
        &self.stripes[id as usize % self.stripes.len()]
    }

    fn field_u32(&self, id: u32, field: u64) -> Result<u32> {
        self.check_id(id)?;
        self.region.read_u32(record_offset(id) + field)
    }

    fn field_u64(&self, id: u32, field: u64) -> Result<u64> {
        self.check_id(id)?;
        self.region.read_u64(record_offset(id) + field)
    }
}

impl RecordStorage for MappedRecordTable {
    fn allocate_record(&self) -> Result<u32> {
        let mut freed = self.alloc_lock.lock();
        if let Some(id) = freed.pop() {
            let _stripe = self.stripe(id).lock();
            let slot = self.slot(id)?;
            let (mod_count, _) = slot.load(Ordering::Acquire);
            slot.publish(mod_count.wrapping_add(1), &RecordFields::default());
            self.region
                .fetch_add_u64(counter_offset(SLOT_MOD_COUNT), 1)?;
            return Ok(id);
        }

        let count = self.record_count();
        let id = count.checked_add(1).ok_or_else(|| {
            StoreError::InvalidArgument("record id space exhausted".into())
        })?;
        self.region
            .ensure_capacity(record_offset(id) + RECORD_SIZE as u64)
            .wrap_err_with(|| format!("failed to allocate record {}", id))?;
        self.region
            .write_u64(counter_offset(SLOT_COUNT), id as u64)?;
        Ok(id)
    }

    fn record_count(&self) -> u32 {
        self.region
            .read_u64(counter_offset(SLOT_COUNT))
            .map(|count| count as u32)
            .unwrap_or(0)
    }

    fn read_record(&self, id: u32) -> Result<RecordSnapshot> {
        let slot = self.slot(id)?;
        for attempt in 0..MAX_TORN_READ_RETRIES {
            let before = slot.seq.load(Ordering::Acquire);
            if before & 1 == 0 {
                let (mod_count, fields) = slot.load(Ordering::Relaxed);
                fence(Ordering::Acquire);
                if slot.seq.load(Ordering::Relaxed) == before {
                    return Ok(RecordSnapshot {
                        id,
                        mod_count,
                        fields,
                    });
                }
            }
            if attempt % 64 == 63 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        Err(StoreError::TornRead {
            id,
            retries: MAX_TORN_READ_RETRIES,
        }
        .into())
    }

    fn update_record(
        &self,
        id: u32,
        mutator: &mut dyn FnMut(&mut RecordFields),
    ) -> Result<RecordSnapshot> {
        let slot = self.slot(id)?;
        let _stripe = self.stripe(id).lock();

        let (mod_count, mut fields) = slot.load(Ordering::Acquire);
        mutator(&mut fields);
        let mod_count = mod_count.wrapping_add(1);
        slot.publish(mod_count, &fields);
        self.region
            .fetch_add_u64(counter_offset(SLOT_MOD_COUNT), 1)?;

        Ok(RecordSnapshot {
            id,
            mod_count,
            fields,
        })
    }

    fn set_attribute_record_id_if(&self, id: u32, expected: u32, new: u32) -> Result<bool> {
        let slot = self.slot(id)?;
        let _stripe = self.stripe(id).lock();

        let (mod_count, mut fields) = slot.load(Ordering::Acquire);
        if fields.attribute_record_id != expected {
            return Ok(false);
        }
        fields.attribute_record_id = new;
        slot.publish(mod_count, &fields);
        Ok(true)
    }

    fn mod_count(&self, id: u32) -> Result<u32> {
        self.field_u32(id, MOD_COUNT)
    }

    fn global_mod_count(&self) -> u64 {
        self.region
            .read_u64(counter_offset(SLOT_MOD_COUNT))
            .unwrap_or(0)
    }

    fn verify(&self) -> Result<RecordTableReport> {
        let mut report = RecordTableReport {
            allocated: self.record_count(),
            free: 0,
        };
        for id in 1..=report.allocated {
            if self.field_u32(id, SEQ)? & 1 == 1 {
                return Err(StoreError::RecordCorruption {
                    path: self.region.path().to_path_buf(),
                    reason: format!("record {} was left mid-write", id),
                }
                .into());
            }
            if self.flags(id)?.contains(RecordFlags::FREE) {
                report.free += 1;
            }
        }
        Ok(report)
    }

    fn flush(&self) -> Result<()> {
        self.region.flush()
    }

    fn parent_id(&self, id: u32) -> Result<u32> {
        self.field_u32(id, PARENT)
    }

    fn name_id(&self, id: u32) -> Result<u32> {
        self.field_u32(id, NAME)
    }

    fn flags(&self, id: u32) -> Result<RecordFlags> {
        Ok(RecordFlags::from_bits_retain(self.field_u32(id, FLAGS)?))
    }

    fn length(&self, id: u32) -> Result<i64> {
        Ok(self.field_u64(id, LENGTH)? as i64)
    }

    fn timestamp(&self, id: u32) -> Result<i64> {
        Ok(self.field_u64(id, TIMESTAMP)? as i64)
    }

    fn content_record_id(&self, id: u32) -> Result<u32> {
        self.field_u32(id, CONTENT)
    }

    fn attribute_record_id(&self, id: u32) -> Result<u32> {
        self.field_u32(id, ATTRIBUTE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_kind, store_error, ErrorKind};
    use tempfile::tempdir;

    #[test]
    fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.dat");
        {
            let table = MappedRecordTable::open_or_create(&path, 1, false).unwrap();
            for i in 1..=1_000u32 {
                let id = table.allocate_record().unwrap();
                table.set_parent(id, i - 1).unwrap();
            }
            table.flush().unwrap();
        }

        let table = MappedRecordTable::open_or_create(&path, 1, false).unwrap();
        assert_eq!(table.record_count(), 1_000);
        assert_eq!(table.parent_id(500).unwrap(), 499);
        assert_eq!(table.allocate_record().unwrap(), 1_001);
    }

    #[test]
    fn growth_crosses_chunks() {
        let dir = tempdir().unwrap();
        let table =
            MappedRecordTable::open_or_create(&dir.path().join("records.dat"), 1, false).unwrap();
        let per_chunk = (RECORDS_CHUNK_SIZE / RECORD_SIZE) as u32;

        for _ in 0..per_chunk + 10 {
            table.allocate_record().unwrap();
        }
        let last = table.record_count();
        table.set_timestamp(last, 123).unwrap();
        assert_eq!(table.timestamp(last).unwrap(), 123);
    }

    #[test]
    fn freed_ids_are_recycled_on_reopen_when_enabled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.dat");
        {
            let table = MappedRecordTable::open_or_create(&path, 1, true).unwrap();
            for _ in 0..4 {
                table.allocate_record().unwrap();
            }
            table.set_name_id(3, 12).unwrap();
            table.mark_free(3).unwrap();
            assert_eq!(table.allocate_record().unwrap(), 5);
        }

        let table = MappedRecordTable::open_or_create(&path, 1, true).unwrap();
        let id = table.allocate_record().unwrap();
        assert_eq!(id, 3);
        let record = table.read_record(3).unwrap();
        assert_eq!(record.fields, RecordFields::default());
        assert_eq!(record.mod_count, 3);
        assert_eq!(table.allocate_record().unwrap(), 6);
    }

    #[test]
    fn odd_sequence_is_reported_by_verify() {
        let dir = tempdir().unwrap();
        let table =
            MappedRecordTable::open_or_create(&dir.path().join("records.dat"), 1, false).unwrap();
        let id = table.allocate_record().unwrap();

        table.region.write_u32(record_offset(id) + SEQ, 7).unwrap();

        let err = table.verify().unwrap_err();
        assert!(matches!(
            store_error(&err),
            Some(StoreError::RecordCorruption { .. })
        ));
    }

    #[test]
    fn stuck_writer_is_torn_read() {
        let dir = tempdir().unwrap();
        let table =
            MappedRecordTable::open_or_create(&dir.path().join("records.dat"), 1, false).unwrap();
        let id = table.allocate_record().unwrap();

        table.region.write_u32(record_offset(id) + SEQ, 1).unwrap();

        let err = table.read_record(id).unwrap_err();
        assert!(matches!(store_error(&err), Some(StoreError::TornRead { .. })));
        assert_eq!(error_kind(&err), ErrorKind::Corruption);
    }

    #[test]
    fn version_mismatch_on_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.dat");
        MappedRecordTable::open_or_create(&path, 1, false).unwrap();

        let err = MappedRecordTable::open_or_create(&path, 2, false).unwrap_err();
        assert!(matches!(
            store_error(&err),
            Some(StoreError::VersionMismatch { .. })
        ));
    }
}
