//! Record table held entirely on the heap.
//!
//! Each record sits behind its own mutex, so a snapshot is just a locked
//! copy; the outer lock is only taken for writing when the table grows.

use std::sync::atomic::{AtomicU64, Ordering};

use eyre::Result;
use parking_lot::{Mutex, RwLock};

use super::{RecordFields, RecordFlags, RecordSnapshot, RecordStorage, RecordTableReport};

#[derive(Debug, Default, Clone, Copy)]
struct HeapRecord {
    mod_count: u32,
    fields: RecordFields,
}

#[derive(Debug, Default)]
pub struct HeapRecordTable {
    records: RwLock<Vec<Mutex<HeapRecord>>>,
    global_mod_count: AtomicU64,
}

impl HeapRecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_record<R>(&self, id: u32, f: impl FnOnce(&mut HeapRecord) -> R) -> Result<R> {
        self.check_id(id)?;
        let records = self.records.read();
        let mut record = records[id as usize - 1].lock();
        Ok(f(&mut record))
    }
}

impl RecordStorage for HeapRecordTable {
    fn allocate_record(&self) -> Result<u32> {
        let mut records = self.records.write();
        records.push(Mutex::new(HeapRecord::default()));
        Ok(records.len() as u32)
    }

    fn record_count(&self) -> u32 {
        self.records.read().len() as u32
    }

    fn read_record(&self, id: u32) -> Result<RecordSnapshot> {
        self.with_record(id, |record| RecordSnapshot {
            id,
            mod_count: record.mod_count,
            fields: record.fields,
        })
    }

    fn update_record(
        &self,
        id: u32,
        mutator: &mut dyn FnMut(&mut RecordFields),
    ) -> Result<RecordSnapshot> {
        let snapshot = self.with_record(id, |record| {
            mutator(&mut record.fields);
            record.mod_count = record.mod_count.wrapping_add(1);
            RecordSnapshot {
                id,
                mod_count: record.mod_count,
                fields: record.fields,
            }
        })?;
        self.global_mod_count.fetch_add(1, Ordering::AcqRel);
        Ok(snapshot)
    }

    fn set_attribute_record_id_if(&self, id: u32, expected: u32, new: u32) -> Result<bool> {
        self.with_record(id, |record| {
            if record.fields.attribute_record_id != expected {
                return false;
            }
            record.fields.attribute_record_id = new;
            true
        })
    }

    fn mod_count(&self, id: u32) -> Result<u32> {
        self.with_record(id, |record| record.mod_count)
    }

    fn global_mod_count(&self) -> u64 {
        self.global_mod_count.load(Ordering::Acquire)
    }

    fn verify(&self) -> Result<RecordTableReport> {
        let records = self.records.read();
        Ok(RecordTableReport {
            allocated: records.len() as u32,
            free: records
                .iter()
                .filter(|r| r.lock().fields.flags.contains(RecordFlags::FREE))
                .count() as u32,
        })
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
