//! # Inverted Name Index
//!
//! Maps a name id to the set of live entities currently carrying it, for
//! "every file named X" queries. The facade calls
//! [`NameIndex::update_file_name`] on every create, rename and delete after
//! updating the record, so the index always agrees with the record table.
//!
//! ## Implementations
//!
//! | Type                  | Storage                          | At connect            |
//! |-----------------------|----------------------------------|-----------------------|
//! | [`InMemoryNameIndex`] | sharded `RoaringBitmap` sets     | rebuilt by full scan  |
//! | [`DurableNameIndex`]  | multi-valued `ExtendibleHashMap` | opened; rebuilt only  |
//! |                       | in `nameindex.map`               | after unclean shutdown|
//!
//! The in-memory scan can run on a background thread. Until it finishes,
//! queries block in [`NameIndex::await_ready`] while updates are applied
//! and remembered, then reconciled against the record table.

mod durable;
mod memory;

pub use durable::{DurableNameIndex, NAME_INDEX_FILE_NAME};
pub use memory::InMemoryNameIndex;

use eyre::Result;

use crate::records::{RecordSnapshot, RecordStorage};

pub trait NameIndex: Send + Sync {
    /// Moves `entity` from `old_name` to `new_name`. Either side may be 0
    /// for "no name" (creation and deletion).
    fn update_file_name(&self, entity: u32, old_name: u32, new_name: u32) -> Result<()>;

    /// Entities named `name_id`, ascending. Blocks until the index is ready.
    fn files_with_name(&self, name_id: u32) -> Result<Vec<u32>>;

    fn await_ready(&self) -> Result<()>;

    fn is_ready(&self) -> bool;

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Waits for background work to finish before the store shuts down.
    fn close(&self) -> Result<()> {
        self.await_ready()
    }
}

/// Name id the index should hold for a record, if any.
pub(crate) fn indexed_name(snapshot: &RecordSnapshot) -> Option<u32> {
    (!snapshot.is_free() && snapshot.fields.name_id != 0).then_some(snapshot.fields.name_id)
}

/// Calls `insert(name_id, entity)` for every live, named record.
pub(crate) fn scan_records(
    records: &dyn RecordStorage,
    mut insert: impl FnMut(u32, u32) -> Result<()>,
) -> Result<u64> {
    let mut indexed = 0;
    records.for_each_live(&mut |snapshot| {
        if let Some(name_id) = indexed_name(snapshot) {
            insert(name_id, snapshot.id)?;
            indexed += 1;
        }
        Ok(true)
    })?;
    Ok(indexed)
}
