//! Name index persisted as a multi-valued extendible hash map
//! (`name id -> entity id`).
//!
//! A rename adds the entity under its new name before removing it from the
//! old one, so a reader may briefly see it under both names but never under
//! neither. Reads sort and dedup.

use std::path::Path;
use std::time::Instant;

use eyre::{Result, WrapErr};

use super::{scan_records, NameIndex};
use crate::error::StoreError;
use crate::hashmap::{ExtendibleHashMap, MapMode};
use crate::records::RecordStorage;

pub const NAME_INDEX_FILE_NAME: &str = "nameindex.map";

#[derive(Debug)]
pub struct DurableNameIndex {
    map: ExtendibleHashMap,
}

impl DurableNameIndex {
    pub fn open_or_create(path: &Path, store_version: u32) -> Result<Self> {
        let map = ExtendibleHashMap::open_or_create(path, store_version, MapMode::Multi)
            .wrap_err_with(|| format!("failed to open name index '{}'", path.display()))?;
        Ok(Self { map })
    }

    /// Recreates the index file from the record table.
    pub fn rebuild(path: &Path, store_version: u32, records: &dyn RecordStorage) -> Result<Self> {
        let started = Instant::now();
        tracing::info!(path = %path.display(), "rebuilding durable name index");
        if path.exists() {
            std::fs::remove_file(path)
                .map_err(|err| StoreError::io(path, "remove name index", err))?;
        }
        let map = ExtendibleHashMap::create(path, store_version, MapMode::Multi)?;
        let indexed = scan_records(records, |name_id, entity| map.append(name_id, entity))?;
        tracing::info!(
            entities = indexed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "durable name index rebuilt"
        );
        Ok(Self { map })
    }

    pub fn was_clean_at_open(&self) -> bool {
        self.map.was_clean_at_open()
    }

    pub fn verify(&self) -> Result<()> {
        self.map.verify().map(|_| ())
    }

    pub fn set_clean_shutdown(&self, clean: bool) -> Result<()> {
        self.map.set_clean_shutdown(clean)
    }
}

impl NameIndex for DurableNameIndex {
    fn update_file_name(&self, entity: u32, old_name: u32, new_name: u32) -> Result<()> {
        if old_name == new_name {
            return Ok(());
        }
        if new_name != 0 {
            self.map.append(new_name, entity)?;
        }
        if old_name != 0 {
            self.map.remove(old_name, entity)?;
        }
        Ok(())
    }

    fn files_with_name(&self, name_id: u32) -> Result<Vec<u32>> {
        if name_id == 0 {
            return Ok(Vec::new());
        }
        let mut entities = self.map.get_all(name_id)?;
        entities.sort_unstable();
        entities.dedup();
        Ok(entities)
    }

    fn await_ready(&self) -> Result<()> {
        Ok(())
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn flush(&self) -> Result<()> {
        self.map.flush()
    }
}
