//! Single-integer attributes stored as a flat array.
//!
//! `fastint.<key id>.dat` holds one u32 per entity at
//! `FILE_HEADER_SIZE + entity * 4`. There is no blob header and no
//! directory; a missing value reads as 0, and ids are checked against the
//! record table like every other per-entity call. Counter slot 0 records the key
//! version the array was written under, and a file from another version is
//! reset on open.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::Result;

use crate::config::{DEFAULT_CHUNK_SIZE, FILE_HEADER_SIZE};
use crate::records::RecordStorage;
use crate::storage::{counter_offset, FileHeader, FileKind, MappedRegion};

const SLOT_KEY_VERSION: usize = 0;

pub struct FastIntAttribute {
    name: String,
    region: MappedRegion,
    records: Arc<dyn RecordStorage>,
}

impl std::fmt::Debug for FastIntAttribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastIntAttribute")
            .field("name", &self.name)
            .field("path", &self.region.path())
            .finish()
    }
}

impl FastIntAttribute {
    pub fn path(root: &Path, key_id: u32) -> PathBuf {
        root.join(format!("fastint.{}.dat", key_id))
    }

    pub(super) fn open_or_create(
        root: &Path,
        name: &str,
        key_id: u32,
        key_version: u32,
        store_version: u32,
        records: Arc<dyn RecordStorage>,
    ) -> Result<Self> {
        let path = Self::path(root, key_id);
        if path.exists() {
            let (region, _) = MappedRegion::open(&path, FileKind::FastInt, store_version)?;
            if region.read_u64(counter_offset(SLOT_KEY_VERSION))? == key_version as u64 {
                return Ok(Self {
                    name: name.to_string(),
                    region,
                    records,
                });
            }
            tracing::debug!(
                attribute = name,
                version = key_version,
                "resetting fast-int attribute written under another version"
            );
        }

        let header = FileHeader::new(
            FileKind::FastInt,
            store_version,
            0,
            DEFAULT_CHUNK_SIZE as u32,
        );
        let region = MappedRegion::create(&path, &header)?;
        region.write_u64(counter_offset(SLOT_KEY_VERSION), key_version as u64)?;
        Ok(Self {
            name: name.to_string(),
            region,
            records,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn offset(&self, entity: u32) -> Result<u64> {
        self.records.check_id(entity)?;
        Ok(FILE_HEADER_SIZE as u64 + entity as u64 * 4)
    }

    pub fn get(&self, entity: u32) -> Result<u32> {
        let offset = self.offset(entity)?;
        if offset + 4 > self.region.len() {
            return Ok(0);
        }
        self.region.read_u32(offset)
    }

    pub fn set(&self, entity: u32, value: u32) -> Result<()> {
        let offset = self.offset(entity)?;
        self.region.ensure_capacity(offset + 4)?;
        self.region.write_u32(offset, value)
    }

    /// Atomically replaces the value with `f(old)` and returns the new value.
    pub fn update(&self, entity: u32, mut f: impl FnMut(u32) -> u32) -> Result<u32> {
        let offset = self.offset(entity)?;
        self.region.ensure_capacity(offset + 4)?;
        loop {
            let current = self.region.read_u32(offset)?;
            let new = f(current);
            if self.region.compare_and_swap_u32(offset, current, new)? {
                return Ok(new);
            }
            std::hint::spin_loop();
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.region.flush()
    }

    pub fn set_clean_shutdown(&self, clean: bool) -> Result<()> {
        self.region.set_clean_shutdown(clean)
    }
}
