//! # Attribute Store
//!
//! Variable-length values keyed by `(entity, attribute key)`, kept in one
//! append-only blob area (`attributes.dat`). Every entity with attributes
//! owns a directory blob listing `(key id, blob pointer)` pairs; the
//! record's `attribute_record_id` points at the current directory.
//!
//! ## Write Path
//!
//! ```text
//! stripe(entity).lock()
//!   append value blob ──────────────┐
//!   append new directory blob ──────┤  (both unreachable so far)
//!   CAS record.attribute_record_id ─┘  old dir -> new dir (publish)
//! ```
//!
//! Readers load the directory pointer once and follow it, so they see the
//! whole old value or the whole new one. Replaced blobs stay in place and
//! are counted as garbage in [`AttributeStats`].
//!
//! ## Keys
//!
//! An [`AttributeKey`] is a name plus a version. Names are interned through
//! the attribute key enumerator, and the version is stored in every blob; a
//! value written under another version reads as absent, which lets a
//! producer change its encoding by bumping the version.
//!
//! ## Fast-Int Attributes
//!
//! [`AttributeStore::specialize_as_fast_int`] returns a
//! [`FastIntAttribute`]: a flat u32 array indexed by entity, with CAS
//! updates and no blob overhead.

mod blob;
mod fast_int;
mod stream;

pub use fast_int::FastIntAttribute;
pub use stream::{AttributeReader, AttributeWriter};

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use self::blob::{BlobHeader, BLOB_HEADER_SIZE, CRC32C, DIRECTORY_KEY};
use crate::config::{
    ATTRIBUTES_CHUNK_SIZE, ATTRIBUTE_WRITE_STRIPES, FILE_HEADER_SIZE, MAX_ATTRIBUTE_SIZE,
};
use crate::enumerator::Enumerator;
use crate::error::StoreError;
use crate::records::RecordStorage;
use crate::storage::{self, counter_offset, FileHeader, FileKind, MappedRegion};

const SLOT_TAIL: usize = 0;
const SLOT_GARBAGE: usize = 1;
const SLOT_BLOBS: usize = 2;

pub const ATTRIBUTES_FILE_NAME: &str = "attributes.dat";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributeKey {
    name: String,
    version: u32,
}

impl AttributeKey {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttributeStats {
    pub blobs: u64,
    pub total_bytes: u64,
    pub garbage_bytes: u64,
}

impl AttributeStats {
    pub fn live_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.garbage_bytes)
    }
}

pub struct AttributeStore {
    root: PathBuf,
    store_version: u32,
    region: MappedRegion,
    records: Arc<dyn RecordStorage>,
    keys: Arc<dyn Enumerator>,
    key_ids: RwLock<HashMap<String, u32>>,
    stripes: Box<[Mutex<()>]>,
    fast_ints: Mutex<HashMap<u32, Arc<FastIntAttribute>>>,
    clean_at_open: bool,
}

impl std::fmt::Debug for AttributeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeStore")
            .field("path", &self.region.path())
            .finish()
    }
}

impl AttributeStore {
    pub fn open_or_create(
        root: &Path,
        store_version: u32,
        records: Arc<dyn RecordStorage>,
        keys: Arc<dyn Enumerator>,
    ) -> Result<Self> {
        let path = root.join(ATTRIBUTES_FILE_NAME);
        let header = FileHeader::new(
            FileKind::Attributes,
            store_version,
            0,
            ATTRIBUTES_CHUNK_SIZE as u32,
        );
        let (region, opened, created) =
            storage::open_or_create(&path, &header, FileKind::Attributes, store_version)
                .wrap_err_with(|| format!("failed to open attribute store '{}'", path.display()))?;
        if created {
            region.write_u64(counter_offset(SLOT_TAIL), FILE_HEADER_SIZE as u64)?;
        }
        let clean_at_open = created || opened.was_clean_shutdown();

        let store = Self {
            root: root.to_path_buf(),
            store_version,
            region,
            records,
            keys,
            key_ids: RwLock::new(HashMap::new()),
            stripes: (0..ATTRIBUTE_WRITE_STRIPES)
                .map(|_| Mutex::new(()))
                .collect(),
            fast_ints: Mutex::new(HashMap::new()),
            clean_at_open,
        };
        let tail = store.tail()?;
        if tail < FILE_HEADER_SIZE as u64 || tail > store.region.len() {
            return Err(store.corruption(format!("blob tail {} is invalid", tail)));
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        self.region.path()
    }

    pub fn was_clean_at_open(&self) -> bool {
        self.clean_at_open
    }

    fn corruption(&self, reason: String) -> eyre::Report {
        StoreError::AttributeCorruption {
            path: self.region.path().to_path_buf(),
            reason,
        }
        .into()
    }

    fn tail(&self) -> Result<u64> {
        self.region.read_u64(counter_offset(SLOT_TAIL))
    }

    #[inline]
    fn stripe(&self, entity: u32) -> &Mutex<()> {
        &self.stripes[entity as usize % self.stripes.len()]
    }

    fn check_key(key: &AttributeKey) -> Result<()> {
        if key.name.is_empty() {
            return Err(StoreError::InvalidAttributeKey("empty key name".into()).into());
        }
        Ok(())
    }

    /// Key id for `key`, interning the name on first use.
    fn resolve(&self, key: &AttributeKey) -> Result<u32> {
        Self::check_key(key)?;
        if let Some(id) = self.key_ids.read().get(key.name.as_str()) {
            return Ok(*id);
        }
        let id = self
            .keys
            .enumerate(&key.name)
            .wrap_err_with(|| format!("failed to register attribute key '{}'", key.name))?;
        self.key_ids.write().insert(key.name.clone(), id);
        Ok(id)
    }

    /// Key id for `key` if it was ever written.
    fn known_key(&self, key: &AttributeKey) -> Result<Option<u32>> {
        Self::check_key(key)?;
        if let Some(id) = self.key_ids.read().get(key.name.as_str()) {
            return Ok(Some(*id));
        }
        self.keys.try_enumerate(&key.name)
    }

    fn blob(&self, pointer: u32, entity: u32, key_id: u32) -> Result<(BlobHeader, Cow<'_, [u8]>)> {
        let offset = pointer as u64 * 8;
        let tail = self.tail()?;
        if offset < FILE_HEADER_SIZE as u64 || offset + BLOB_HEADER_SIZE as u64 > tail {
            return Err(self.corruption(format!(
                "blob pointer {} of entity {} is outside the blob area",
                pointer, entity
            )));
        }

        let mut raw = [0u8; BLOB_HEADER_SIZE];
        self.region.read_bytes(offset, &mut raw)?;
        let Some(header) = BlobHeader::decode(&raw) else {
            return Err(self.corruption(format!("bad blob magic at pointer {}", pointer)));
        };
        if header.entity != entity || header.key != key_id {
            return Err(self.corruption(format!(
                "blob {} belongs to ({}, {}), expected ({}, {})",
                pointer, header.entity, header.key, entity, key_id
            )));
        }

        let start = offset + BLOB_HEADER_SIZE as u64;
        let len = header.len as usize;
        if start + len as u64 > tail {
            return Err(self.corruption(format!("blob {} overruns the blob area", pointer)));
        }
        let data = match self.region.slice(start, len) {
            Some(view) => Cow::Borrowed(view),
            None => {
                let mut buf = vec![0u8; len];
                self.region.read_bytes(start, &mut buf)?;
                Cow::Owned(buf)
            }
        };
        if CRC32C.checksum(&data) != header.crc {
            return Err(self.corruption(format!("blob {} fails its checksum", pointer)));
        }
        Ok((header, data))
    }

    fn blob_size(&self, pointer: u32) -> Result<u64> {
        let len = self.region.read_u32(pointer as u64 * 8 + 4)?;
        Ok(blob::stored_size(len as usize))
    }

    fn directory(&self, entity: u32, pointer: u32) -> Result<Vec<(u32, u32)>> {
        if pointer == 0 {
            return Ok(Vec::new());
        }
        let (_, payload) = self.blob(pointer, entity, DIRECTORY_KEY)?;
        blob::decode_directory(&payload).ok_or_else(|| {
            self.corruption(format!("directory of entity {} is malformed", entity))
        })
    }

    fn append(&self, entity: u32, key_id: u32, version: u32, payload: &[u8]) -> Result<u32> {
        let encoded = blob::encode(entity, key_id, version, payload);
        let offset = self
            .region
            .fetch_add_u64(counter_offset(SLOT_TAIL), encoded.len() as u64)?;
        let pointer = u32::try_from(offset / 8).map_err(|_| StoreError::RegionFull {
            path: self.region.path().to_path_buf(),
            limit: u32::MAX as u64 * 8,
        })?;
        self.region
            .ensure_capacity(offset + encoded.len() as u64)?;
        self.region.write_bytes(offset, &encoded)?;
        self.region.fetch_add_u64(counter_offset(SLOT_BLOBS), 1)?;
        Ok(pointer)
    }

    /// Writes the directory and swings the record's pointer to it. Called
    /// with the entity's stripe held.
    fn publish_directory(
        &self,
        entity: u32,
        old_pointer: u32,
        entries: &[(u32, u32)],
        mut garbage: u64,
    ) -> Result<()> {
        let new_pointer = if entries.is_empty() {
            0
        } else {
            self.append(entity, DIRECTORY_KEY, 0, &blob::encode_directory(entries))?
        };
        if old_pointer != 0 {
            garbage += self.blob_size(old_pointer)?;
        }
        if !self
            .records
            .set_attribute_record_id_if(entity, old_pointer, new_pointer)?
        {
            return Err(self.corruption(format!(
                "attribute directory of entity {} changed outside the attribute store",
                entity
            )));
        }
        if garbage > 0 {
            self.region
                .fetch_add_u64(counter_offset(SLOT_GARBAGE), garbage)?;
        }
        Ok(())
    }

    fn find(&self, entity: u32, key_id: u32) -> Result<Option<u32>> {
        let pointer = self.records.attribute_record_id(entity)?;
        let entries = self.directory(entity, pointer)?;
        Ok(entries
            .binary_search_by_key(&key_id, |(key, _)| *key)
            .ok()
            .map(|index| entries[index].1))
    }

    /// Returns a writer whose bytes replace the value on commit.
    pub fn write_attribute(&self, entity: u32, key: &AttributeKey) -> AttributeWriter<'_> {
        AttributeWriter::new(self, entity, key.clone())
    }

    pub fn write_attribute_bytes(&self, entity: u32, key: &AttributeKey, bytes: &[u8]) -> Result<()> {
        if bytes.len() > MAX_ATTRIBUTE_SIZE {
            return Err(StoreError::InvalidArgument(format!(
                "attribute '{}' of {} bytes exceeds {} bytes",
                key.name,
                bytes.len(),
                MAX_ATTRIBUTE_SIZE
            ))
            .into());
        }
        self.records.check_id(entity)?;
        let key_id = self.resolve(key)?;

        let _stripe = self.stripe(entity).lock();
        let pointer = self.records.attribute_record_id(entity)?;
        let mut entries = self.directory(entity, pointer)?;
        let value = self
            .append(entity, key_id, key.version, bytes)
            .wrap_err_with(|| format!("failed to write attribute '{}' of {}", key.name, entity))?;

        let mut garbage = 0;
        match entries.binary_search_by_key(&key_id, |(key, _)| *key) {
            Ok(index) => {
                garbage += self.blob_size(entries[index].1)?;
                entries[index].1 = value;
            }
            Err(index) => entries.insert(index, (key_id, value)),
        }
        self.publish_directory(entity, pointer, &entries, garbage)
    }

    pub fn read_attribute(&self, entity: u32, key: &AttributeKey) -> Result<Option<AttributeReader<'_>>> {
        let Some(key_id) = self.known_key(key)? else {
            self.records.check_id(entity)?;
            return Ok(None);
        };
        let Some(pointer) = self.find(entity, key_id)? else {
            return Ok(None);
        };
        let (header, data) = self.blob(pointer, entity, key_id)?;
        if header.version != key.version {
            return Ok(None);
        }
        Ok(Some(AttributeReader::new(data)))
    }

    /// Hands `accessor` a view of the stored bytes, borrowed from the mapping
    /// when the blob lies within one chunk.
    pub fn read_attribute_raw<R>(
        &self,
        entity: u32,
        key: &AttributeKey,
        accessor: impl FnOnce(&[u8]) -> R,
    ) -> Result<Option<R>> {
        Ok(self
            .read_attribute(entity, key)?
            .map(|reader| accessor(reader.remaining())))
    }

    pub fn has_attribute(&self, entity: u32, key: &AttributeKey) -> Result<bool> {
        Ok(self.read_attribute_raw(entity, key, |_| ())?.is_some())
    }

    /// Removes the value. Returns whether one was present.
    pub fn delete_attribute(&self, entity: u32, key: &AttributeKey) -> Result<bool> {
        self.records.check_id(entity)?;
        let Some(key_id) = self.known_key(key)? else {
            return Ok(false);
        };

        let _stripe = self.stripe(entity).lock();
        let pointer = self.records.attribute_record_id(entity)?;
        let mut entries = self.directory(entity, pointer)?;
        let Ok(index) = entries.binary_search_by_key(&key_id, |(key, _)| *key) else {
            return Ok(false);
        };
        let (_, value) = entries.remove(index);
        let garbage = self.blob_size(value)?;
        self.publish_directory(entity, pointer, &entries, garbage)?;
        Ok(true)
    }

    /// Drops every attribute of `entity`.
    pub fn delete_all(&self, entity: u32) -> Result<()> {
        self.records.check_id(entity)?;
        let _stripe = self.stripe(entity).lock();
        let pointer = self.records.attribute_record_id(entity)?;
        if pointer == 0 {
            return Ok(());
        }
        let mut garbage = 0;
        for (_, value) in self.directory(entity, pointer)? {
            garbage += self.blob_size(value)?;
        }
        self.publish_directory(entity, pointer, &[], garbage)
    }

    pub fn specialize_as_fast_int(&self, key: &AttributeKey) -> Result<Arc<FastIntAttribute>> {
        let key_id = self.resolve(key)?;
        let mut fast_ints = self.fast_ints.lock();
        if let Some(existing) = fast_ints.get(&key_id) {
            return Ok(Arc::clone(existing));
        }
        let attribute = Arc::new(
            FastIntAttribute::open_or_create(
                &self.root,
                &key.name,
                key_id,
                key.version,
                self.store_version,
                Arc::clone(&self.records),
            )
            .wrap_err_with(|| format!("failed to open fast-int attribute '{}'", key.name))?,
        );
        fast_ints.insert(key_id, Arc::clone(&attribute));
        Ok(attribute)
    }

    pub fn stats(&self) -> Result<AttributeStats> {
        Ok(AttributeStats {
            blobs: self.region.read_u64(counter_offset(SLOT_BLOBS))?,
            total_bytes: self.tail()? - FILE_HEADER_SIZE as u64,
            garbage_bytes: self.region.read_u64(counter_offset(SLOT_GARBAGE))?,
        })
    }

    /// Reads every reachable blob, checking headers and checksums. Returns
    /// the number of values checked.
    pub fn verify(&self) -> Result<u64> {
        let mut checked = 0;
        for entity in 1..=self.records.record_count() {
            let pointer = self.records.attribute_record_id(entity)?;
            for (key_id, value) in self.directory(entity, pointer)? {
                self.blob(value, entity, key_id)?;
                checked += 1;
            }
        }
        Ok(checked)
    }

    pub fn flush(&self) -> Result<()> {
        self.region.flush()?;
        for attribute in self.fast_ints.lock().values() {
            attribute.flush()?;
        }
        Ok(())
    }

    pub fn set_clean_shutdown(&self, clean: bool) -> Result<()> {
        self.region.set_clean_shutdown(clean)?;
        for attribute in self.fast_ints.lock().values() {
            attribute.set_clean_shutdown(clean)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enumerator::InMemoryEnumerator;
    use crate::error::{error_kind, ErrorKind};
    use crate::records::{HeapRecordTable, MappedRecordTable};
    use std::io::{Read, Write};
    use tempfile::tempdir;

    fn store(root: &Path, entities: u32) -> AttributeStore {
        let records = Arc::new(HeapRecordTable::new());
        for _ in 0..entities {
            records.allocate_record().unwrap();
        }
        AttributeStore::open_or_create(root, 1, records, Arc::new(InMemoryEnumerator::new(true)))
            .unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let attrs = store(dir.path(), 3);
        let key = AttributeKey::new("content.hash", 1);

        attrs.write_attribute_bytes(2, &key, b"abcdef").unwrap();

        let mut reader = attrs.read_attribute(2, &key).unwrap().unwrap();
        let mut back = Vec::new();
        reader.read_to_end(&mut back).unwrap();
        assert_eq!(back, b"abcdef");
        assert!(attrs.read_attribute(1, &key).unwrap().is_none());
    }

    #[test]
    fn absent_is_none_not_error() {
        let dir = tempdir().unwrap();
        let attrs = store(dir.path(), 1);

        let never_written = AttributeKey::new("never", 1);
        assert!(attrs.read_attribute(1, &never_written).unwrap().is_none());
        assert!(!attrs.has_attribute(1, &never_written).unwrap());
        assert!(!attrs.delete_attribute(1, &never_written).unwrap());
    }

    #[test]
    fn invalid_entity_and_key_are_programming_errors() {
        let dir = tempdir().unwrap();
        let attrs = store(dir.path(), 1);

        let err = attrs
            .write_attribute_bytes(9, &AttributeKey::new("k", 1), b"x")
            .unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Programming);

        let err = attrs
            .write_attribute_bytes(1, &AttributeKey::new("", 1), b"x")
            .unwrap_err();
        assert!(matches!(
            crate::error::store_error(&err),
            Some(StoreError::InvalidAttributeKey(_))
        ));
    }

    #[test]
    fn overwrite_replaces_and_counts_garbage() {
        let dir = tempdir().unwrap();
        let attrs = store(dir.path(), 1);
        let key = AttributeKey::new("k", 1);

        attrs.write_attribute_bytes(1, &key, b"first").unwrap();
        attrs.write_attribute_bytes(1, &key, b"second value").unwrap();

        let value = attrs.read_attribute_raw(1, &key, |bytes| bytes.to_vec()).unwrap();
        assert_eq!(value.as_deref(), Some(&b"second value"[..]));
        let stats = attrs.stats().unwrap();
        assert!(stats.garbage_bytes > 0);
        assert!(stats.live_bytes() < stats.total_bytes);
    }

    #[test]
    fn several_keys_per_entity() {
        let dir = tempdir().unwrap();
        let attrs = store(dir.path(), 1);
        let keys: Vec<AttributeKey> = (0..10).map(|i| AttributeKey::new(format!("k{}", i), 1)).collect();

        for (i, key) in keys.iter().enumerate() {
            attrs.write_attribute_bytes(1, key, &[i as u8; 3]).unwrap();
        }
        assert!(attrs.delete_attribute(1, &keys[4]).unwrap());

        for (i, key) in keys.iter().enumerate() {
            let value = attrs.read_attribute_raw(1, key, |b| b.to_vec()).unwrap();
            if i == 4 {
                assert!(value.is_none());
            } else {
                assert_eq!(value.unwrap(), vec![i as u8; 3]);
            }
        }
        assert_eq!(attrs.verify().unwrap(), 9);
    }

    #[test]
    fn version_mismatch_reads_as_absent() {
        let dir = tempdir().unwrap();
        let attrs = store(dir.path(), 1);

        attrs
            .write_attribute_bytes(1, &AttributeKey::new("encoded", 1), b"v1")
            .unwrap();

        assert!(attrs
            .read_attribute(1, &AttributeKey::new("encoded", 2))
            .unwrap()
            .is_none());
        assert!(attrs
            .read_attribute(1, &AttributeKey::new("encoded", 1))
            .unwrap()
            .is_some());
    }

    #[test]
    fn dropped_writer_keeps_previous_value() {
        let dir = tempdir().unwrap();
        let attrs = store(dir.path(), 1);
        let key = AttributeKey::new("k", 1);
        attrs.write_attribute_bytes(1, &key, b"old").unwrap();

        {
            let mut writer = attrs.write_attribute(1, &key);
            writer.write_all(b"never committed").unwrap();
        }
        assert_eq!(
            attrs.read_attribute(1, &key).unwrap().unwrap().into_bytes(),
            b"old"
        );

        let mut writer = attrs.write_attribute(1, &key);
        writer.write_all(b"new ").unwrap();
        writer.write_all(b"value").unwrap();
        writer.commit().unwrap();
        assert_eq!(
            attrs.read_attribute(1, &key).unwrap().unwrap().into_bytes(),
            b"new value"
        );
    }

    #[test]
    fn large_values_span_chunks() {
        let dir = tempdir().unwrap();
        let attrs = store(dir.path(), 2);
        let key = AttributeKey::new("big", 1);
        let big: Vec<u8> = (0..ATTRIBUTES_CHUNK_SIZE + 1000).map(|i| (i % 251) as u8).collect();

        attrs.write_attribute_bytes(1, &key, &big).unwrap();
        attrs.write_attribute_bytes(2, &key, &big).unwrap();

        for entity in [1, 2] {
            let back = attrs.read_attribute(entity, &key).unwrap().unwrap().into_bytes();
            assert_eq!(back, big);
        }
    }

    #[test]
    fn delete_all_clears_directory() {
        let dir = tempdir().unwrap();
        let attrs = store(dir.path(), 1);
        attrs.write_attribute_bytes(1, &AttributeKey::new("a", 1), b"1").unwrap();
        attrs.write_attribute_bytes(1, &AttributeKey::new("b", 1), b"2").unwrap();

        attrs.delete_all(1).unwrap();

        assert_eq!(attrs.records.attribute_record_id(1).unwrap(), 0);
        assert!(!attrs.has_attribute(1, &AttributeKey::new("a", 1)).unwrap());
    }

    #[test]
    fn values_persist_across_reopen() {
        let dir = tempdir().unwrap();
        let key = AttributeKey::new("persisted", 3);
        let keys_dir = tempdir().unwrap();
        let open = || {
            let records: Arc<dyn RecordStorage> = Arc::new(
                MappedRecordTable::open_or_create(&dir.path().join("records.dat"), 1, false)
                    .unwrap(),
            );
            let keys: Arc<dyn Enumerator> = Arc::new(
                crate::enumerator::DurableEnumerator::open_or_create(keys_dir.path(), "attrkeys", 1, true)
                    .unwrap(),
            );
            (
                Arc::clone(&records),
                AttributeStore::open_or_create(dir.path(), 1, records, keys).unwrap(),
            )
        };
        {
            let (records, attrs) = open();
            records.allocate_record().unwrap();
            attrs.write_attribute_bytes(1, &key, b"durable").unwrap();
            attrs.flush().unwrap();
            records.flush().unwrap();
        }

        let (_, attrs) = open();
        let value = attrs.read_attribute_raw(1, &key, |b| b.to_vec()).unwrap();
        assert_eq!(value.unwrap(), b"durable");
    }

    #[test]
    fn fast_int_get_set_update() {
        let dir = tempdir().unwrap();
        let attrs = store(dir.path(), 3);
        let counter = attrs
            .specialize_as_fast_int(&AttributeKey::new("counter", 1))
            .unwrap();

        assert_eq!(counter.get(2).unwrap(), 0);
        counter.set(3, 41).unwrap();
        assert_eq!(counter.update(3, |v| v + 1).unwrap(), 42);
        assert_eq!(counter.get(3).unwrap(), 42);
        assert!(counter.get(0).is_err());

        let again = attrs
            .specialize_as_fast_int(&AttributeKey::new("counter", 1))
            .unwrap();
        assert!(Arc::ptr_eq(&counter, &again));
    }

    #[test]
    fn fast_int_rejects_unallocated_entities() {
        let dir = tempdir().unwrap();
        let attrs = store(dir.path(), 2);
        let counter = attrs
            .specialize_as_fast_int(&AttributeKey::new("counter", 1))
            .unwrap();

        for entity in [0, 3, 5_000_000] {
            let err = counter.get(entity).unwrap_err();
            assert_eq!(error_kind(&err), ErrorKind::Programming);
            assert_eq!(
                error_kind(&counter.set(entity, 1).unwrap_err()),
                ErrorKind::Programming
            );
            assert_eq!(
                error_kind(&counter.update(entity, |v| v + 1).unwrap_err()),
                ErrorKind::Programming
            );
        }
        assert_eq!(counter.get(2).unwrap(), 0);

        attrs.records.allocate_record().unwrap();
        counter.set(3, 9).unwrap();
        assert_eq!(counter.get(3).unwrap(), 9);
    }

    #[test]
    fn fast_int_concurrent_updates_do_not_lose_increments() {
        let dir = tempdir().unwrap();
        let attrs = store(dir.path(), 7);
        let counter = attrs
            .specialize_as_fast_int(&AttributeKey::new("hits", 1))
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        counter.update(7, |v| v + 1).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.get(7).unwrap(), 8_000);
    }

    #[test]
    fn concurrent_writers_on_distinct_keys_keep_all_values() {
        let dir = tempdir().unwrap();
        let attrs = Arc::new(store(dir.path(), 4));

        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let attrs = Arc::clone(&attrs);
                std::thread::spawn(move || {
                    let key = AttributeKey::new(format!("writer-{}", t), 1);
                    for round in 0..50u32 {
                        let entity = round % 4 + 1;
                        attrs
                            .write_attribute_bytes(entity, &key, &round.to_le_bytes())
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for t in 0..8u32 {
            let key = AttributeKey::new(format!("writer-{}", t), 1);
            for entity in 1..=4u32 {
                let value = attrs.read_attribute_raw(entity, &key, |b| b.to_vec()).unwrap();
                let last_round = (0..50u32).filter(|r| r % 4 + 1 == entity).max().unwrap();
                assert_eq!(value.unwrap(), last_round.to_le_bytes());
            }
        }
    }

    #[test]
    fn reader_sees_whole_values_while_same_key_is_overwritten() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let dir = tempdir().unwrap();
        let attrs = store(dir.path(), 1);
        let key = AttributeKey::new("payload", 1);
        attrs.write_attribute_bytes(1, &key, &[0u8; 4096]).unwrap();
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for round in 1..=250u32 {
                    let len = 1024 + (round as usize % 7) * 512;
                    attrs
                        .write_attribute_bytes(1, &key, &vec![round as u8; len])
                        .unwrap();
                }
                done.store(true, Ordering::Release);
            });
            scope.spawn(|| {
                let mut reads = 0u32;
                while !done.load(Ordering::Acquire) || reads == 0 {
                    let (first, uniform, len) = attrs
                        .read_attribute_raw(1, &key, |bytes| {
                            let first = bytes[0];
                            (first, bytes.iter().all(|b| *b == first), bytes.len())
                        })
                        .unwrap()
                        .unwrap();
                    assert!(uniform, "value of length {} mixes writes", len);
                    assert!(first == 0 || len == 1024 + (first as usize % 7) * 512);
                    reads += 1;
                }
            });
        });

        let last = attrs.read_attribute_raw(1, &key, |b| b.to_vec()).unwrap().unwrap();
        assert_eq!(last, vec![250u8; 1024 + (250 % 7) * 512]);
    }
}
