//! # Connect
//!
//! ```text
//! connect(root, version)
//!   ├─ create root, flock <root>/.lock
//!   ├─ corruption.marker present?          ─> wipe data files, rebuild
//!   ├─ open records, names, attribute keys, attributes
//!   │    └─ corruption / version mismatch  ─> wipe data files, rebuild
//!   ├─ any header not marked clean?
//!   │    ├─ rebuild_on_unclean_shutdown    ─> wipe, rebuild
//!   │    └─ otherwise verify + repair      ─> corruption: wipe, rebuild
//!   ├─ mark every header dirty
//!   └─ open or rebuild the name index
//! ```
//!
//! Rebuilding always deletes every data file and starts empty; nothing is
//! partially repaired across files. I/O failures are returned, never
//! rebuilt over.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use eyre::{Result, WrapErr};

use super::builder::{Backend, NameIndexKind, StoreOptions};
use super::{InitializationResult, RebuildReason, VfsStore};
use crate::attributes::{AttributeStore, ATTRIBUTES_FILE_NAME};
use crate::enumerator::{DurableEnumerator, Enumerator, InMemoryEnumerator};
use crate::error::{error_kind, store_error, ErrorKind, StoreError};
use crate::index::{DurableNameIndex, InMemoryNameIndex, NameIndex, NAME_INDEX_FILE_NAME};
use crate::records::{HeapRecordTable, MappedRecordTable, RecordStorage};
use crate::storage::RootLock;

pub const RECORDS_FILE_NAME: &str = "records.dat";
pub const CORRUPTION_MARKER_FILE_NAME: &str = "corruption.marker";
pub(crate) const NAMES_STEM: &str = "names";
pub(crate) const ATTRIBUTE_KEYS_STEM: &str = "attrkeys";

/// Concrete handles of a mapped store, kept for shutdown bookkeeping.
pub(super) struct DurableParts {
    pub records: Arc<MappedRecordTable>,
    pub names: Arc<DurableEnumerator>,
    pub attribute_keys: Arc<DurableEnumerator>,
}

impl DurableParts {
    fn was_clean(&self, attributes: &AttributeStore) -> bool {
        self.records.was_clean_at_open()
            && self.names.was_clean_at_open()
            && self.attribute_keys.was_clean_at_open()
            && attributes.was_clean_at_open()
    }

    fn verify(&self, attributes: &AttributeStore) -> Result<()> {
        let report = self.records.verify()?;
        self.names.verify()?;
        self.attribute_keys.verify()?;
        let blobs = attributes.verify()?;
        tracing::info!(
            records = report.allocated,
            free = report.free,
            blobs,
            "verified store after unclean shutdown"
        );
        Ok(())
    }

    pub fn set_clean_shutdown(&self, clean: bool) -> Result<()> {
        self.records.set_clean_shutdown(clean)?;
        self.names.set_clean_shutdown(clean)?;
        self.attribute_keys.set_clean_shutdown(clean)
    }

    pub fn flush(&self) -> Result<()> {
        self.records.flush()?;
        self.names.flush()?;
        self.attribute_keys.flush()
    }
}

pub(super) struct Components {
    pub records: Arc<dyn RecordStorage>,
    pub names: Arc<dyn Enumerator>,
    pub attributes: Arc<AttributeStore>,
    pub durable: Option<DurableParts>,
}

fn is_data_file(name: &str) -> bool {
    const FIXED: [&str; 7] = [
        RECORDS_FILE_NAME,
        "names.log",
        "names.map",
        "attrkeys.log",
        "attrkeys.map",
        ATTRIBUTES_FILE_NAME,
        NAME_INDEX_FILE_NAME,
    ];
    FIXED.contains(&name)
        || name == CORRUPTION_MARKER_FILE_NAME
        || (name.starts_with("fastint.") && name.ends_with(".dat"))
}

/// Deletes every file the store owns under `root`, leaving the lock file
/// and anything foreign in place.
pub(super) fn wipe(root: &Path) -> Result<usize> {
    let mut removed = 0;
    let entries = fs::read_dir(root).map_err(|e| StoreError::io(root, "list root", e))?;
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(root, "list root", e))?;
        let name = entry.file_name();
        if name.to_str().is_some_and(is_data_file) {
            let path = entry.path();
            fs::remove_file(&path).map_err(|e| StoreError::io(&path, "remove", e))?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn read_marker(root: &Path) -> Result<Option<String>> {
    let path = root.join(CORRUPTION_MARKER_FILE_NAME);
    if !path.exists() {
        return Ok(None);
    }
    let reason = fs::read_to_string(&path).map_err(|e| StoreError::io(&path, "read marker", e))?;
    let reason = reason.trim();
    Ok(Some(if reason.is_empty() {
        "unspecified".to_string()
    } else {
        reason.to_string()
    }))
}

fn rebuild_reason(err: &eyre::Report) -> RebuildReason {
    match store_error(err) {
        Some(StoreError::VersionMismatch {
            found, expected, ..
        }) => RebuildReason::VersionMismatch {
            found: *found,
            expected: *expected,
        },
        _ => RebuildReason::Corruption(format!("{:#}", err)),
    }
}

fn open_mapped_components(root: &Path, options: &StoreOptions) -> Result<Components> {
    let version = options.expected_version;
    let records_path = root.join(RECORDS_FILE_NAME);
    if records_path.exists() {
        for stem in [NAMES_STEM, ATTRIBUTE_KEYS_STEM] {
            for path in [
                DurableEnumerator::log_path(root, stem),
                DurableEnumerator::map_path(root, stem),
            ] {
                if !path.exists() {
                    return Err(StoreError::HeaderMismatch {
                        path,
                        reason: "file is missing from an existing store".into(),
                    }
                    .into());
                }
            }
        }
    }

    let records = Arc::new(MappedRecordTable::open_or_create(
        &records_path,
        version,
        options.reuse_freed_ids,
    )?);
    let names = Arc::new(DurableEnumerator::open_or_create(
        root,
        NAMES_STEM,
        version,
        options.case_sensitive_names,
    )?);
    if names.is_case_sensitive() != options.case_sensitive_names {
        tracing::debug!(
            case_sensitive = names.is_case_sensitive(),
            "keeping name case sensitivity the store was created with"
        );
    }
    let attribute_keys = Arc::new(DurableEnumerator::open_or_create(
        root,
        ATTRIBUTE_KEYS_STEM,
        version,
        true,
    )?);
    let attributes = Arc::new(AttributeStore::open_or_create(
        root,
        version,
        Arc::clone(&records) as Arc<dyn RecordStorage>,
        Arc::clone(&attribute_keys) as Arc<dyn Enumerator>,
    )?);

    Ok(Components {
        records: Arc::clone(&records) as Arc<dyn RecordStorage>,
        names: Arc::clone(&names) as Arc<dyn Enumerator>,
        attributes,
        durable: Some(DurableParts {
            records,
            names,
            attribute_keys,
        }),
    })
}

/// Opens the components, rebuilding from scratch on corruption.
fn open_or_rebuild(
    root: &Path,
    options: &StoreOptions,
    rebuilt: &mut Option<RebuildReason>,
) -> Result<Components> {
    match open_mapped_components(root, options) {
        Ok(components) => Ok(components),
        Err(err) if error_kind(&err) == ErrorKind::Corruption => {
            let reason = rebuild_reason(&err);
            tracing::warn!(root = %root.display(), %reason, "storage corrupted, rebuilding");
            wipe(root)?;
            *rebuilt = Some(reason);
            open_mapped_components(root, options)
                .wrap_err("failed to initialize store after rebuild")
        }
        Err(err) => Err(err),
    }
}

fn open_name_index(
    root: &Path,
    options: &StoreOptions,
    records: &Arc<dyn RecordStorage>,
    must_rebuild: bool,
) -> Result<(Arc<dyn NameIndex>, Option<Arc<DurableNameIndex>>)> {
    match options.name_index {
        NameIndexKind::InMemory { background } => Ok((
            Arc::new(InMemoryNameIndex::build(Arc::clone(records), background)?),
            None,
        )),
        NameIndexKind::Durable => {
            let path = root.join(NAME_INDEX_FILE_NAME);
            let version = options.expected_version;
            let rebuild = || DurableNameIndex::rebuild(&path, version, records.as_ref());

            let index = if must_rebuild || !path.exists() {
                rebuild()?
            } else {
                match DurableNameIndex::open_or_create(&path, version) {
                    Ok(index) if index.was_clean_at_open() => index,
                    Ok(index) => {
                        drop(index);
                        rebuild()?
                    }
                    Err(err) if error_kind(&err) == ErrorKind::Corruption => {
                        tracing::warn!(error = %format!("{:#}", err), "name index corrupted");
                        rebuild()?
                    }
                    Err(err) => return Err(err),
                }
            };
            index.set_clean_shutdown(false)?;
            let index = Arc::new(index);
            Ok((Arc::clone(&index) as Arc<dyn NameIndex>, Some(index)))
        }
    }
}

impl VfsStore {
    pub(super) fn connect_with(options: StoreOptions) -> Result<(Self, InitializationResult)> {
        match options.backend {
            Backend::Mapped => Self::connect_mapped(options),
            Backend::InMemory => Self::connect_in_memory(options),
        }
    }

    fn connect_mapped(options: StoreOptions) -> Result<(Self, InitializationResult)> {
        let started = Instant::now();
        let root = options.path.clone().ok_or_else(|| {
            StoreError::InvalidArgument("a mapped store needs a storage root path".into())
        })?;
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, "create root", e))?;
        let lock = RootLock::acquire(&root)?;

        let created = !root.join(RECORDS_FILE_NAME).exists();
        let mut rebuilt = None;
        if let Some(reason) = read_marker(&root)? {
            tracing::warn!(root = %root.display(), %reason, "storage corrupted, rebuilding");
            wipe(&root)?;
            rebuilt = Some(RebuildReason::CorruptionMarker(reason));
        }

        let mut components = open_or_rebuild(&root, &options, &mut rebuilt)?;

        let mut unclean_shutdown = false;
        if let Some(parts) = &components.durable {
            if rebuilt.is_none() && !created && !parts.was_clean(&components.attributes) {
                unclean_shutdown = true;
                tracing::warn!(root = %root.display(), "store was not closed cleanly");
                let failure = if options.rebuild_on_unclean_shutdown {
                    Some(RebuildReason::UncleanShutdown)
                } else {
                    match parts.verify(&components.attributes) {
                        Ok(()) => None,
                        Err(err) if error_kind(&err) == ErrorKind::Corruption => {
                            Some(rebuild_reason(&err))
                        }
                        Err(err) => return Err(err),
                    }
                };
                if let Some(reason) = failure {
                    tracing::warn!(root = %root.display(), %reason, "storage corrupted, rebuilding");
                    drop(components);
                    wipe(&root)?;
                    rebuilt = Some(reason);
                    components = open_mapped_components(&root, &options)
                        .wrap_err("failed to initialize store after rebuild")?;
                }
            }
        }

        if let Some(parts) = &components.durable {
            parts.set_clean_shutdown(false)?;
        }
        components.attributes.set_clean_shutdown(false)?;

        let (index, durable_index) = open_name_index(
            &root,
            &options,
            &components.records,
            unclean_shutdown || rebuilt.is_some(),
        )?;

        let result = InitializationResult {
            created,
            rebuilt,
            unclean_shutdown,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            root = %root.display(),
            created,
            rebuilt = result.rebuilt.is_some(),
            records = components.records.record_count(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "connected store"
        );
        let store = Self::assemble(
            root,
            options,
            components,
            index,
            durable_index,
            Some(lock),
            None,
        )?;
        Ok((store, result))
    }

    fn connect_in_memory(options: StoreOptions) -> Result<(Self, InitializationResult)> {
        let started = Instant::now();
        let scratch = tempfile::Builder::new()
            .prefix("vfstore-")
            .tempdir()
            .wrap_err("failed to create scratch directory for in-memory store")?;
        let root = scratch.path().to_path_buf();

        let records: Arc<dyn RecordStorage> = Arc::new(HeapRecordTable::new());
        let names: Arc<dyn Enumerator> =
            Arc::new(InMemoryEnumerator::new(options.case_sensitive_names));
        let attributes = Arc::new(AttributeStore::open_or_create(
            &root,
            options.expected_version,
            Arc::clone(&records),
            Arc::new(InMemoryEnumerator::new(true)),
        )?);
        let components = Components {
            records,
            names,
            attributes,
            durable: None,
        };
        let (index, durable_index) = open_name_index(&root, &options, &components.records, true)?;

        let result = InitializationResult {
            created: true,
            rebuilt: None,
            unclean_shutdown: false,
            elapsed: started.elapsed(),
        };
        tracing::info!("connected in-memory store");
        let store = Self::assemble(
            root,
            options,
            components,
            index,
            durable_index,
            None,
            Some(scratch),
        )?;
        Ok((store, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_files_are_recognised() {
        for name in [
            "records.dat",
            "names.log",
            "attrkeys.map",
            "fastint.17.dat",
            "corruption.marker",
            "nameindex.map",
        ] {
            assert!(is_data_file(name), "{}", name);
        }
        for name in [".lock", "notes.txt", "fastint.17.bak"] {
            assert!(!is_data_file(name), "{}", name);
        }
    }

    #[test]
    fn wipe_keeps_lock_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["records.dat", "names.log", ".lock", "notes.txt"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }

        assert_eq!(wipe(dir.path()).unwrap(), 2);
        assert!(dir.path().join(".lock").exists());
        assert!(dir.path().join("notes.txt").exists());
        assert!(!dir.path().join("records.dat").exists());
    }

    #[test]
    fn empty_marker_has_a_reason() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_marker(dir.path()).unwrap(), None);
        fs::write(dir.path().join(CORRUPTION_MARKER_FILE_NAME), b"\n").unwrap();
        assert_eq!(read_marker(dir.path()).unwrap().as_deref(), Some("unspecified"));
    }
}
