//! # Store Facade
//!
//! [`VfsStore`] owns one storage root and wires the components together:
//!
//! ```text
//!                    ┌──────────────────────────────┐
//!                    │           VfsStore           │
//!                    └──┬─────────┬─────────┬───────┘
//!          ┌────────────┘         │         └──────────────┐
//!   ┌──────▼──────┐      ┌────────▼───────┐       ┌─────────▼────────┐
//!   │ NameCache   │      │ChildrenAccessor│       │ NameIndex        │
//!   └──────┬──────┘      └───┬────────────┘       └─────────┬────────┘
//!   ┌──────▼──────┐      ┌───▼────────────┐                 │
//!   │ Enumerator  │      │ AttributeStore │                 │
//!   └──────┬──────┘      └───┬────────────┘                 │
//!   ┌──────▼─────────┐   ┌───▼────────────────────────────────▼┐
//!   │ExtendibleHashMap│  │        RecordStorage                 │
//!   └──────┬─────────┘   └───┬──────────────────────────────────┘
//!          └───────┬─────────┘
//!            MappedRegion
//! ```
//!
//! Components are picked at connect time from [`StoreBuilder`] options; the
//! facade only talks to them through their traits.
//!
//! ## Hierarchy
//!
//! Roots are directory records with parent 0. Every other entity is created
//! under a directory with [`VfsStore::create_child`], which updates the
//! record, the parent's children list and the name index together. Sibling
//! names are unique.
//!
//! ## Lifecycle
//!
//! [`VfsStore::close`] flushes every file, marks headers clean and releases
//! the root lock. It is idempotent and also runs on drop. Every other
//! operation on a closed store fails with `StoreClosed`.

mod builder;
mod connect;
mod hierarchy;
mod lifecycle;

pub use builder::{Backend, NameIndexKind, StoreBuilder};
pub use connect::{CORRUPTION_MARKER_FILE_NAME, RECORDS_FILE_NAME};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use parking_lot::Mutex;
use tempfile::TempDir;

use self::builder::StoreOptions;
use self::connect::{Components, DurableParts};
use crate::attributes::{AttributeStats, AttributeStore};
use crate::cache::{NameCache, NameCacheStats};
use crate::error::StoreError;
use crate::index::{DurableNameIndex, NameIndex};
use crate::records::{RecordStorage, RecordTableReport};
use crate::storage::RootLock;
use crate::tree::ChildrenAccessor;

/// Why connect discarded the existing data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildReason {
    VersionMismatch { found: u32, expected: u32 },
    Corruption(String),
    /// `corruption.marker` was present, holding this reason.
    CorruptionMarker(String),
    UncleanShutdown,
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebuildReason::VersionMismatch { found, expected } => {
                write!(f, "version mismatch (found {}, expected {})", found, expected)
            }
            RebuildReason::Corruption(reason) => write!(f, "corruption: {}", reason),
            RebuildReason::CorruptionMarker(reason) => {
                write!(f, "marked corrupted: {}", reason)
            }
            RebuildReason::UncleanShutdown => write!(f, "unclean shutdown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializationResult {
    /// No store existed at the root.
    pub created: bool,
    /// Set when existing data was discarded; callers should re-index.
    pub rebuilt: Option<RebuildReason>,
    /// The previous session did not close the store.
    pub unclean_shutdown: bool,
    pub elapsed: Duration,
}

impl InitializationResult {
    pub fn was_rebuilt(&self) -> bool {
        self.rebuilt.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub records: RecordTableReport,
    pub names: u64,
    pub global_mod_count: u64,
    pub attributes: AttributeStats,
    pub name_cache: NameCacheStats,
}

pub struct VfsStore {
    root: PathBuf,
    options: StoreOptions,
    records: Arc<dyn RecordStorage>,
    names: Arc<NameCache>,
    attributes: Arc<AttributeStore>,
    children: ChildrenAccessor,
    index: Arc<dyn NameIndex>,
    durable: Option<DurableParts>,
    durable_index: Option<Arc<DurableNameIndex>>,
    directory_moves: Mutex<()>,
    lock: Mutex<Option<RootLock>>,
    closed: AtomicBool,
    _scratch: Option<TempDir>,
}

impl fmt::Debug for VfsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VfsStore")
            .field("root", &self.root)
            .field("backend", &self.options.backend)
            .field("records", &self.records.record_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl VfsStore {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    /// Opens the store at `root` with default options, creating it if
    /// needed and rebuilding it when its files are from another version or
    /// corrupted.
    pub fn connect<P: AsRef<Path>>(
        root: P,
        expected_version: u32,
    ) -> Result<(Self, InitializationResult)> {
        Self::builder()
            .path(root)
            .expected_version(expected_version)
            .open()
    }

    fn assemble(
        root: PathBuf,
        options: StoreOptions,
        components: Components,
        index: Arc<dyn NameIndex>,
        durable_index: Option<Arc<DurableNameIndex>>,
        lock: Option<RootLock>,
        scratch: Option<TempDir>,
    ) -> Result<Self> {
        let Components {
            records,
            names,
            attributes,
            durable,
        } = components;
        let names = Arc::new(NameCache::new(names, options.name_cache)?);
        let children = ChildrenAccessor::new(Arc::clone(&records), Arc::clone(&attributes));
        Ok(Self {
            root,
            options,
            records,
            names,
            attributes,
            children,
            index,
            durable,
            durable_index,
            directory_moves: Mutex::new(()),
            lock: Mutex::new(lock),
            closed: AtomicBool::new(false),
            _scratch: scratch,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn expected_version(&self) -> u32 {
        self.options.expected_version
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::StoreClosed.into());
        }
        Ok(())
    }

    pub fn records(&self) -> &Arc<dyn RecordStorage> {
        &self.records
    }

    pub fn names(&self) -> &Arc<NameCache> {
        &self.names
    }

    pub fn attributes(&self) -> &Arc<AttributeStore> {
        &self.attributes
    }

    pub fn children(&self) -> &ChildrenAccessor {
        &self.children
    }

    pub fn name_index(&self) -> &Arc<dyn NameIndex> {
        &self.index
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.names.enumerator().is_case_sensitive()
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.ensure_open()?;
        Ok(StoreStats {
            records: self.records.verify()?,
            names: self.names.enumerator().len()?,
            global_mod_count: self.records.global_mod_count(),
            attributes: self.attributes.stats()?,
            name_cache: self.names.stats(),
        })
    }
}
