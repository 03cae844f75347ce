//! # vfstore - Persistent File-System Metadata Store
//!
//! vfstore keeps the metadata of a virtual file system (entity records,
//! interned names, per-entity attributes, directory children and a
//! name-to-entities index) in a handful of memory-mapped files under one
//! storage root. It is built for hundreds of thousands to millions of
//! entities, read-mostly access from many threads, and fast reconnects.
//!
//! ## Quick Start
//!
//! ```ignore
//! use vfstore::{RecordFlags, VfsStore};
//!
//! let (store, init) = VfsStore::connect("./caches/vfs", 1)?;
//! if init.was_rebuilt() {
//!     // existing data was discarded; re-scan the real file system
//! }
//!
//! let root = store.create_root("project")?;
//! let src = store.create_child(root, "src", RecordFlags::DIRECTORY)?;
//! let main = store.create_child(src, "main.rs", RecordFlags::empty())?;
//! assert_eq!(store.path_of(main)?, "/project/src/main.rs");
//! assert_eq!(store.files_named("main.rs")?, vec![main]);
//!
//! store.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                VfsStore (store)                   │
//! ├────────────┬───────────────────┬─────────────────┤
//! │ NameCache  │ ChildrenAccessor  │ NameIndex       │
//! │ (cache)    │ (tree)            │ (index)         │
//! ├────────────┼───────────────────┤                 │
//! │ Enumerator │ AttributeStore    │                 │
//! │            │ (attributes)      │                 │
//! ├────────────┴───────────┬───────┴─────────────────┤
//! │ ExtendibleHashMap      │ RecordStorage (records) │
//! │ (hashmap)              │                         │
//! ├────────────────────────┴─────────────────────────┤
//! │        MappedRegion + file headers (storage)      │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! storage_root/
//! ├── .lock               # advisory lock held while connected
//! ├── records.dat         # fixed-width entity records
//! ├── names.log           # append-only name log
//! ├── names.map           # name hash -> name id
//! ├── attrkeys.log        # attribute key names
//! ├── attrkeys.map
//! ├── attributes.dat      # attribute blobs
//! ├── fastint.<id>.dat    # one per fast-int attribute
//! ├── nameindex.map       # only with the durable name index
//! └── corruption.marker   # only after mark_corrupted
//! ```
//!
//! Every data file starts with a 128-byte header carrying a magic, a format
//! version, the store version and a clean-shutdown flag. A version mismatch
//! or any detected corruption makes the next connect delete every data file
//! and start empty, reported through [`InitializationResult::rebuilt`].
//!
//! ## Errors
//!
//! All operations return `eyre::Result`. Typed failures are [`StoreError`]
//! values in the report chain, classified by [`error_kind`] into
//! programming errors, corruption and I/O.

pub mod attributes;
pub mod cache;
pub mod config;
pub mod encoding;
pub mod enumerator;
pub mod error;
pub mod hashmap;
pub mod index;
pub mod records;
pub mod storage;
pub mod store;
pub mod tree;

pub use attributes::{AttributeKey, AttributeStore, FastIntAttribute};
pub use cache::{NameCache, NameCachePolicy};
pub use enumerator::{DurableEnumerator, Enumerator, InMemoryEnumerator};
pub use error::{error_kind, store_error, ErrorKind, StoreError};
pub use hashmap::{ExtendibleHashMap, MapMode};
pub use index::NameIndex;
pub use records::{RecordFields, RecordFlags, RecordSnapshot, RecordStorage};
pub use store::{
    Backend, InitializationResult, NameIndexKind, RebuildReason, StoreBuilder, StoreStats,
    VfsStore,
};
pub use tree::{ChildEntry, ChildrenAccessor, ChildrenList};
