//! # Store Builder
//!
//! Fluent configuration for [`VfsStore`]. Every option has a default, so
//! `VfsStore::builder().path(root).open()` is a complete call.
//!
//! ## Options
//!
//! | Option                        | Default                | Notes                                  |
//! |-------------------------------|------------------------|----------------------------------------|
//! | `path`                        | required (mapped only) | storage root directory                 |
//! | `expected_version`            | 1                      | mismatch rebuilds the store            |
//! | `case_sensitive_names`        | true                   | fixed when the store is first created  |
//! | `backend`                     | `Mapped`               | `InMemory` keeps nothing after close   |
//! | `name_cache`                  | `Mru { 4096 }`         | see [`NameCachePolicy`]                |
//! | `name_index`                  | `InMemory { false }`   | `Durable` persists `nameindex.map`     |
//! | `reuse_freed_ids`             | false                  | recycle ids freed in earlier sessions  |
//! | `rebuild_on_unclean_shutdown` | false                  | otherwise verify and repair            |

use std::path::{Path, PathBuf};

use eyre::Result;

use super::{InitializationResult, VfsStore};
use crate::cache::NameCachePolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Mapped,
    /// Heap records and enumerators; attribute blobs in a scratch directory
    /// removed on drop.
    InMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameIndexKind {
    /// Rebuilt from the record table at every connect, on a background
    /// thread when `background` is set.
    InMemory { background: bool },
    Durable,
}

impl Default for NameIndexKind {
    fn default() -> Self {
        Self::InMemory { background: false }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StoreOptions {
    pub path: Option<PathBuf>,
    pub expected_version: u32,
    pub case_sensitive_names: bool,
    pub backend: Backend,
    pub name_cache: NameCachePolicy,
    pub name_index: NameIndexKind,
    pub reuse_freed_ids: bool,
    pub rebuild_on_unclean_shutdown: bool,
}

pub struct StoreBuilder {
    options: StoreOptions,
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self {
            options: StoreOptions {
                path: None,
                expected_version: 1,
                case_sensitive_names: true,
                backend: Backend::Mapped,
                name_cache: NameCachePolicy::default(),
                name_index: NameIndexKind::default(),
                reuse_freed_ids: false,
                rebuild_on_unclean_shutdown: false,
            },
        }
    }

    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.options.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Version the caller's data format expects. Files written under any
    /// other version are discarded at connect.
    pub fn expected_version(mut self, version: u32) -> Self {
        self.options.expected_version = version;
        self
    }

    /// Takes effect only when the store is created; an existing store keeps
    /// the sensitivity it was created with.
    pub fn case_sensitive_names(mut self, case_sensitive: bool) -> Self {
        self.options.case_sensitive_names = case_sensitive;
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.options.backend = backend;
        self
    }

    pub fn in_memory(self) -> Self {
        self.backend(Backend::InMemory)
    }

    pub fn name_cache(mut self, policy: NameCachePolicy) -> Self {
        self.options.name_cache = policy;
        self
    }

    pub fn name_index(mut self, kind: NameIndexKind) -> Self {
        self.options.name_index = kind;
        self
    }

    pub fn reuse_freed_ids(mut self, reuse: bool) -> Self {
        self.options.reuse_freed_ids = reuse;
        self
    }

    pub fn rebuild_on_unclean_shutdown(mut self, rebuild: bool) -> Self {
        self.options.rebuild_on_unclean_shutdown = rebuild;
        self
    }

    pub fn open(self) -> Result<(VfsStore, InitializationResult)> {
        VfsStore::connect_with(self.options)
    }
}
