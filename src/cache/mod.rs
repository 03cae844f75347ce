//! # Name Cache
//!
//! A read-through cache of `name id -> string` in front of an
//! [`Enumerator`]. Names are immutable once enumerated, so entries never go
//! stale and there is no invalidation; the cache only trades memory for
//! fewer log reads and UTF-8 validations.
//!
//! ## Policies
//!
//! | Policy | Structure                     | Lookup | Suited to                   |
//! |--------|-------------------------------|--------|-----------------------------|
//! | `Mru`  | ring of recent ids per shard  | O(N)   | small hot working sets      |
//! | `Slru` | probation + protected segments| O(1)   | larger name cardinality     |
//!
//! Both are sharded `NAME_CACHE_SHARD_COUNT` ways by scrambled id:
//!
//! ```text
//! NameCache
//! ├── Shard 0:  RwLock<MruRing>   | Mutex<SlruShard>
//! ├── ...
//! └── Shard 15
//! ```
//!
//! The policy changes hit rates only; callers see identical results.

mod mru;
mod slru;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::{Mutex, RwLock};

use self::mru::MruRing;
use self::slru::SlruShard;
use crate::config::{
    DEFAULT_MRU_CAPACITY, DEFAULT_SLRU_PROBATION, DEFAULT_SLRU_PROTECTED,
    NAME_CACHE_SHARD_COUNT as SHARD_COUNT,
};
use crate::enumerator::Enumerator;
use crate::hashmap::scramble;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameCachePolicy {
    Mru { capacity: usize },
    Slru { probation: usize, protected: usize },
}

impl NameCachePolicy {
    pub fn slru() -> Self {
        Self::Slru {
            probation: DEFAULT_SLRU_PROBATION,
            protected: DEFAULT_SLRU_PROTECTED,
        }
    }
}

impl Default for NameCachePolicy {
    fn default() -> Self {
        Self::Mru {
            capacity: DEFAULT_MRU_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NameCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

enum Shards {
    Mru(Box<[RwLock<MruRing>]>),
    Slru(Box<[Mutex<SlruShard>]>),
}

fn per_shard(total: usize) -> usize {
    total.div_ceil(SHARD_COUNT).max(1)
}

pub struct NameCache {
    enumerator: Arc<dyn Enumerator>,
    policy: NameCachePolicy,
    shards: Shards,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for NameCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameCache")
            .field("policy", &self.policy)
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish()
    }
}

impl NameCache {
    pub fn new(enumerator: Arc<dyn Enumerator>, policy: NameCachePolicy) -> Result<Self> {
        let shards = match policy {
            NameCachePolicy::Mru { capacity } => {
                ensure!(capacity > 0, "MRU name cache capacity must be positive");
                let per_shard = per_shard(capacity);
                Shards::Mru(
                    (0..SHARD_COUNT)
                        .map(|_| RwLock::new(MruRing::new(per_shard)))
                        .collect(),
                )
            }
            NameCachePolicy::Slru {
                probation,
                protected,
            } => {
                ensure!(
                    probation > 0 && protected > 0,
                    "SLRU name cache segments must be positive (probation {}, protected {})",
                    probation,
                    protected
                );
                let (probation, protected) = (per_shard(probation), per_shard(protected));
                Shards::Slru(
                    (0..SHARD_COUNT)
                        .map(|_| Mutex::new(SlruShard::new(probation, protected)))
                        .collect(),
                )
            }
        };
        Ok(Self {
            enumerator,
            policy,
            shards,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn enumerator(&self) -> &Arc<dyn Enumerator> {
        &self.enumerator
    }

    pub fn policy(&self) -> NameCachePolicy {
        self.policy
    }

    #[inline]
    fn shard_index(id: u32) -> usize {
        scramble(id) as usize % SHARD_COUNT
    }

    fn cached(&self, id: u32) -> Option<Arc<str>> {
        let index = Self::shard_index(id);
        match &self.shards {
            Shards::Mru(shards) => shards[index].read().get(id),
            Shards::Slru(shards) => shards[index].lock().get(id),
        }
    }

    fn remember(&self, id: u32, value: Arc<str>) {
        let index = Self::shard_index(id);
        match &self.shards {
            Shards::Mru(shards) => shards[index].write().insert(id, value),
            Shards::Slru(shards) => shards[index].lock().insert(id, value),
        }
    }

    /// Resolves `id`, reading through to the enumerator on a miss.
    pub fn value_of(&self, id: u32) -> Result<Arc<str>> {
        if let Some(value) = self.cached(id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let value: Arc<str> = Arc::from(self.enumerator.value_of(id)?);
        self.remember(id, Arc::clone(&value));
        Ok(value)
    }

    pub fn enumerate(&self, value: &str) -> Result<u32> {
        let id = self.enumerator.enumerate(value)?;
        self.prime(id, value);
        Ok(id)
    }

    pub fn try_enumerate(&self, value: &str) -> Result<Option<u32>> {
        let id = self.enumerator.try_enumerate(value)?;
        if let Some(id) = id {
            self.prime(id, value);
        }
        Ok(id)
    }

    /// Case-insensitive enumerators return the first-seen spelling, which
    /// may differ from `value`, so only exact enumerators are primed.
    fn prime(&self, id: u32, value: &str) {
        if self.enumerator.is_case_sensitive() && self.cached(id).is_none() {
            self.remember(id, Arc::from(value));
        }
    }

    pub fn stats(&self) -> NameCacheStats {
        let entries = match &self.shards {
            Shards::Mru(shards) => shards.iter().map(|s| s.read().len()).sum(),
            Shards::Slru(shards) => shards.iter().map(|s| s.lock().len()).sum(),
        };
        NameCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }

    pub fn clear(&self) {
        match &self.shards {
            Shards::Mru(shards) => shards.iter().for_each(|s| s.write().clear()),
            Shards::Slru(shards) => shards.iter().for_each(|s| s.lock().clear()),
        }
    }
}
