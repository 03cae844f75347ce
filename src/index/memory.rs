//! In-memory name index rebuilt from the record table at connect.
//!
//! ```text
//! build(background) ─┬─ scan records, insert (name, entity)
//!                    │     updates meanwhile: applied + remembered
//!                    └─ under the build lock: reconcile remembered
//!                       entities against their current record, mark ready
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use eyre::{eyre, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use roaring::RoaringBitmap;
use smallvec::SmallVec;

use super::{indexed_name, scan_records, NameIndex};
use crate::config::NAME_INDEX_SHARD_COUNT as SHARD_COUNT;
use crate::records::RecordStorage;

#[derive(Default)]
struct BuildState {
    done: bool,
    failure: Option<String>,
    /// Entities updated while the scan ran, with every name they touched.
    touched: HashMap<u32, SmallVec<[u32; 4]>>,
}

struct Shared {
    shards: Box<[Mutex<HashMap<u32, RoaringBitmap>>]>,
    records: Arc<dyn RecordStorage>,
    ready: AtomicBool,
    build: Mutex<BuildState>,
    built: Condvar,
}

impl Shared {
    #[inline]
    fn shard_index(name_id: u32) -> usize {
        name_id as usize % SHARD_COUNT
    }

    fn insert(&self, name_id: u32, entity: u32) {
        self.shards[Self::shard_index(name_id)]
            .lock()
            .entry(name_id)
            .or_default()
            .insert(entity);
    }

    fn remove(&self, name_id: u32, entity: u32) {
        let mut shard = self.shards[Self::shard_index(name_id)].lock();
        if let Some(entities) = shard.get_mut(&name_id) {
            entities.remove(entity);
            if entities.is_empty() {
                shard.remove(&name_id);
            }
        }
    }

    /// Moves `entity` with both shards held, so a query never sees it in
    /// neither or both sets.
    fn apply(&self, entity: u32, old_name: u32, new_name: u32) {
        match (old_name, new_name) {
            (0, 0) => {}
            (0, new) => self.insert(new, entity),
            (old, 0) => self.remove(old, entity),
            (old, new) => {
                let (a, b) = (Self::shard_index(old), Self::shard_index(new));
                if a == b {
                    let mut shard = self.shards[a].lock();
                    Self::move_in(&mut shard, None, entity, old, new);
                } else {
                    let (first, second) = if a < b { (a, b) } else { (b, a) };
                    let mut first = self.shards[first].lock();
                    let mut second = self.shards[second].lock();
                    let (old_shard, new_shard) = if a < b {
                        (&mut *first, &mut *second)
                    } else {
                        (&mut *second, &mut *first)
                    };
                    Self::move_in(old_shard, Some(new_shard), entity, old, new);
                }
            }
        }
    }

    fn move_in(
        old_shard: &mut HashMap<u32, RoaringBitmap>,
        new_shard: Option<&mut HashMap<u32, RoaringBitmap>>,
        entity: u32,
        old_name: u32,
        new_name: u32,
    ) {
        if let Some(entities) = old_shard.get_mut(&old_name) {
            entities.remove(entity);
            if entities.is_empty() {
                old_shard.remove(&old_name);
            }
        }
        let target = match new_shard {
            Some(shard) => shard,
            None => old_shard,
        };
        target.entry(new_name).or_default().insert(entity);
    }

    fn run(&self, background: bool) {
        let started = Instant::now();
        tracing::info!(background, "rebuilding name index");

        let scanned = scan_records(self.records.as_ref(), |name_id, entity| {
            self.insert(name_id, entity);
            Ok(())
        });

        let mut build = self.build.lock();
        let outcome = scanned.and_then(|indexed| {
            let reconciled = self.reconcile(&mut build)?;
            Ok((indexed, reconciled))
        });
        match outcome {
            Ok((indexed, reconciled)) => {
                self.ready.store(true, Ordering::Release);
                tracing::info!(
                    entities = indexed,
                    reconciled,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "name index ready"
                );
            }
            Err(err) => {
                tracing::error!(error = %format!("{:#}", err), "name index rebuild failed");
                build.failure = Some(format!("{:#}", err));
            }
        }
        build.done = true;
        build.touched.clear();
        drop(build);
        self.built.notify_all();
    }

    /// Re-derives every entity updated during the scan from its record.
    fn reconcile(&self, build: &mut BuildState) -> Result<usize> {
        let allocated = self.records.record_count();
        for (entity, names) in build.touched.iter() {
            for name_id in names {
                self.remove(*name_id, *entity);
            }
            if *entity == 0 || *entity > allocated {
                continue;
            }
            let snapshot = self.records.read_record(*entity)?;
            if let Some(name_id) = indexed_name(&snapshot) {
                self.insert(name_id, *entity);
            }
        }
        Ok(build.touched.len())
    }
}

pub struct InMemoryNameIndex {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for InMemoryNameIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryNameIndex")
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl InMemoryNameIndex {
    /// Starts a rebuild from `records`. With `background` the scan runs on
    /// its own thread and this returns immediately.
    pub fn build(records: Arc<dyn RecordStorage>, background: bool) -> Result<Self> {
        let shared = Arc::new(Shared {
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            records,
            ready: AtomicBool::new(false),
            build: Mutex::new(BuildState::default()),
            built: Condvar::new(),
        });

        let worker = if background {
            let worker_shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name("vfstore-name-index".into())
                .spawn(move || worker_shared.run(true))
                .wrap_err("failed to spawn name index rebuild thread")?;
            Some(handle)
        } else {
            shared.run(false);
            None
        };

        let index = Self {
            shared,
            worker: Mutex::new(worker),
        };
        if !background {
            index.await_ready()?;
        }
        Ok(index)
    }

    pub fn name_count(&self) -> usize {
        self.shared.shards.iter().map(|s| s.lock().len()).sum()
    }
}

impl NameIndex for InMemoryNameIndex {
    fn update_file_name(&self, entity: u32, old_name: u32, new_name: u32) -> Result<()> {
        if old_name == new_name {
            return Ok(());
        }
        if !self.shared.ready.load(Ordering::Acquire) {
            let mut build = self.shared.build.lock();
            if !build.done {
                let names = build.touched.entry(entity).or_default();
                for name_id in [old_name, new_name] {
                    if name_id != 0 && !names.contains(&name_id) {
                        names.push(name_id);
                    }
                }
            }
            self.shared.apply(entity, old_name, new_name);
            return Ok(());
        }
        self.shared.apply(entity, old_name, new_name);
        Ok(())
    }

    fn files_with_name(&self, name_id: u32) -> Result<Vec<u32>> {
        self.await_ready()?;
        if name_id == 0 {
            return Ok(Vec::new());
        }
        let shard = self.shared.shards[Shared::shard_index(name_id)].lock();
        Ok(shard
            .get(&name_id)
            .map(|entities| entities.iter().collect())
            .unwrap_or_default())
    }

    fn await_ready(&self) -> Result<()> {
        if self.shared.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut build = self.shared.build.lock();
        while !build.done {
            self.shared.built.wait(&mut build);
        }
        match &build.failure {
            Some(failure) => Err(eyre!("name index rebuild failed: {}", failure)),
            None => Ok(()),
        }
    }

    fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    fn close(&self) -> Result<()> {
        if let Some(handle) = self.worker.lock().take() {
            handle
                .join()
                .map_err(|_| eyre!("name index rebuild thread panicked"))?;
        }
        self.await_ready()
    }
}
