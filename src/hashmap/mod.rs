//! # Extendible Hash Map
//!
//! A persistent `u32 -> u32` map (or `u32 -> {u32}` in multi-valued mode)
//! stored in one memory-mapped file of 4KB pages. It backs the enumerators
//! (`hash -> id`) and the durable inverted name index (`nameId -> entity`).
//!
//! ## File Layout
//!
//! ```text
//! page 0       file header; counter slots:
//!                slot 0  directory word  (global_depth << 56) | first_page
//!                slot 1  next unallocated page
//!                slot 2  live entry count
//! page 1..     directory pages and bucket pages, allocated in order
//! ```
//!
//! The directory is an array of `2^global_depth` u32 bucket page numbers in
//! contiguous pages. A key is scrambled with a 32-bit finalizer and its low
//! `global_depth` bits select a directory slot. Several slots share one
//! bucket when the bucket's `local_depth` is smaller than the global depth.
//!
//! ## Concurrency
//!
//! ```text
//! lookup:  dir word (Acquire) -> slot (Acquire) -> count (Acquire) -> entries
//! insert:  structure.read() + stripe[head % 64]  -> append, publish count
//! append:  structure.read() + stripe[head % 64]  -> cached tail page, publish count
//! grow:    structure.write()                     -> compact | split | overflow
//! ```
//!
//! Lookups never lock. Nothing reachable from a published directory is
//! rewritten in place except an entry's value half, so a reader always sees
//! either the old bucket or the new one:
//!
//! - **Split**: live entries are copied into two fresh buckets with
//!   `local_depth + 1`, then the directory slots are repointed one release
//!   store at a time. The directory doubles first (into fresh pages,
//!   published through the directory word) when the bucket is already at
//!   global depth.
//! - **Compaction**: a full chain with at least a quarter of a bucket in
//!   tombstones is rewritten without them. A remove that leaves at least
//!   half of a chain (and a quarter of a bucket) tombstoned compacts it
//!   right away.
//! - **Overflow**: a bucket whose live entries all share one key (or that
//!   sits at `MAX_GLOBAL_DEPTH`) gets an overflow page linked from the last
//!   page of its chain.
//!
//! Replaced pages are not reclaimed, so a page number names one chain for
//! the life of the file. Each write stripe caches the tail page of the
//! chains it guards; [`ExtendibleHashMap::append`] starts from that page and
//! follows overflow links from there, so adding a value never rescans the
//! values already stored under its key.
//!
//! ## Errors
//!
//! Bad bucket magic, out-of-range page numbers and over-long chains are
//! `MapCorruption`. Storing [`TOMBSTONE`] as a value is `InvalidArgument`.

mod bucket;

pub use bucket::{scramble, TOMBSTONE};

use std::path::Path;

use eyre::{Result, WrapErr};
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use self::bucket::{
    encode_page, entry_offset, pack, page_offset, unpack, BucketHeader, BUCKET_MAGIC,
    COUNT_OFFSET, DEPTH_OFFSET, MAGIC_OFFSET, OVERFLOW_OFFSET,
};
use crate::config::{
    BUCKET_CAPACITY, MAP_CHUNK_SIZE, MAP_PAGE_SIZE, MAP_WRITE_STRIPES, MAX_GLOBAL_DEPTH,
};
use hashbrown::HashMap;

use crate::error::StoreError;
use crate::storage::{
    counter_offset, FileHeader, FileKind, MappedRegion, HEADER_FLAG_MULTI_VALUED,
};

const SLOT_DIRECTORY: usize = 0;
const SLOT_NEXT_PAGE: usize = 1;
const SLOT_ENTRIES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// One value per key; `put` replaces.
    Single,
    /// A set of values per key; `put` adds the pair if absent.
    Multi,
}

#[derive(Debug, Clone, Copy)]
struct Directory {
    depth: u32,
    first_page: u32,
}

impl Directory {
    fn from_word(word: u64) -> Self {
        Self {
            depth: (word >> 56) as u32,
            first_page: word as u32,
        }
    }

    fn word(self) -> u64 {
        ((self.depth as u64) << 56) | self.first_page as u64
    }

    fn len(self) -> u64 {
        1u64 << self.depth
    }

    fn mask(self) -> u32 {
        ((1u64 << self.depth) - 1) as u32
    }

    fn slot_offset(self, slot: u32) -> u64 {
        page_offset(self.first_page) + slot as u64 * 4
    }

    fn page_count(self) -> u32 {
        (self.len() * 4).div_ceil(MAP_PAGE_SIZE as u64) as u32
    }
}

enum InsertOutcome {
    Changed,
    Unchanged,
    Full,
}

/// Shape of a map as observed by [`ExtendibleHashMap::verify`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapStats {
    pub global_depth: u32,
    pub buckets: u32,
    pub live_entries: u64,
    pub tombstones: u64,
    pub pages: u32,
}

pub struct ExtendibleHashMap {
    region: MappedRegion,
    mode: MapMode,
    clean_at_open: bool,
    structure: RwLock<()>,
    /// Chain head -> last known tail page, for chains whose head maps to
    /// the stripe.
    stripes: Box<[Mutex<HashMap<u32, u32>>]>,
}

impl std::fmt::Debug for ExtendibleHashMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtendibleHashMap")
            .field("path", &self.region.path())
            .field("mode", &self.mode)
            .finish()
    }
}

impl ExtendibleHashMap {
    pub fn create(path: &Path, store_version: u32, mode: MapMode) -> Result<Self> {
        let flags = match mode {
            MapMode::Single => 0,
            MapMode::Multi => HEADER_FLAG_MULTI_VALUED,
        };
        let header = FileHeader::new(FileKind::HashMap, store_version, flags, MAP_CHUNK_SIZE as u32);
        let region = MappedRegion::create(path, &header)
            .wrap_err_with(|| format!("failed to create hash map '{}'", path.display()))?;

        // page 1: single-slot directory, page 2: the only bucket
        region.write_bytes(page_offset(2), &encode_page(0, 0, &[]))?;
        region.write_u32(page_offset(1), 2)?;
        region.write_u64(counter_offset(SLOT_NEXT_PAGE), 3)?;
        region.write_u64(counter_offset(SLOT_ENTRIES), 0)?;
        region.write_u64(
            counter_offset(SLOT_DIRECTORY),
            Directory {
                depth: 0,
                first_page: 1,
            }
            .word(),
        )?;

        Ok(Self::with_region(region, mode, true))
    }

    pub fn open(path: &Path, store_version: u32) -> Result<Self> {
        let (region, header) = MappedRegion::open(path, FileKind::HashMap, store_version)
            .wrap_err_with(|| format!("failed to open hash map '{}'", path.display()))?;
        let mode = if header.has_flag(HEADER_FLAG_MULTI_VALUED) {
            MapMode::Multi
        } else {
            MapMode::Single
        };
        let map = Self::with_region(region, mode, header.was_clean_shutdown());
        map.check_directory()?;
        Ok(map)
    }

    /// Opens `path` when present, creating it otherwise. An existing file in
    /// the other mode is a header mismatch.
    pub fn open_or_create(path: &Path, store_version: u32, mode: MapMode) -> Result<Self> {
        if !path.exists() {
            return Self::create(path, store_version, mode);
        }
        let map = Self::open(path, store_version)?;
        if map.mode != mode {
            return Err(StoreError::HeaderMismatch {
                path: path.to_path_buf(),
                reason: format!("map is {:?}-valued, expected {:?}", map.mode, mode),
            }
            .into());
        }
        Ok(map)
    }

    fn with_region(region: MappedRegion, mode: MapMode, clean_at_open: bool) -> Self {
        Self {
            region,
            mode,
            clean_at_open,
            structure: RwLock::new(()),
            stripes: (0..MAP_WRITE_STRIPES)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    pub fn mode(&self) -> MapMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        self.region.path()
    }

    pub fn was_clean_at_open(&self) -> bool {
        self.clean_at_open
    }

    pub fn len(&self) -> Result<u64> {
        self.region.read_u64(counter_offset(SLOT_ENTRIES))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn corruption(&self, reason: String) -> eyre::Report {
        StoreError::MapCorruption {
            path: self.region.path().to_path_buf(),
            reason,
        }
        .into()
    }

    fn next_page(&self) -> Result<u32> {
        Ok(self.region.read_u64(counter_offset(SLOT_NEXT_PAGE))? as u32)
    }

    fn directory(&self) -> Result<Directory> {
        let dir = Directory::from_word(self.region.read_u64(counter_offset(SLOT_DIRECTORY))?);
        if dir.depth > MAX_GLOBAL_DEPTH {
            return Err(self.corruption(format!("directory depth {} too large", dir.depth)));
        }
        Ok(dir)
    }

    fn check_directory(&self) -> Result<()> {
        let dir = self.directory()?;
        let next_page = self.next_page()?;
        let end = dir.first_page as u64 + dir.page_count() as u64;
        if dir.first_page == 0 || end > next_page as u64 {
            return Err(self.corruption(format!(
                "directory pages {}..{} beyond allocated {}",
                dir.first_page, end, next_page
            )));
        }
        if page_offset(next_page) > self.region.len() {
            return Err(self.corruption(format!(
                "allocated page {} beyond file end {}",
                next_page,
                self.region.len()
            )));
        }
        Ok(())
    }

    fn head_for(&self, dir: Directory, hash: u32) -> Result<u32> {
        self.region.read_u32(dir.slot_offset(hash & dir.mask()))
    }

    fn read_bucket(&self, page: u32) -> Result<BucketHeader> {
        let next_page = self.next_page()?;
        if page == 0 || page >= next_page {
            return Err(self.corruption(format!(
                "bucket page {} outside allocated range 1..{}",
                page, next_page
            )));
        }
        let base = page_offset(page);
        let magic = self.region.read_u32(base + MAGIC_OFFSET)?;
        if magic != BUCKET_MAGIC {
            return Err(self.corruption(format!(
                "bad bucket magic {:#010x} on page {}",
                magic, page
            )));
        }
        let header = BucketHeader {
            local_depth: self.region.read_u32(base + DEPTH_OFFSET)?,
            count: self.region.read_u32(base + COUNT_OFFSET)?,
            overflow: self.region.read_u32(base + OVERFLOW_OFFSET)?,
        };
        if header.count as usize > BUCKET_CAPACITY || header.local_depth > MAX_GLOBAL_DEPTH {
            return Err(self.corruption(format!(
                "bucket page {} has count {} and depth {}",
                page, header.count, header.local_depth
            )));
        }
        Ok(header)
    }

    /// Last page reachable from `start`, with a bound on the walk.
    fn last_page(&self, start: u32) -> Result<(u32, BucketHeader)> {
        let limit = self.next_page()?;
        let mut page = start;
        for _ in 0..=limit {
            let header = self.read_bucket(page)?;
            if header.overflow == 0 {
                return Ok((page, header));
            }
            page = header.overflow;
        }
        Err(self.corruption(format!("overflow chain from page {} loops", start)))
    }

    /// Pages of the chain starting at `head`, with a bound on its length.
    fn chain(&self, head: u32) -> Result<SmallVec<[(u32, BucketHeader); 4]>> {
        let limit = self.next_page()? as usize;
        let mut pages = SmallVec::new();
        let mut page = head;
        loop {
            let header = self.read_bucket(page)?;
            pages.push((page, header));
            if header.overflow == 0 {
                return Ok(pages);
            }
            if pages.len() > limit {
                return Err(self.corruption(format!("overflow chain from page {} loops", head)));
            }
            page = header.overflow;
        }
    }

    /// Calls `visit` with every live value stored under `key` until it
    /// returns `true`. Never blocks.
    fn scan<F>(&self, key: u32, mut visit: F) -> Result<()>
    where
        F: FnMut(u32) -> Result<bool>,
    {
        let dir = self.directory()?;
        let head = self.head_for(dir, scramble(key))?;
        let limit = self.next_page()?;
        let mut page = head;
        let mut hops = 0u32;
        loop {
            let header = self.read_bucket(page)?;
            for index in 0..header.count {
                let (k, v) = unpack(self.region.read_u64(entry_offset(page, index))?);
                if k == key && v != TOMBSTONE && visit(v)? {
                    return Ok(());
                }
            }
            if header.overflow == 0 {
                return Ok(());
            }
            hops += 1;
            if hops > limit {
                return Err(self.corruption(format!("overflow chain from page {} loops", head)));
            }
            page = header.overflow;
        }
    }

    /// Returns the first value under `key` accepted by `predicate`.
    pub fn lookup<F>(&self, key: u32, mut predicate: F) -> Result<Option<u32>>
    where
        F: FnMut(u32) -> Result<bool>,
    {
        let mut found = None;
        self.scan(key, |value| {
            if predicate(value)? {
                found = Some(value);
                return Ok(true);
            }
            Ok(false)
        })?;
        Ok(found)
    }

    pub fn get(&self, key: u32) -> Result<Option<u32>> {
        self.lookup(key, |_| Ok(true))
    }

    pub fn get_all(&self, key: u32) -> Result<Vec<u32>> {
        let mut values = Vec::new();
        self.scan(key, |value| {
            values.push(value);
            Ok(false)
        })?;
        Ok(values)
    }

    pub fn contains(&self, key: u32, value: u32) -> Result<bool> {
        Ok(self.lookup(key, |v| Ok(v == value))?.is_some())
    }

    /// Single-valued: inserts or replaces. Multi-valued: adds the pair if
    /// absent. Returns whether the map changed.
    pub fn put(&self, key: u32, value: u32) -> Result<bool> {
        self.check_value(value)?;
        let hash = scramble(key);
        loop {
            {
                let _structure = self.structure.read();
                let head = self.head_for(self.directory()?, hash)?;
                let _stripe = self.stripes[head as usize % self.stripes.len()].lock();
                match self.insert_locked(head, key, value)? {
                    InsertOutcome::Changed => return Ok(true),
                    InsertOutcome::Unchanged => return Ok(false),
                    InsertOutcome::Full => {}
                }
            }
            let _structure = self.structure.write();
            self.make_room(hash)
                .wrap_err_with(|| format!("failed to grow hash map for key {}", key))?;
        }
    }

    /// Multi-valued only: adds `(key, value)` at the tail of its chain
    /// without looking for an existing copy. The caller knows the pair is
    /// absent; a duplicate is harmless to readers that dedup and is cleared
    /// by a single `remove`.
    pub fn append(&self, key: u32, value: u32) -> Result<()> {
        if self.mode != MapMode::Multi {
            return Err(StoreError::InvalidArgument(format!(
                "append on single-valued hash map '{}'",
                self.region.path().display()
            ))
            .into());
        }
        self.check_value(value)?;
        let hash = scramble(key);
        loop {
            {
                let _structure = self.structure.read();
                let head = self.head_for(self.directory()?, hash)?;
                let mut tails = self.stripes[head as usize % self.stripes.len()].lock();
                let start = tails.get(&head).copied().unwrap_or(head);
                let (tail, header) = self.last_page(start)?;
                tails.insert(head, tail);
                if !header.is_full() {
                    return self.write_entry(tail, header.count, key, value);
                }
            }
            let _structure = self.structure.write();
            self.make_room(hash)
                .wrap_err_with(|| format!("failed to grow hash map for key {}", key))?;
        }
    }

    fn check_value(&self, value: u32) -> Result<()> {
        if value == TOMBSTONE {
            return Err(StoreError::InvalidArgument(format!(
                "value {:#x} is reserved in hash map '{}'",
                value,
                self.region.path().display()
            ))
            .into());
        }
        Ok(())
    }

    /// Fills slot `count` of `page` and publishes it. Caller holds the
    /// chain's stripe.
    fn write_entry(&self, page: u32, count: u32, key: u32, value: u32) -> Result<()> {
        self.region
            .write_u64(entry_offset(page, count), pack(key, value))?;
        self.region
            .write_u32(page_offset(page) + COUNT_OFFSET, count + 1)?;
        self.region.fetch_add_u64(counter_offset(SLOT_ENTRIES), 1)?;
        Ok(())
    }

    fn insert_locked(&self, head: u32, key: u32, value: u32) -> Result<InsertOutcome> {
        let mut free_slot = None;
        for (page, header) in self.chain(head)? {
            for index in 0..header.count {
                let offset = entry_offset(page, index);
                let (k, v) = unpack(self.region.read_u64(offset)?);
                if k != key || v == TOMBSTONE {
                    continue;
                }
                if v == value {
                    return Ok(InsertOutcome::Unchanged);
                }
                if self.mode == MapMode::Single {
                    self.region.write_u64(offset, pack(key, value))?;
                    return Ok(InsertOutcome::Changed);
                }
            }
            if free_slot.is_none() && !header.is_full() {
                free_slot = Some((page, header.count));
            }
        }

        let Some((page, count)) = free_slot else {
            return Ok(InsertOutcome::Full);
        };
        self.write_entry(page, count, key, value)?;
        Ok(InsertOutcome::Changed)
    }

    /// Removes the pair `(key, value)`. Returns whether it was present.
    pub fn remove(&self, key: u32, value: u32) -> Result<bool> {
        Ok(self.remove_matching(key, |v| v == value)? > 0)
    }

    /// Removes every value under `key`. Returns how many were removed.
    pub fn remove_key(&self, key: u32) -> Result<usize> {
        self.remove_matching(key, |_| true)
    }

    fn remove_matching<F>(&self, key: u32, mut matches: F) -> Result<usize>
    where
        F: FnMut(u32) -> bool,
    {
        let hash = scramble(key);
        let mut removed = 0;
        let mut tombstones = 0usize;
        let mut total = 0usize;
        {
            let _structure = self.structure.read();
            let head = self.head_for(self.directory()?, hash)?;
            let _stripe = self.stripes[head as usize % self.stripes.len()].lock();

            for (page, header) in self.chain(head)? {
                total += header.count as usize;
                for index in 0..header.count {
                    let offset = entry_offset(page, index);
                    let (k, v) = unpack(self.region.read_u64(offset)?);
                    if v == TOMBSTONE {
                        tombstones += 1;
                    } else if k == key && matches(v) {
                        self.region.write_u64(offset, pack(key, TOMBSTONE))?;
                        removed += 1;
                        tombstones += 1;
                    }
                }
            }
            if removed > 0 {
                self.region
                    .fetch_sub_u64(counter_offset(SLOT_ENTRIES), removed as u64)?;
            }
        }

        if removed > 0 && worth_compacting(tombstones, total) {
            let _structure = self.structure.write();
            self.compact(hash)
                .wrap_err_with(|| format!("failed to compact hash map after removing key {}", key))?;
        }
        Ok(removed)
    }

    /// Rewrites the chain for `hash` without tombstones if it still has
    /// enough of them. Called with the structure lock held exclusively.
    fn compact(&self, hash: u32) -> Result<()> {
        let dir = self.directory()?;
        let head = self.head_for(dir, hash)?;
        let chain = self.chain(head)?;
        let total: usize = chain.iter().map(|(_, h)| h.count as usize).sum();
        let (live, tombstones) = self.live_entries(&chain)?;
        if !worth_compacting(tombstones, total) {
            return Ok(());
        }
        let local_depth = chain[0].1.local_depth;
        let prefix = hash & (((1u64 << local_depth) - 1) as u32);
        let compacted = self.build_chain(&live, local_depth)?;
        self.repoint(dir, prefix, local_depth, |_| compacted)?;
        self.forget_tails();
        tracing::trace!(
            path = %self.region.path().display(),
            tombstones,
            live = live.len(),
            "compacted hash map chain"
        );
        Ok(())
    }

    fn live_entries(&self, chain: &[(u32, BucketHeader)]) -> Result<(Vec<u64>, usize)> {
        let mut live = Vec::with_capacity(chain.len() * BUCKET_CAPACITY);
        let mut tombstones = 0usize;
        for (page, header) in chain {
            for index in 0..header.count {
                let entry = self.region.read_u64(entry_offset(*page, index))?;
                if unpack(entry).1 == TOMBSTONE {
                    tombstones += 1;
                } else {
                    live.push(entry);
                }
            }
        }
        Ok((live, tombstones))
    }

    /// Drops every cached tail. Called with the structure lock held
    /// exclusively after chain heads were replaced.
    fn forget_tails(&self) {
        for stripe in self.stripes.iter() {
            stripe.lock().clear();
        }
    }

    // TODO: collect pages orphaned by splits and compaction into a free list
    // during `verify` so a reopened map can reuse them.
    fn allocate_pages(&self, count: u32) -> Result<u32> {
        let first = self
            .region
            .fetch_add_u64(counter_offset(SLOT_NEXT_PAGE), count as u64)?;
        let end = first + count as u64;
        if end > u32::MAX as u64 {
            return Err(self.corruption(format!("page counter overflow at {}", first)));
        }
        self.region.ensure_capacity(end * MAP_PAGE_SIZE as u64)?;
        Ok(first as u32)
    }

    /// Writes `entries` into a fresh chain of pages and returns its head.
    fn build_chain(&self, entries: &[u64], local_depth: u32) -> Result<u32> {
        let pages = entries.len().div_ceil(BUCKET_CAPACITY).max(1) as u32;
        let first = self.allocate_pages(pages)?;
        for n in 0..pages {
            let start = n as usize * BUCKET_CAPACITY;
            let end = (start + BUCKET_CAPACITY).min(entries.len());
            let overflow = if n + 1 < pages { first + n + 1 } else { 0 };
            let bytes = encode_page(local_depth, overflow, &entries[start..end]);
            self.region.write_bytes(page_offset(first + n), &bytes)?;
        }
        Ok(first)
    }

    /// Points every directory slot sharing `prefix` at `local_depth` to the
    /// bucket chosen by `target`.
    fn repoint<F>(&self, dir: Directory, prefix: u32, local_depth: u32, target: F) -> Result<()>
    where
        F: Fn(u32) -> u32,
    {
        for j in 0..(1u64 << (dir.depth - local_depth)) {
            let slot = prefix | ((j as u32) << local_depth);
            self.region.write_u32(dir.slot_offset(slot), target(slot))?;
        }
        Ok(())
    }

    fn double_directory(&self, dir: Directory) -> Result<Directory> {
        let grown = Directory {
            depth: dir.depth + 1,
            first_page: 0,
        };
        let grown = Directory {
            first_page: self.allocate_pages(grown.page_count())?,
            ..grown
        };

        let mut slots = vec![0u8; dir.len() as usize * 4];
        self.region.read_bytes(dir.slot_offset(0), &mut slots)?;
        self.region.write_bytes(grown.slot_offset(0), &slots)?;
        self.region
            .write_bytes(grown.slot_offset(dir.len() as u32), &slots)?;
        self.region
            .write_u64(counter_offset(SLOT_DIRECTORY), grown.word())?;

        tracing::debug!(
            path = %self.region.path().display(),
            depth = grown.depth,
            "doubled hash map directory"
        );
        Ok(grown)
    }

    /// Called with the structure lock held exclusively after an insert found
    /// the chain for `hash` full.
    fn make_room(&self, hash: u32) -> Result<()> {
        let dir = self.directory()?;
        let head = self.head_for(dir, hash)?;
        let chain = self.chain(head)?;
        if !chain[chain.len() - 1].1.is_full() {
            return Ok(());
        }

        let local_depth = chain[0].1.local_depth;
        let (live, tombstones) = self.live_entries(&chain)?;

        let prefix_mask = ((1u64 << local_depth) - 1) as u32;
        let prefix = hash & prefix_mask;

        if tombstones >= BUCKET_CAPACITY / 4 {
            let compacted = self.build_chain(&live, local_depth)?;
            self.repoint(dir, prefix, local_depth, |_| compacted)?;
            self.forget_tails();
            return Ok(());
        }

        let first_key = live.first().map(|entry| unpack(*entry).0);
        let separable = live.iter().any(|entry| Some(unpack(*entry).0) != first_key);
        if !separable || local_depth >= MAX_GLOBAL_DEPTH {
            let (last, _) = chain[chain.len() - 1];
            let overflow = self.build_chain(&[], local_depth)?;
            return self
                .region
                .write_u32(page_offset(last) + OVERFLOW_OFFSET, overflow);
        }

        let dir = if local_depth == dir.depth {
            self.double_directory(dir)?
        } else {
            dir
        };
        let split_bit = 1u32 << local_depth;
        let (high, low): (Vec<u64>, Vec<u64>) = live
            .iter()
            .copied()
            .partition(|entry| scramble(unpack(*entry).0) & split_bit != 0);
        let low_head = self.build_chain(&low, local_depth + 1)?;
        let high_head = self.build_chain(&high, local_depth + 1)?;
        self.repoint(dir, prefix, local_depth, |slot| {
            if slot & split_bit != 0 {
                high_head
            } else {
                low_head
            }
        })?;
        self.forget_tails();
        Ok(())
    }

    /// Walks every reachable bucket, checking structure, and resets the
    /// live entry counter to the number of entries found.
    pub fn verify(&self) -> Result<MapStats> {
        let _structure = self.structure.write();
        self.check_directory()?;
        let dir = self.directory()?;

        let mut stats = MapStats {
            global_depth: dir.depth,
            pages: self.next_page()?,
            ..MapStats::default()
        };
        let mut seen = hashbrown::HashSet::new();
        for slot in 0..dir.len() as u32 {
            let head = self.region.read_u32(dir.slot_offset(slot))?;
            if !seen.insert(head) {
                continue;
            }
            let chain = self.chain(head)?;
            let local_depth = chain[0].1.local_depth;
            if local_depth > dir.depth {
                return Err(self.corruption(format!(
                    "bucket {} has local depth {} above global depth {}",
                    head, local_depth, dir.depth
                )));
            }
            let mask = ((1u64 << local_depth) - 1) as u32;
            stats.buckets += 1;
            for (page, header) in &chain {
                if header.local_depth != local_depth {
                    return Err(self.corruption(format!(
                        "overflow page {} depth {} differs from head {}",
                        page, header.local_depth, local_depth
                    )));
                }
                for index in 0..header.count {
                    let (key, value) = unpack(self.region.read_u64(entry_offset(*page, index))?);
                    if value == TOMBSTONE {
                        stats.tombstones += 1;
                        continue;
                    }
                    if scramble(key) & mask != slot & mask {
                        return Err(self.corruption(format!(
                            "key {} stored in bucket {} for slot {}",
                            key, page, slot
                        )));
                    }
                    stats.live_entries += 1;
                }
            }
        }

        let recorded = self.len()?;
        if recorded != stats.live_entries {
            tracing::debug!(
                path = %self.region.path().display(),
                recorded,
                found = stats.live_entries,
                "repaired hash map entry count"
            );
            self.region
                .write_u64(counter_offset(SLOT_ENTRIES), stats.live_entries)?;
        }
        Ok(stats)
    }

    pub fn flush(&self) -> Result<()> {
        self.region.flush()
    }

    pub fn set_clean_shutdown(&self, clean: bool) -> Result<()> {
        self.region.set_clean_shutdown(clean)
    }
}

fn worth_compacting(tombstones: usize, total: usize) -> bool {
    tombstones >= BUCKET_CAPACITY / 4 && tombstones * 2 >= total
}
