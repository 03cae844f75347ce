//! Bucket page layout and entry packing.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ---------------------------------------
//!      0     4  magic (BUCKET_MAGIC)
//!      4     4  local_depth
//!      8     4  count (entries written, live or tombstoned)
//!     12     4  overflow (next page in chain, 0 = none)
//!     16  4080  entries[510], each (key << 32) | value
//! ```
//!
//! Entries below `count` are immutable except for their value half, which
//! may be replaced in place (single-valued maps) or overwritten with
//! [`TOMBSTONE`] on removal. `count` is published with release ordering
//! after the entry it covers is written.

use crate::config::{BUCKET_CAPACITY, BUCKET_HEADER_SIZE, MAP_PAGE_SIZE};

pub const BUCKET_MAGIC: u32 = 0x4B43_5542;

/// Value marking a removed entry. Callers may not store it.
pub const TOMBSTONE: u32 = u32::MAX;

pub const MAGIC_OFFSET: u64 = 0;
pub const DEPTH_OFFSET: u64 = 4;
pub const COUNT_OFFSET: u64 = 8;
pub const OVERFLOW_OFFSET: u64 = 12;

#[inline]
pub fn page_offset(page: u32) -> u64 {
    page as u64 * MAP_PAGE_SIZE as u64
}

#[inline]
pub fn entry_offset(page: u32, index: u32) -> u64 {
    page_offset(page) + BUCKET_HEADER_SIZE as u64 + index as u64 * 8
}

#[inline]
pub fn pack(key: u32, value: u32) -> u64 {
    ((key as u64) << 32) | value as u64
}

#[inline]
pub fn unpack(entry: u64) -> (u32, u32) {
    ((entry >> 32) as u32, entry as u32)
}

/// Murmur3 32-bit finalizer. Bijective, so equal hashes imply equal keys.
#[inline]
pub fn scramble(key: u32) -> u32 {
    let mut h = key;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketHeader {
    pub local_depth: u32,
    pub count: u32,
    pub overflow: u32,
}

impl BucketHeader {
    pub fn is_full(&self) -> bool {
        self.count as usize >= BUCKET_CAPACITY
    }
}

/// Serializes a fresh, unpublished bucket page.
pub fn encode_page(local_depth: u32, overflow: u32, entries: &[u64]) -> Vec<u8> {
    debug_assert!(entries.len() <= BUCKET_CAPACITY);
    let mut page = Vec::with_capacity(BUCKET_HEADER_SIZE + entries.len() * 8);
    page.extend_from_slice(&BUCKET_MAGIC.to_le_bytes());
    page.extend_from_slice(&local_depth.to_le_bytes());
    page.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    page.extend_from_slice(&overflow.to_le_bytes());
    for entry in entries {
        page.extend_from_slice(&entry.to_le_bytes());
    }
    page
}
