//! # vfstore Configuration Constants
//!
//! This module centralizes the layout and concurrency constants for the
//! store. Constants that depend on each other are co-located and the
//! relationships are enforced through compile-time assertions.
//!
//! ## Dependency Graph
//!
//! ```text
//! FILE_HEADER_SIZE (128 bytes)
//!       │
//!       ├─> HEADER_COUNTERS_OFFSET (64, eight u64 atomic slots to the end)
//!       │
//!       └─> every component's first payload byte
//!
//! MAP_PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> BUCKET_HEADER_SIZE (16 bytes)
//!       │
//!       ├─> BUCKET_CAPACITY (derived: (page - header) / 8)
//!       │
//!       └─> MAP_CHUNK_SIZE (must be a multiple so buckets never straddle chunks)
//!
//! RECORD_SIZE (48 bytes)
//!       │
//!       └─> RECORDS_CHUNK_SIZE (any multiple of 8; words never straddle chunks)
//! ```
//!
//! ## Critical Invariants
//!
//! 1. Every chunk size is a multiple of `OS_PAGE_ALIGNMENT` so each chunk can
//!    be mapped at its own file offset.
//! 2. `MAP_CHUNK_SIZE % MAP_PAGE_SIZE == 0` so bucket pages are contiguous in
//!    memory.
//! 3. `RECORD_SIZE` is a multiple of 8 so every record word is naturally
//!    aligned.

// ============================================================================
// FILE LAYOUT
// ============================================================================

/// Size of the header at the start of every data file.
pub const FILE_HEADER_SIZE: usize = 128;

/// Offset of the eight atomic counter slots inside the header.
pub const HEADER_COUNTERS_OFFSET: usize = 64;

/// Number of u64 counter slots available to each component.
pub const HEADER_COUNTER_SLOTS: usize = 8;

const _: () = assert!(
    HEADER_COUNTERS_OFFSET + HEADER_COUNTER_SLOTS * 8 == FILE_HEADER_SIZE,
    "counter slots must fill the tail of the file header exactly"
);

/// Mapping granularity required by every supported OS (16KB covers Apple Silicon).
pub const OS_PAGE_ALIGNMENT: usize = 16 * 1024;

/// Upper bound on the number of chunks one region may map.
/// The chunk table is allocated up front so readers never take a lock.
pub const MAX_CHUNKS: usize = 4096;

/// Chunk size for small files (fast-int arrays, enumerator logs).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Chunk size for the record table (4MB x 4096 chunks = 16GB, ~350M records).
pub const RECORDS_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Chunk size for hash map files.
pub const MAP_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Chunk size for the attribute blob area.
pub const ATTRIBUTES_CHUNK_SIZE: usize = 8 * 1024 * 1024;

const _: () = assert!(DEFAULT_CHUNK_SIZE % OS_PAGE_ALIGNMENT == 0);
const _: () = assert!(RECORDS_CHUNK_SIZE % OS_PAGE_ALIGNMENT == 0);
const _: () = assert!(MAP_CHUNK_SIZE % OS_PAGE_ALIGNMENT == 0);
const _: () = assert!(ATTRIBUTES_CHUNK_SIZE % OS_PAGE_ALIGNMENT == 0);

// ============================================================================
// RECORD TABLE
// ============================================================================

/// Size of one entity record in bytes.
pub const RECORD_SIZE: usize = 48;

const _: () = assert!(RECORD_SIZE % 8 == 0, "records must keep u64 fields aligned");

/// Number of writer stripes guarding record updates.
pub const RECORD_WRITE_STRIPES: usize = 256;

/// Bound on seqlock retries before a snapshot read is declared torn.
pub const MAX_TORN_READ_RETRIES: u32 = 100_000;

// ============================================================================
// EXTENDIBLE HASH MAP
// ============================================================================

/// Allocation unit of a hash map file. Page 0 holds the file header.
pub const MAP_PAGE_SIZE: usize = 4096;

/// Bucket header: magic, local depth, entry count, overflow page.
pub const BUCKET_HEADER_SIZE: usize = 16;

/// Packed 64-bit entries per bucket.
pub const BUCKET_CAPACITY: usize = (MAP_PAGE_SIZE - BUCKET_HEADER_SIZE) / 8;

const _: () = assert!(MAP_CHUNK_SIZE % MAP_PAGE_SIZE == 0);
const _: () = assert!(BUCKET_CAPACITY == 510);

/// Deepest directory the map will grow to (2^24 slots = 64MB of directory).
/// Buckets that still overflow at this depth chain into overflow pages.
pub const MAX_GLOBAL_DEPTH: u32 = 24;

/// Number of stripes used to serialize inserts into distinct buckets.
pub const MAP_WRITE_STRIPES: usize = 64;

// ============================================================================
// ENUMERATOR
// ============================================================================

/// Longest string the enumerators will intern, in UTF-8 bytes.
pub const MAX_ENUMERATED_LEN: usize = 64 * 1024;

/// Per-entry header in the value log: content hash and byte length.
pub const LOG_ENTRY_HEADER_SIZE: usize = 8;

const _: () = assert!(FILE_HEADER_SIZE % 8 == 0, "first log entry must be 8-aligned");

// ============================================================================
// ATTRIBUTES
// ============================================================================

/// Alignment of every blob in the attribute area and enumerator log.
pub const BLOB_ALIGNMENT: usize = 8;

/// Number of writer stripes guarding per-entity attribute directories.
pub const ATTRIBUTE_WRITE_STRIPES: usize = 256;

/// Largest single attribute value accepted.
pub const MAX_ATTRIBUTE_SIZE: usize = 64 * 1024 * 1024;

// ============================================================================
// CACHING AND INDEXING
// ============================================================================

/// Number of shards for the name cache.
pub const NAME_CACHE_SHARD_COUNT: usize = 16;

/// Default number of names held by the MRU ring.
pub const DEFAULT_MRU_CAPACITY: usize = 4096;

/// Default SLRU segment sizes.
pub const DEFAULT_SLRU_PROBATION: usize = 8 * 1024;
pub const DEFAULT_SLRU_PROTECTED: usize = 32 * 1024;

/// Number of shards for the in-memory inverted name index.
pub const NAME_INDEX_SHARD_COUNT: usize = 64;

/// Number of stripes serializing children-list saves per parent.
pub const CHILDREN_WRITE_STRIPES: usize = 256;

/// Bound on load-modify-save retries in `update_children`.
pub const MAX_CHILDREN_SAVE_RETRIES: u32 = 1_000;
