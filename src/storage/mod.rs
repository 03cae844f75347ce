//! # Storage Module
//!
//! The persistence substrate for every component of the store: growable
//! memory-mapped regions with atomic word access, the shared file header,
//! and the advisory lock that keeps a storage root single-process.
//!
//! ## Storage Root Layout
//!
//! ```text
//! root/
//! ├── .lock                 # flock held while a store is connected
//! ├── corruption.marker     # present => next connect rebuilds
//! ├── records.dat           # fixed-width entity records
//! ├── names.log             # enumerator value log (file names)
//! ├── names.map             # hash -> name id
//! ├── attrkeys.log          # enumerator value log (attribute key names)
//! ├── attrkeys.map          # hash -> attribute key id
//! ├── attributes.dat        # append-only attribute blobs
//! ├── fastint.<key>.dat     # one u32 per entity for each fast-int key
//! └── nameindex.map         # durable inverted name index (optional)
//! ```
//!
//! Every data file begins with a 128-byte [`FileHeader`].
//!
//! ## Safety Model
//!
//! Files are mapped chunk by chunk and chunks are never unmapped or moved
//! while a [`MappedRegion`] is alive. References into mapped memory are
//! therefore tied to `&MappedRegion` and survive growth. All concurrently
//! mutated words go through atomics; multi-word structures are published
//! by a final release store of a pointer or sequence word.

pub mod headers;
pub mod lock;
pub mod mmap;

pub use headers::{
    counter_offset, FileHeader, FileKind, FORMAT_VERSION, HEADER_FLAG_CASE_INSENSITIVE,
    HEADER_FLAG_MULTI_VALUED,
};
pub use lock::RootLock;
pub use mmap::MappedRegion;

use std::path::Path;

use eyre::Result;

/// Opens `path` if it exists, otherwise creates it with `header`.
///
/// Returns the region and whether the file was freshly created.
pub fn open_or_create(
    path: &Path,
    header: &FileHeader,
    kind: FileKind,
    store_version: u32,
) -> Result<(MappedRegion, FileHeader, bool)> {
    if path.exists() {
        let (region, existing) = MappedRegion::open(path, kind, store_version)?;
        Ok((region, existing, false))
    } else {
        let region = MappedRegion::create(path, header)?;
        Ok((region, *header, true))
    }
}
