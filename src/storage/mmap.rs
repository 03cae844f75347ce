//! # Chunked Memory-Mapped Regions
//!
//! `MappedRegion` is the building block every persistent component sits on:
//! a file that grows in fixed-size chunks, each chunk mapped separately at
//! its own file offset.
//!
//! ## Why Chunks
//!
//! Remapping a whole file to grow it would invalidate every address handed
//! out so far, forcing readers to take a lock or join an epoch scheme. With
//! one mapping per chunk, growth only ever *adds* mappings:
//!
//! ```text
//! file:    [ chunk 0 | chunk 1 | chunk 2 | ...... ]
//!              │         │         │
//! table:   [ Once(0) | Once(1) | Once(2) | empty | empty | ... ]  (MAX_CHUNKS)
//! ```
//!
//! The chunk table is a fixed array of `OnceLock` slots allocated up front.
//! A reader resolves `offset -> (chunk, within)` with one division and one
//! acquire load; it never blocks. Growth serializes on `grow_lock`, extends
//! the file, maps the new chunks and publishes them into their slots.
//! Existing chunk addresses never change while the region is alive, so a
//! `&[u8]` returned by [`MappedRegion::slice`] stays valid for `&self`.
//!
//! ## Word Access
//!
//! Counters, record fields and hash map entries are read and written as
//! aligned atomics placed directly in the mapping. Loads use `Acquire`,
//! stores use `Release`, read-modify-write operations use `AcqRel`. Chunk
//! sizes are multiples of 16KB, so an aligned word never straddles chunks.
//! Misaligned offsets are programming errors; offsets past the mapped end
//! mean a stored pointer is bad and are reported as corruption.
//!
//! ## Byte Ranges
//!
//! [`MappedRegion::read_bytes`] and [`MappedRegion::write_bytes`] copy ranges
//! that may span chunks. Byte ranges are only used for append-only areas
//! (enumerator log, attribute blobs) where data is written before the
//! pointer to it is published with release ordering.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

use eyre::{ensure, Result, WrapErr};
use memmap2::{MmapOptions, MmapRaw};
use parking_lot::Mutex;
use zerocopy::IntoBytes;

use super::headers::{FileHeader, FileKind, CLEAN_SHUTDOWN_OFFSET};
use crate::config::{FILE_HEADER_SIZE, MAX_CHUNKS, OS_PAGE_ALIGNMENT};
use crate::error::StoreError;

pub struct MappedRegion {
    file: File,
    path: PathBuf,
    chunk_size: usize,
    chunks: Box<[OnceLock<MmapRaw>]>,
    mapped_chunks: AtomicUsize,
    grow_lock: Mutex<()>,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("path", &self.path)
            .field("chunk_size", &self.chunk_size)
            .field("mapped_chunks", &self.mapped_chunks.load(Ordering::Relaxed))
            .finish()
    }
}

impl MappedRegion {
    /// Creates (or truncates) `path`, maps the first chunk and writes `header`.
    pub fn create(path: &Path, header: &FileHeader) -> Result<Self> {
        let chunk_size = header.chunk_size() as usize;
        ensure!(
            chunk_size >= FILE_HEADER_SIZE && chunk_size % OS_PAGE_ALIGNMENT == 0,
            "chunk size {} for '{}' must be a non-zero multiple of {}",
            chunk_size,
            path.display(),
            OS_PAGE_ALIGNMENT
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| StoreError::io(path, "create", e))
            .wrap_err_with(|| format!("failed to create '{}'", path.display()))?;

        let region = Self::with_file(file, path, chunk_size);
        region.ensure_capacity(chunk_size as u64)?;
        region.write_bytes(0, header.as_bytes())?;
        Ok(region)
    }

    /// Opens an existing file, validates its header and maps every chunk.
    ///
    /// Returns the header as read so callers can inspect flags and the
    /// clean-shutdown marker.
    pub fn open(path: &Path, kind: FileKind, store_version: u32) -> Result<(Self, FileHeader)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| StoreError::io(path, "open", e))
            .wrap_err_with(|| format!("failed to open '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .map_err(|e| StoreError::io(path, "stat", e))?
            .len();

        if file_size < FILE_HEADER_SIZE as u64 {
            return Err(StoreError::HeaderMismatch {
                path: path.to_path_buf(),
                reason: format!("file is only {} bytes", file_size),
            }
            .into());
        }

        let mut raw = [0u8; FILE_HEADER_SIZE];
        file.read_exact(&mut raw)
            .map_err(|e| StoreError::io(path, "read header", e))?;
        let header = FileHeader::read_from(&raw)?;
        header.validate(path, kind, store_version)?;

        let chunk_size = header.chunk_size() as usize;
        if chunk_size < FILE_HEADER_SIZE
            || chunk_size % OS_PAGE_ALIGNMENT != 0
            || file_size % chunk_size as u64 != 0
        {
            return Err(StoreError::HeaderMismatch {
                path: path.to_path_buf(),
                reason: format!(
                    "file size {} does not fit chunk size {}",
                    file_size, chunk_size
                ),
            }
            .into());
        }

        let region = Self::with_file(file, path, chunk_size);
        region.ensure_capacity(file_size)?;
        Ok((region, header))
    }

    fn with_file(file: File, path: &Path, chunk_size: usize) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
            chunk_size,
            chunks: (0..MAX_CHUNKS).map(|_| OnceLock::new()).collect(),
            mapped_chunks: AtomicUsize::new(0),
            grow_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of mapped bytes.
    pub fn len(&self) -> u64 {
        self.mapped_chunks.load(Ordering::Acquire) as u64 * self.chunk_size as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grows the file in whole chunks until at least `bytes` are mapped.
    pub fn ensure_capacity(&self, bytes: u64) -> Result<()> {
        if bytes <= self.len() {
            return Ok(());
        }

        let _guard = self.grow_lock.lock();
        let mapped = self.mapped_chunks.load(Ordering::Acquire);
        let needed = bytes.div_ceil(self.chunk_size as u64) as usize;
        if needed <= mapped {
            return Ok(());
        }
        if needed > MAX_CHUNKS {
            return Err(StoreError::RegionFull {
                path: self.path.clone(),
                limit: MAX_CHUNKS as u64 * self.chunk_size as u64,
            }
            .into());
        }

        let new_len = needed as u64 * self.chunk_size as u64;
        let current_len = self
            .file
            .metadata()
            .map_err(|e| StoreError::io(&self.path, "stat", e))?
            .len();
        if current_len < new_len {
            self.file
                .set_len(new_len)
                .map_err(|e| StoreError::io(&self.path, "extend", e))
                .wrap_err_with(|| {
                    format!("failed to grow '{}' to {} bytes", self.path.display(), new_len)
                })?;
        }

        for index in mapped..needed {
            // The file was just extended to cover this chunk, and the storage
            // root's advisory lock keeps other processes from truncating it.
            let mmap = MmapOptions::new()
                .offset(index as u64 * self.chunk_size as u64)
                .len(self.chunk_size)
                .map_raw(&self.file)
                .map_err(|e| StoreError::io(&self.path, "mmap", e))
                .wrap_err_with(|| {
                    format!("failed to map chunk {} of '{}'", index, self.path.display())
                })?;
            // Only this thread maps chunks at or past `mapped`.
            let _ = self.chunks[index].set(mmap);
        }
        self.mapped_chunks.store(needed, Ordering::Release);

        tracing::debug!(
            path = %self.path.display(),
            chunks = needed,
            bytes = new_len,
            "grew mapped region"
        );
        Ok(())
    }

    #[inline]
    fn chunk(&self, index: usize) -> Option<&MmapRaw> {
        self.chunks.get(index).and_then(OnceLock::get)
    }

    fn out_of_bounds(&self, offset: u64, len: u64) -> eyre::Report {
        StoreError::OutOfBounds {
            path: self.path.clone(),
            offset,
            len,
            mapped: self.len(),
        }
        .into()
    }

    #[inline]
    fn word_ptr(&self, offset: u64, size: u64) -> Result<*mut u8> {
        if offset % size != 0 {
            return Err(StoreError::InvalidArgument(format!(
                "misaligned {}-byte access at offset {} in '{}'",
                size,
                offset,
                self.path.display()
            ))
            .into());
        }
        let chunk_size = self.chunk_size as u64;
        let Some(mmap) = self.chunk((offset / chunk_size) as usize) else {
            return Err(self.out_of_bounds(offset, size));
        };
        // SAFETY: `offset % chunk_size + size <= chunk_size` because chunk
        // sizes are multiples of every word size and `offset` is aligned.
        Ok(unsafe { mmap.as_mut_ptr().add((offset % chunk_size) as usize) })
    }

    #[inline]
    fn atomic_u32(&self, offset: u64) -> Result<&AtomicU32> {
        let ptr = self.word_ptr(offset, 4)?;
        // SAFETY: the pointer is 4-byte aligned (mappings are page aligned and
        // `offset` was checked), in bounds, and lives as long as `&self`.
        Ok(unsafe { &*(ptr as *const AtomicU32) })
    }

    #[inline]
    fn atomic_u64(&self, offset: u64) -> Result<&AtomicU64> {
        let ptr = self.word_ptr(offset, 8)?;
        // SAFETY: as in `atomic_u32`, with 8-byte alignment.
        Ok(unsafe { &*(ptr as *const AtomicU64) })
    }

    #[inline]
    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        Ok(self.atomic_u32(offset)?.load(Ordering::Acquire))
    }

    #[inline]
    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        Ok(self.atomic_u64(offset)?.load(Ordering::Acquire))
    }

    #[inline]
    pub fn write_u32(&self, offset: u64, value: u32) -> Result<()> {
        self.atomic_u32(offset)?.store(value, Ordering::Release);
        Ok(())
    }

    #[inline]
    pub fn write_u64(&self, offset: u64, value: u64) -> Result<()> {
        self.atomic_u64(offset)?.store(value, Ordering::Release);
        Ok(())
    }

    /// Returns `true` when the word held `current` and now holds `new`.
    #[inline]
    pub fn compare_and_swap_u32(&self, offset: u64, current: u32, new: u32) -> Result<bool> {
        Ok(self
            .atomic_u32(offset)?
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    #[inline]
    pub fn compare_and_swap_u64(&self, offset: u64, current: u64, new: u64) -> Result<bool> {
        Ok(self
            .atomic_u64(offset)?
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    /// Adds `delta` and returns the previous value.
    #[inline]
    pub fn fetch_add_u64(&self, offset: u64, delta: u64) -> Result<u64> {
        Ok(self.atomic_u64(offset)?.fetch_add(delta, Ordering::AcqRel))
    }

    /// Subtracts `delta` (wrapping) and returns the previous value.
    #[inline]
    pub fn fetch_sub_u64(&self, offset: u64, delta: u64) -> Result<u64> {
        Ok(self.atomic_u64(offset)?.fetch_sub(delta, Ordering::AcqRel))
    }

    /// Exposes the atomic directly for callers that need explicit orderings
    /// (the record seqlock).
    #[inline]
    pub fn atomic_u32_at(&self, offset: u64) -> Result<&AtomicU32> {
        self.atomic_u32(offset)
    }

    #[inline]
    pub fn atomic_u64_at(&self, offset: u64) -> Result<&AtomicU64> {
        self.atomic_u64(offset)
    }

    /// Copies `buf.len()` bytes starting at `offset`, crossing chunks as needed.
    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| self.out_of_bounds(offset, buf.len() as u64))?;
        if end > self.len() {
            return Err(self.out_of_bounds(offset, buf.len() as u64));
        }

        let chunk_size = self.chunk_size as u64;
        let mut copied = 0usize;
        while copied < buf.len() {
            let at = offset + copied as u64;
            let within = (at % chunk_size) as usize;
            let take = (self.chunk_size - within).min(buf.len() - copied);
            let mmap = self
                .chunk((at / chunk_size) as usize)
                .ok_or_else(|| self.out_of_bounds(at, take as u64))?;
            // SAFETY: `within + take <= chunk_size` and the destination is a
            // distinct heap buffer.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    mmap.as_ptr().add(within),
                    buf[copied..].as_mut_ptr(),
                    take,
                );
            }
            copied += take;
        }
        Ok(())
    }

    /// Writes `data` at `offset`, crossing chunks as needed. The range must
    /// already be mapped.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| self.out_of_bounds(offset, data.len() as u64))?;
        if end > self.len() {
            return Err(self.out_of_bounds(offset, data.len() as u64));
        }

        let chunk_size = self.chunk_size as u64;
        let mut written = 0usize;
        while written < data.len() {
            let at = offset + written as u64;
            let within = (at % chunk_size) as usize;
            let take = (self.chunk_size - within).min(data.len() - written);
            let mmap = self
                .chunk((at / chunk_size) as usize)
                .ok_or_else(|| self.out_of_bounds(at, take as u64))?;
            // SAFETY: `within + take <= chunk_size`; callers only write ranges
            // that no reader can reach until a pointer to them is published.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data[written..].as_ptr(),
                    mmap.as_mut_ptr().add(within),
                    take,
                );
            }
            written += take;
        }
        Ok(())
    }

    /// Zero-copy view of `len` bytes at `offset`. Returns `None` when the
    /// range is unmapped or crosses a chunk boundary.
    pub fn slice(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let chunk_size = self.chunk_size as u64;
        let within = (offset % chunk_size) as usize;
        if within + len > self.chunk_size {
            return None;
        }
        let mmap = self.chunk((offset / chunk_size) as usize)?;
        // SAFETY: the range lies inside one live mapping, which is never
        // unmapped while `&self` is borrowed.
        Some(unsafe { std::slice::from_raw_parts(mmap.as_ptr().add(within), len) })
    }

    pub fn header(&self) -> Result<FileHeader> {
        let mut raw = [0u8; FILE_HEADER_SIZE];
        self.read_bytes(0, &mut raw)?;
        FileHeader::read_from(&raw)
    }

    pub fn set_clean_shutdown(&self, clean: bool) -> Result<()> {
        self.write_u32(CLEAN_SHUTDOWN_OFFSET, clean as u32)
    }

    pub fn flush(&self) -> Result<()> {
        let mapped = self.mapped_chunks.load(Ordering::Acquire);
        for index in 0..mapped {
            if let Some(mmap) = self.chunk(index) {
                mmap.flush()
                    .map_err(|e| StoreError::io(&self.path, "flush", e))
                    .wrap_err_with(|| {
                        format!("failed to flush chunk {} of '{}'", index, self.path.display())
                    })?;
            }
        }
        Ok(())
    }
}
