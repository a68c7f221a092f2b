//! `SharedRegion`: a fixed-size byte buffer shared across worker threads or
//! worker processes.
//!
//! When only in-process threads are used a plain heap allocation is enough;
//! when child processes are requested the region must live in memory that
//! both processes can map, so it is backed by a temp file via
//! `memmap2::MmapMut`. Both variants expose the same raw-pointer access so
//! `ChunkSlot`'s typed views don't need to know which backing is in use.
//!
//! Safety: callers obtain disjoint byte ranges (one per typed view) and rely
//! on `ChunkSlot`'s state machine / task-lock to guarantee that only one
//! worker ever holds a mutable view into a given range at a time. This
//! mirrors the `UnsafeCell`-backed slot pool pattern used for generic object
//! pools elsewhere in the ecosystem: the container hands out raw access and
//! documents, rather than enforces, the exclusivity invariant.

use std::fs::File;
use std::path::Path;

use memmap2::MmapMut;

use crate::error::{DcnumError, Result};

enum Backing {
    Heap(Box<[u8]>),
    Mapped(MmapMut, File),
}

pub struct SharedRegion {
    backing: Backing,
    len: usize,
}

unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// A heap-backed region, usable only within a single process.
    pub fn heap(len: usize) -> Self {
        Self {
            backing: Backing::Heap(vec![0u8; len].into_boxed_slice()),
            len,
        }
    }

    /// A temp-file-backed region mapped into this process, visible to any
    /// child process that maps the same file path.
    pub fn mapped_at(path: &Path, len: usize) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| DcnumError::Storage(format!("cannot create shared region file: {e}")))?;
        file.set_len(len as u64)
            .map_err(|e| DcnumError::Storage(format!("cannot size shared region file: {e}")))?;
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|e| DcnumError::Storage(format!("cannot mmap shared region: {e}")))?
        };
        Ok(Self {
            backing: Backing::Mapped(mmap, file),
            len,
        })
    }

    /// Attach to an already-created mapped region by path, for a child
    /// process joining an existing `SharedRegion`.
    pub fn attach(path: &Path, len: usize) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| DcnumError::Storage(format!("cannot open shared region file: {e}")))?;
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|e| DcnumError::Storage(format!("cannot mmap shared region: {e}")))?
        };
        Ok(Self {
            backing: Backing::Mapped(mmap, file),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn as_ptr(&self) -> *const u8 {
        match &self.backing {
            Backing::Heap(b) => b.as_ptr(),
            Backing::Mapped(m, _) => m.as_ptr(),
        }
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        match &self.backing {
            Backing::Heap(b) => b.as_ptr() as *mut u8,
            Backing::Mapped(m, _) => m.as_ptr() as *mut u8,
        }
    }

    /// Borrow `len` bytes at `offset` as an immutable slice.
    ///
    /// # Safety
    /// The caller must ensure `offset + len <= self.len()` and that no
    /// other code holds a mutable view overlapping this range.
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len);
        std::slice::from_raw_parts(self.as_ptr().add(offset), len)
    }

    /// Borrow `len` bytes at `offset` as a mutable slice.
    ///
    /// # Safety
    /// The caller must ensure `offset + len <= self.len()` and exclusive
    /// access to this range for the lifetime of the returned slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.len);
        std::slice::from_raw_parts_mut(self.as_mut_ptr().add(offset), len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_region_round_trips_bytes() {
        let region = SharedRegion::heap(16);
        unsafe {
            let w = region.slice_mut(4, 4);
            w.copy_from_slice(&[1, 2, 3, 4]);
        }
        unsafe {
            assert_eq!(region.slice(4, 4), &[1, 2, 3, 4]);
        }
    }

    #[test]
    fn mapped_region_persists_across_attach() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.bin");
        {
            let region = SharedRegion::mapped_at(&path, 8).unwrap();
            unsafe {
                region.slice_mut(0, 8).copy_from_slice(&[9u8; 8]);
            }
        }
        let attached = SharedRegion::attach(&path, 8).unwrap();
        unsafe {
            assert_eq!(attached.slice(0, 8), &[9u8; 8]);
        }
    }
}
