//! Backing I/O interface (`spec.md` §4.1/§6.1, C1) and its ambient default
//! implementation.
//!
//! The core never opens files itself. It consumes a [`BackingPool`]
//! supplying, per backing-file index, `read_at`/`size`/`is_open`. Callers
//! attach backing storage eagerly (one pool entry per extent, in
//! descriptor order) or via their own lazy filename resolver; either way
//! they hand the core a `&dyn BackingPool`, never a path.
//!
//! [`FilePool`] is the one concrete implementation this crate ships: a
//! `memmap2`-backed read-only view over a fixed list of paths, directly
//! descended from the teacher's `VmdkReader` (`ovatool-core/src/vmdk/reader.rs`).
//! It covers the common single-process, local-filesystem case; anything
//! more exotic (lazy resolution, network-backed extents) is the caller's
//! responsibility per `spec.md` §1.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::{Error, Result};

/// Abstracts reading bytes from one of many backing files identified by
/// index (`spec.md` §6.1).
pub trait BackingPool: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset` into `buf`,
    /// returning the number of bytes actually read. A short read is only
    /// permitted at end-of-file; the pool must retry internal short reads.
    fn read_at(&self, index: u32, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Total size in bytes of the backing file at `index`.
    fn size(&self, index: u32) -> Result<u64>;

    /// Whether `index` names a backing file this pool can serve.
    fn is_open(&self, index: u32) -> bool;
}

/// A read-only, `memmap2`-backed [`BackingPool`] over a fixed list of
/// filesystem paths, indexed in the order supplied.
pub struct FilePool {
    entries: Vec<Mapped>,
}

struct Mapped {
    #[allow(dead_code)]
    file: File,
    mmap: Arc<Mmap>,
    path: PathBuf,
}

impl FilePool {
    /// Open and memory-map every path in `paths`, in order; the resulting
    /// pool indexes them `0..paths.len()`.
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut entries = Vec::with_capacity(paths.len());
        for p in paths {
            let path = p.as_ref();
            let file = File::open(path).map_err(|e| Error::io(e, path))?;
            // Safety: read-only mapping of a file we just opened ourselves;
            // the mapping's lifetime is tied to the Arc, not the handle.
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(e, path))?;
            entries.push(Mapped {
                file,
                mmap: Arc::new(mmap),
                path: path.to_path_buf(),
            });
        }
        log::debug!("FilePool opened {} backing file(s)", entries.len());
        Ok(Self { entries })
    }

    /// Path of the backing file at `index`, for diagnostics.
    pub fn path(&self, index: u32) -> Option<&Path> {
        self.entries.get(index as usize).map(|e| e.path.as_path())
    }
}

impl BackingPool for FilePool {
    fn read_at(&self, index: u32, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let entry = self
            .entries
            .get(index as usize)
            .ok_or_else(|| Error::backing_io(index, offset, "no such backing index"))?;
        let data = &entry.mmap[..];
        let start = offset as usize;
        if start >= data.len() {
            return Ok(0);
        }
        let end = std::cmp::min(data.len(), start + buf.len());
        let n = end - start;
        buf[..n].copy_from_slice(&data[start..end]);
        Ok(n)
    }

    fn size(&self, index: u32) -> Result<u64> {
        self.entries
            .get(index as usize)
            .map(|e| e.mmap.len() as u64)
            .ok_or_else(|| Error::backing_io(index, 0, "no such backing index"))
    }

    fn is_open(&self, index: u32) -> bool {
        (index as usize) < self.entries.len()
    }
}

/// A simple in-memory [`BackingPool`] over owned byte buffers, used by
/// this crate's own tests (and available to consumers for synthetic
/// images or pure in-memory composition).
#[derive(Default)]
pub struct VecPool {
    entries: Vec<Vec<u8>>,
}

impl VecPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a backing buffer, returning its assigned index.
    pub fn push(&mut self, data: Vec<u8>) -> u32 {
        self.entries.push(data);
        (self.entries.len() - 1) as u32
    }
}

impl BackingPool for VecPool {
    fn read_at(&self, index: u32, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self
            .entries
            .get(index as usize)
            .ok_or_else(|| Error::backing_io(index, offset, "no such backing index"))?;
        let start = offset as usize;
        if start >= data.len() {
            return Ok(0);
        }
        let end = std::cmp::min(data.len(), start + buf.len());
        let n = end - start;
        buf[..n].copy_from_slice(&data[start..end]);
        Ok(n)
    }

    fn size(&self, index: u32) -> Result<u64> {
        self.entries
            .get(index as usize)
            .map(|e| e.len() as u64)
            .ok_or_else(|| Error::backing_io(index, 0, "no such backing index"))
    }

    fn is_open(&self, index: u32) -> bool {
        (index as usize) < self.entries.len()
    }
}
