//! Public per-disk handle: orchestrates the descriptor, extent table,
//! and sparse readers, and composes parent-chain reads (`spec.md` §4.9,
//! §4.10, §5; C9/C10).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::descriptor::{parse_descriptor, VmdkDescriptor};
use crate::error::{Error, Result};
use crate::extent_table::ExtentTable;
use crate::pool::BackingPool;
use crate::sparse::cache::{DEFAULT_GRAIN_DATA_CACHE_SIZE, DEFAULT_GRAIN_TABLE_CACHE_SIZE};
use crate::sparse::SparseExtentReader;
use crate::types::ExtentType;

/// Maximum parent-chain depth before `ParentChainTooDeep` (`spec.md` §4.10).
pub const MAX_PARENT_CHAIN_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Mounted,
    Closed,
}

/// Construction-time tunables for `Handle::open_with_options`: the two
/// direct-mapped cache capacities (C5/C6) and the parent-chain depth
/// bound, mirroring `ExportOptions`'s `Default`-plus-named-constructor
/// shape.
#[derive(Debug, Clone, Copy)]
pub struct HandleOptions {
    pub grain_table_cache_size: usize,
    pub grain_data_cache_size: usize,
    pub max_parent_chain_depth: usize,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            grain_table_cache_size: DEFAULT_GRAIN_TABLE_CACHE_SIZE,
            grain_data_cache_size: DEFAULT_GRAIN_DATA_CACHE_SIZE,
            max_parent_chain_depth: MAX_PARENT_CHAIN_DEPTH,
        }
    }
}

impl HandleOptions {
    /// Override the two cache capacities, leaving the chain-depth bound
    /// at its default.
    pub fn with_cache_sizes(grain_table_cache_size: usize, grain_data_cache_size: usize) -> Self {
        Self {
            grain_table_cache_size,
            grain_data_cache_size,
            ..Self::default()
        }
    }
}

/// A read-only handle onto one VMDK image, optionally backed by a
/// parent chain (`spec.md` §4.9).
pub struct Handle {
    descriptor: VmdkDescriptor,
    pool: Arc<dyn BackingPool>,
    extent_table: ExtentTable,
    sparse_readers: Vec<Option<SparseExtentReader>>,
    parent: Option<Box<Handle>>,
    hole_resolved: bool,
    position: u64,
    state: State,
    abort_requested: Arc<AtomicBool>,
    /// Length of the parent chain rooted at this handle (0 until a
    /// parent is attached), used to enforce `max_parent_chain_depth`.
    chain_depth: usize,
    max_parent_chain_depth: usize,
}

impl Handle {
    /// Equivalent to `open_with_options` with `HandleOptions::default()`.
    pub fn open(descriptor_bytes: &[u8], pool: Arc<dyn BackingPool>) -> Result<Self> {
        Self::open_with_options(descriptor_bytes, pool, HandleOptions::default())
    }

    /// Parse `descriptor_bytes`, attach `pool` (indexed in descriptor
    /// extent order), validate that every non-ZERO, readable extent has
    /// a backing index, and finalize geometry, leaving the handle
    /// `Mounted` and ready for `read_at` (§4.10). `options` sizes the
    /// per-extent grain caches (C5/C6) and bounds the parent-chain depth.
    pub fn open_with_options(
        descriptor_bytes: &[u8],
        pool: Arc<dyn BackingPool>,
        options: HandleOptions,
    ) -> Result<Self> {
        let text = std::str::from_utf8(descriptor_bytes).map_err(|_| {
            Error::malformed_descriptor(0, "descriptor is not valid UTF-8")
        })?;
        let mut descriptor = parse_descriptor(text)?;

        for (i, extent) in descriptor.extents.iter_mut().enumerate() {
            if extent.extent_type == ExtentType::Zero {
                continue;
            }
            if !extent.access.is_readable() {
                continue;
            }
            let filename = extent.filename.as_deref().ok_or_else(|| {
                Error::malformed_descriptor(0, format!("extent {} has no filename", i))
            })?;
            if !pool.is_open(i as u32) {
                return Err(Error::BackingMissing {
                    filename: filename.to_string(),
                });
            }
            extent.backing_index = Some(i as u32);
        }

        let extent_table = ExtentTable::new(descriptor.extents.clone());

        let mut sparse_readers = Vec::with_capacity(extent_table.extents().len());
        for (i, extent) in extent_table.extents().iter().enumerate() {
            if extent.extent_type.is_sparse() {
                let backing_index = extent.backing_index.ok_or_else(|| {
                    Error::malformed_descriptor(0, format!("sparse extent {} has no backing file", i))
                })?;
                let size_bytes = pool.size(backing_index)?;
                let reader = SparseExtentReader::open(
                    i,
                    pool.as_ref(),
                    backing_index,
                    size_bytes / 512,
                    options.grain_table_cache_size,
                    options.grain_data_cache_size,
                )?;
                sparse_readers.push(Some(reader));
            } else {
                sparse_readers.push(None);
            }
        }

        // parentFileNameHint names the parent descriptor but resolving it to
        // bytes and a BackingPool is the caller's job; see set_parent.
        Ok(Handle {
            descriptor,
            pool,
            extent_table,
            sparse_readers,
            parent: None,
            hole_resolved: false,
            position: 0,
            state: State::Mounted,
            abort_requested: Arc::new(AtomicBool::new(false)),
            chain_depth: 0,
            max_parent_chain_depth: options.max_parent_chain_depth,
        })
    }

    pub fn media_size(&self) -> u64 {
        self.extent_table.media_size()
    }

    pub fn content_identifier(&self) -> u32 {
        self.descriptor.content_identifier
    }

    pub fn parent_content_identifier(&self) -> Option<u32> {
        self.descriptor.parent_content_identifier
    }

    pub fn descriptor(&self) -> &VmdkDescriptor {
        &self.descriptor
    }

    /// Attach `parent` as this handle's parent level. Rejected once a
    /// hole has already been resolved without a parent, or if the
    /// parent's CID doesn't match this handle's recorded `parentCID`
    /// (`spec.md` §4.9/§4.10).
    pub fn set_parent(&mut self, parent: Handle) -> Result<()> {
        if self.hole_resolved {
            return Err(Error::ParentSetTooLate);
        }
        let expected = self.descriptor.parent_content_identifier;
        if let Some(expected_cid) = expected {
            if parent.content_identifier() != expected_cid {
                return Err(Error::ParentCidMismatch {
                    expected: expected_cid,
                    actual: parent.content_identifier(),
                });
            }
        }
        let new_depth = parent.chain_depth + 1;
        if new_depth > self.max_parent_chain_depth {
            return Err(Error::ParentChainTooDeep {
                limit: self.max_parent_chain_depth,
            });
        }
        self.chain_depth = new_depth;
        self.parent = Some(Box::new(parent));
        Ok(())
    }

    /// Request that the next backing-pool read be interrupted, causing
    /// the in-flight `read_at` to return `Aborted` (`spec.md` §5).
    pub fn signal_abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
    }

    fn check_abort(&self) -> Result<()> {
        if self.abort_requested.swap(false, Ordering::SeqCst) {
            return Err(Error::Aborted);
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes starting at logical byte `offset`,
    /// per the algorithm in `spec.md` §4.9. Returns the number of bytes
    /// actually copied; fewer than `buf.len()` only at end-of-media.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if self.state != State::Mounted {
            return Err(Error::OutOfRange);
        }
        let media_size = self.media_size();
        let mut offset = offset;
        let mut copied = 0usize;

        while copied < buf.len() && offset < media_size {
            self.check_abort()?;

            let extent_idx = self
                .extent_table
                .locate(offset)
                .ok_or(Error::OutOfRange)?;
            let extent = &self.extent_table.extents()[extent_idx];
            let extent_start_bytes = extent.logical_start_sector * 512;
            let extent_rel = offset - extent_start_bytes;
            let extent_len_bytes = extent.size_sectors * 512;
            let to_copy = std::cmp::min(
                (buf.len() - copied) as u64,
                extent_len_bytes - extent_rel,
            ) as usize;
            let dest = &mut buf[copied..copied + to_copy];

            match extent.extent_type {
                ExtentType::Flat | ExtentType::Vmfs | ExtentType::VmfsRaw | ExtentType::VmfsRdm => {
                    let backing_index = extent.backing_index.ok_or(Error::BackingMissing {
                        filename: extent.filename.clone().unwrap_or_default(),
                    })?;
                    let phys_offset = extent.offset_sectors * 512 + extent_rel;
                    self.pool
                        .read_at(backing_index, phys_offset, dest)
                        .map_err(|e| Error::backing_io(backing_index, phys_offset, e.to_string()))?;
                }
                ExtentType::Zero => {
                    if let Some(parent) = self.parent.as_mut() {
                        parent.read_at(offset, dest)?;
                    } else {
                        dest.fill(0);
                        self.hole_resolved = true;
                    }
                }
                ExtentType::Sparse | ExtentType::VmfsSparse => {
                    let pool = self.pool.clone();
                    let reader = self.sparse_readers[extent_idx]
                        .as_mut()
                        .expect("sparse extent must have a SparseExtentReader");
                    let mut parent = self.parent.as_deref_mut();
                    let mut zero_filled_without_parent = false;
                    reader.read(pool.as_ref(), extent_rel, dest, |hole_dest, hole_extent_rel| {
                        match parent.as_mut() {
                            Some(parent) => {
                                let absolute = extent_start_bytes + hole_extent_rel;
                                parent.read_at(absolute, hole_dest)?;
                            }
                            None => {
                                hole_dest.fill(0);
                                zero_filled_without_parent = true;
                            }
                        }
                        Ok(())
                    })?;
                    if zero_filled_without_parent {
                        self.hole_resolved = true;
                    }
                }
            }

            copied += to_copy;
            offset += to_copy as u64;
        }

        Ok(copied)
    }

    /// Seek to `offset` (from the start of the logical disk) and return
    /// the new position. Negative offsets are rejected as `OutOfRange`;
    /// `seek`/`tell` take whole-disk absolute offsets only (no
    /// whence-relative modes, since the core has no file-descriptor
    /// concept beyond the handle itself).
    pub fn seek(&mut self, offset: u64) -> Result<u64> {
        self.position = offset;
        Ok(self.position)
    }

    pub fn tell(&self) -> u64 {
        self.position
    }

    /// Release the backing-pool reference and empty both caches.
    /// Further reads return `OutOfRange`.
    pub fn close(&mut self) {
        self.sparse_readers.clear();
        self.parent = None;
        self.state = State::Closed;
    }
}
