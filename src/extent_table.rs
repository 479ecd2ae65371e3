//! Logical-offset to extent lookup (`spec.md` §4.8, C8).
//!
//! Built once at open from the descriptor's finalized extent list;
//! never mutated afterward. Lookups try a cached last-hit extent first
//! (workloads are usually spatially local) and fall back to a binary
//! search over the sorted `logical_start_sector` values.

use std::cell::Cell;

use crate::descriptor::Extent;

/// Maps a logical byte offset to the extent covering it.
pub struct ExtentTable {
    extents: Vec<Extent>,
    starts: Vec<u64>,
    last_extent: Cell<usize>,
}

impl ExtentTable {
    /// Build the table from a descriptor's already-finalized extent
    /// list (`logical_start_sector` populated).
    pub fn new(extents: Vec<Extent>) -> Self {
        let starts = extents.iter().map(|e| e.logical_start_sector).collect();
        ExtentTable {
            extents,
            starts,
            last_extent: Cell::new(0),
        }
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    pub fn media_size(&self) -> u64 {
        self.extents
            .iter()
            .map(|e| e.size_sectors * 512)
            .sum()
    }

    /// Locate the extent covering logical byte `offset`. `offset` must
    /// be `< media_size()`.
    pub fn locate(&self, offset: u64) -> Option<usize> {
        let sector = offset / 512;

        let last = self.last_extent.get();
        if last < self.extents.len() && self.covers(last, sector) {
            return Some(last);
        }

        let idx = self.binary_search(sector)?;
        self.last_extent.set(idx);
        Some(idx)
    }

    fn covers(&self, idx: usize, sector: u64) -> bool {
        let e = &self.extents[idx];
        sector >= e.logical_start_sector && sector < e.logical_start_sector + e.size_sectors
    }

    fn binary_search(&self, sector: u64) -> Option<usize> {
        match self.starts.binary_search(&sector) {
            Ok(idx) => Some(idx),
            Err(0) => None,
            Err(idx) => {
                let candidate = idx - 1;
                if self.covers(candidate, sector) {
                    Some(candidate)
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccessMode, ExtentType};

    fn extent(start: u64, size: u64) -> Extent {
        Extent {
            access: AccessMode::ReadWrite,
            extent_type: ExtentType::Flat,
            filename: Some("x.vmdk".to_string()),
            offset_sectors: 0,
            size_sectors: size,
            logical_start_sector: start,
            backing_index: Some(0),
        }
    }

    #[test]
    fn locates_within_single_extent() {
        let table = ExtentTable::new(vec![extent(0, 100)]);
        assert_eq!(table.locate(0), Some(0));
        assert_eq!(table.locate(51199), Some(0));
    }

    #[test]
    fn locates_across_multiple_extents() {
        let table = ExtentTable::new(vec![extent(0, 100), extent(100, 50), extent(150, 200)]);
        assert_eq!(table.locate(0), Some(0));
        assert_eq!(table.locate(100 * 512), Some(1));
        assert_eq!(table.locate(149 * 512), Some(1));
        assert_eq!(table.locate(150 * 512), Some(2));
        assert_eq!(table.locate(349 * 512), Some(2));
    }

    #[test]
    fn offset_past_media_size_returns_none() {
        let table = ExtentTable::new(vec![extent(0, 100)]);
        assert_eq!(table.locate(100 * 512), None);
    }

    #[test]
    fn repeated_lookups_hit_cached_last_extent() {
        let table = ExtentTable::new(vec![extent(0, 100), extent(100, 100)]);
        assert_eq!(table.locate(50 * 512), Some(0));
        assert_eq!(table.locate(60 * 512), Some(0)); // should hit the cache, not rebinary-search
        assert_eq!(table.locate(150 * 512), Some(1));
    }

    #[test]
    fn media_size_sums_extent_bytes() {
        let table = ExtentTable::new(vec![extent(0, 100), extent(100, 50)]);
        assert_eq!(table.media_size(), 150 * 512);
    }
}
