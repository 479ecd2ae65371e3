//! Grain directory / grain table loader (`spec.md` §4.4, C4).

use crate::error::{Error, Result};
use crate::pool::BackingPool;
use crate::sparse::header::{SparseHeader, SECTOR_SIZE};

/// A loaded grain directory: a vector of sector offsets to grain tables;
/// zero means "grain table not allocated".
#[derive(Debug, Clone)]
pub struct GrainDirectory {
    pub entries: Vec<u32>,
}

/// A loaded grain table: `number_of_grain_table_entries` sector offsets;
/// zero means "grain is sparse".
#[derive(Debug, Clone)]
pub struct GrainTable {
    pub entries: Vec<u32>,
}

impl GrainTable {
    /// An all-zero table synthesized for an unallocated grain-directory entry.
    fn synthetic(len: usize) -> Self {
        GrainTable {
            entries: vec![0; len],
        }
    }
}

/// Read the grain directory for a sparse extent, failing over from the
/// primary location to the secondary one if the primary is zero-length
/// or fails validation (`spec.md` §4.3 final paragraph).
pub fn load_grain_directory(
    extent_index: usize,
    pool: &dyn BackingPool,
    backing_index: u32,
    header: &SparseHeader,
) -> Result<GrainDirectory> {
    let num_entries = header.num_grain_directory_entries() as usize;

    match read_grain_directory_at(
        pool,
        backing_index,
        header.primary_grain_directory_sector,
        num_entries,
    ) {
        Ok(gd) if !gd.entries.is_empty() || num_entries == 0 => Ok(gd),
        primary_result => {
            if header.use_secondary_grain_directory() && header.secondary_grain_directory_sector != 0
            {
                log::warn!(
                    "extent {}: primary grain directory unusable, falling back to secondary",
                    extent_index
                );
                read_grain_directory_at(
                    pool,
                    backing_index,
                    header.secondary_grain_directory_sector,
                    num_entries,
                )
            } else {
                primary_result.map_err(|e| {
                    Error::corrupt_grain_table(extent_index, 0, format!("grain directory unreadable: {}", e))
                })
            }
        }
    }
}

fn read_grain_directory_at(
    pool: &dyn BackingPool,
    backing_index: u32,
    gd_sector: u64,
    num_entries: usize,
) -> Result<GrainDirectory> {
    let byte_len = num_entries * 4;
    let mut buf = vec![0u8; byte_len];
    let offset = gd_sector * SECTOR_SIZE;
    let n = pool
        .read_at(backing_index, offset, &mut buf)
        .map_err(|e| Error::backing_io(backing_index, offset, e.to_string()))?;
    if n < byte_len {
        return Err(Error::backing_io(
            backing_index,
            offset,
            "short read while loading grain directory",
        ));
    }
    let entries = buf
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    Ok(GrainDirectory { entries })
}

/// Load grain table `gd_index` for `extent_index`, per `spec.md` §4.4.
/// Returns a synthetic all-zero table when the grain-directory entry is
/// zero (grain table not allocated).
pub fn load_grain_table(
    extent_index: usize,
    pool: &dyn BackingPool,
    backing_index: u32,
    header: &SparseHeader,
    grain_directory: &GrainDirectory,
    gd_index: u64,
) -> Result<GrainTable> {
    let gte_count = header.number_of_grain_table_entries as usize;
    let gt_sector = *grain_directory
        .entries
        .get(gd_index as usize)
        .ok_or_else(|| {
            Error::corrupt_grain_table(extent_index, gd_index, "grain directory index out of range")
        })?;

    if gt_sector == 0 {
        return Ok(GrainTable::synthetic(gte_count));
    }

    let backing_size = pool
        .size(backing_index)
        .map_err(|e| Error::corrupt_grain_table(extent_index, gd_index, e.to_string()))?;

    let byte_len = gte_count * 4;
    let offset = gt_sector as u64 * SECTOR_SIZE;
    if offset + byte_len as u64 > backing_size {
        return Err(Error::corrupt_grain_table(
            extent_index,
            gd_index,
            "grain table sector offset lies outside backing file",
        ));
    }

    let mut buf = vec![0u8; byte_len];
    let n = pool
        .read_at(backing_index, offset, &mut buf)
        .map_err(|e| Error::corrupt_grain_table(extent_index, gd_index, e.to_string()))?;
    if n < byte_len {
        return Err(Error::corrupt_grain_table(
            extent_index,
            gd_index,
            "short read while loading grain table",
        ));
    }

    let entries: Vec<u32> = buf
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();

    for &entry in &entries {
        if entry == 0 {
            continue;
        }
        let grain_offset_bytes = entry as u64 * SECTOR_SIZE;
        if grain_offset_bytes >= backing_size {
            return Err(Error::corrupt_grain_table(
                extent_index,
                gd_index,
                format!("grain table entry {} lies outside backing file", entry),
            ));
        }
    }

    Ok(GrainTable { entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::VecPool;
    use crate::sparse::header::HeaderFormat;

    fn test_header(grain_size: u64, gtes_per_gt: u32, gd_sector: u64) -> SparseHeader {
        test_header_with_capacity(grain_size, gtes_per_gt, gd_sector, grain_size * gtes_per_gt as u64 * 2)
    }

    fn test_header_with_capacity(
        grain_size: u64,
        gtes_per_gt: u32,
        gd_sector: u64,
        capacity_sectors: u64,
    ) -> SparseHeader {
        SparseHeader {
            format: HeaderFormat::Kdmv,
            version: 1,
            flags: 0,
            capacity_sectors,
            grain_size_sectors: grain_size,
            descriptor_offset_sectors: 0,
            descriptor_size_sectors: 0,
            number_of_grain_table_entries: gtes_per_gt,
            secondary_grain_directory_sector: 0,
            primary_grain_directory_sector: gd_sector,
            overhead_sectors: 0,
            compression: crate::sparse::header::Compression::None,
        }
    }

    #[test]
    fn loads_grain_directory_entries() {
        let mut pool = VecPool::new();
        let mut data = vec![0u8; 4096];
        data[512..516].copy_from_slice(&100u32.to_le_bytes());
        data[516..520].copy_from_slice(&0u32.to_le_bytes());
        let idx = pool.push(data);

        let header = test_header(128, 512, 1);
        let gd = load_grain_directory(0, &pool, idx, &header).unwrap();
        assert_eq!(gd.entries, vec![100, 0]);
    }

    #[test]
    fn zero_directory_entry_yields_synthetic_table() {
        let mut pool = VecPool::new();
        pool.push(vec![0u8; 512]);
        let header = test_header(128, 4, 1);
        let gd = GrainDirectory { entries: vec![0] };
        let gt = load_grain_table(0, &pool, 0, &header, &gd, 0).unwrap();
        assert_eq!(gt.entries, vec![0, 0, 0, 0]);
    }

    #[test]
    fn loads_nonzero_grain_table_entries() {
        let mut pool = VecPool::new();
        let mut data = vec![0u8; 1024 + 16];
        // Grain table lives at sector 2 (offset 1024).
        data[1024..1028].copy_from_slice(&500u32.to_le_bytes());
        data[1028..1032].copy_from_slice(&0u32.to_le_bytes());
        data[1032..1036].copy_from_slice(&600u32.to_le_bytes());
        data[1036..1040].copy_from_slice(&0u32.to_le_bytes());
        let idx = pool.push(data);

        let header = test_header(128, 4, 0);
        let gd = GrainDirectory { entries: vec![2] };
        let gt = load_grain_table(0, &pool, idx, &header, &gd, 0).unwrap();
        assert_eq!(gt.entries, vec![500, 0, 600, 0]);
    }

    #[test]
    fn rejects_grain_table_entry_beyond_backing_file() {
        let mut pool = VecPool::new();
        let mut data = vec![0u8; 1024 + 16];
        data[1024..1028].copy_from_slice(&10_000_000u32.to_le_bytes());
        let idx = pool.push(data);

        let header = test_header(128, 1, 0);
        let gd = GrainDirectory { entries: vec![2] };
        let err = load_grain_table(0, &pool, idx, &header, &gd, 0).unwrap_err();
        assert!(matches!(err, Error::CorruptGrainTable { .. }));
    }

    #[test]
    fn rejects_gd_index_out_of_range() {
        let pool = VecPool::new();
        let header = test_header(128, 4, 0);
        let gd = GrainDirectory { entries: vec![] };
        assert!(load_grain_table(0, &pool, 0, &header, &gd, 5).is_err());
    }
}
