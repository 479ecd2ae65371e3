//! Sparse-extent header codec (`spec.md` §4.3, C3).
//!
//! Two on-disk header formats are recognized: `KDMV` (covers
//! monolithicSparse, twoGbMaxExtentSparse, and streamOptimized) and `COWD`
//! (VMFS-sparse). Both are fixed 512-byte little-endian structures at the
//! start of a sparse extent.

use crate::error::{Error, Result};

/// `"KDMV"` read as a little-endian `u32`.
pub const VMDK_MAGIC: u32 = 0x564d_444b;
/// `"COWD"` read as a little-endian `u32`.
pub const COWD_MAGIC: u32 = 0x4457_4f43;

pub const SECTOR_SIZE: u64 = 512;

const FLAG_VALID_NEWLINE: u32 = 1 << 0;
const FLAG_USE_SECONDARY_GRAIN_DIR: u32 = 1 << 1;
const FLAG_HAS_GRAIN_COMPRESSION: u32 = 1 << 16;
const FLAG_HAS_MARKERS: u32 = 1 << 17;

const NEWLINE_TEST: [u8; 4] = [b'\n', b' ', b'\r', b'\n'];

/// Compression algorithm named in a `KDMV` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Deflate,
}

/// The family a sparse header belongs to; determines the grain-table
/// fan-out (fixed at 4096 for COWD, header-specified for KDMV).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderFormat {
    Kdmv,
    Cowd,
}

/// Parsed and validated sparse-extent header (`spec.md` §3).
#[derive(Debug, Clone)]
pub struct SparseHeader {
    pub format: HeaderFormat,
    pub version: u32,
    pub flags: u32,
    pub capacity_sectors: u64,
    pub grain_size_sectors: u64,
    pub descriptor_offset_sectors: u64,
    pub descriptor_size_sectors: u64,
    pub number_of_grain_table_entries: u32,
    pub secondary_grain_directory_sector: u64,
    pub primary_grain_directory_sector: u64,
    pub overhead_sectors: u64,
    pub compression: Compression,
}

impl SparseHeader {
    pub fn has_valid_newline_test(&self) -> bool {
        self.flags & FLAG_VALID_NEWLINE != 0
    }

    pub fn use_secondary_grain_directory(&self) -> bool {
        self.flags & FLAG_USE_SECONDARY_GRAIN_DIR != 0
    }

    pub fn has_grain_compression(&self) -> bool {
        self.flags & FLAG_HAS_GRAIN_COMPRESSION != 0 || self.compression != Compression::None
    }

    pub fn has_markers(&self) -> bool {
        self.flags & FLAG_HAS_MARKERS != 0
    }

    pub fn grain_size_bytes(&self) -> u64 {
        self.grain_size_sectors * SECTOR_SIZE
    }

    /// Number of grain directory entries covering the extent's logical
    /// `capacity_sectors` (`spec.md` §4.4 — note this is the header's
    /// declared capacity, not the physical backing file's size, which
    /// may be much smaller for a thinly-allocated disk).
    pub fn num_grain_directory_entries(&self) -> u64 {
        let grains_per_gt = self.grain_size_sectors * self.number_of_grain_table_entries as u64;
        if grains_per_gt == 0 {
            return 0;
        }
        (self.capacity_sectors + grains_per_gt - 1) / grains_per_gt
    }

    /// Parse and validate a 512-byte sparse header, trying `KDMV` first and
    /// falling back to `COWD`. `extent_size_sectors` is the backing file's
    /// size in sectors, used to bound-check `overhead_sectors` and the
    /// grain-directory location.
    pub fn parse(extent_index: usize, data: &[u8], extent_size_sectors: u64) -> Result<Self> {
        if data.len() < 512 {
            return Err(Error::sparse_header(extent_index, "header shorter than 512 bytes"));
        }
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let header = match magic {
            VMDK_MAGIC => Self::parse_kdmv(extent_index, data)?,
            COWD_MAGIC => Self::parse_cowd(extent_index, data)?,
            other => {
                return Err(Error::sparse_header(
                    extent_index,
                    format!("unrecognized magic 0x{:08x}", other),
                ))
            }
        };
        header.validate(extent_index, extent_size_sectors)?;
        Ok(header)
    }

    fn parse_kdmv(extent_index: usize, data: &[u8]) -> Result<Self> {
        let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
        let flags = u32::from_le_bytes(data[8..12].try_into().unwrap());
        let capacity_sectors = u64::from_le_bytes(data[12..20].try_into().unwrap());
        let grain_size_sectors = u64::from_le_bytes(data[20..28].try_into().unwrap());
        let descriptor_offset_sectors = u64::from_le_bytes(data[28..36].try_into().unwrap());
        let descriptor_size_sectors = u64::from_le_bytes(data[36..44].try_into().unwrap());
        let number_of_grain_table_entries = u32::from_le_bytes(data[44..48].try_into().unwrap());
        let secondary_grain_directory_sector = u64::from_le_bytes(data[48..56].try_into().unwrap());
        let primary_grain_directory_sector = u64::from_le_bytes(data[56..64].try_into().unwrap());
        let overhead_sectors = u64::from_le_bytes(data[64..72].try_into().unwrap());
        // Offset 72: is_dirty (u8); 73..77: newline test bytes; 77..79: compression algorithm.
        let newline_bytes: [u8; 4] = data[73..77].try_into().unwrap();
        let compress_algorithm = u16::from_le_bytes(data[77..79].try_into().unwrap());

        if !(1..=3).contains(&version) {
            return Err(Error::sparse_header(
                extent_index,
                format!("unsupported KDMV version {}", version),
            ));
        }
        let has_valid_newline = flags & FLAG_VALID_NEWLINE != 0;
        if has_valid_newline && newline_bytes != NEWLINE_TEST {
            return Err(Error::sparse_header(
                extent_index,
                "newline detection test bytes do not match; file likely corrupted by ASCII/binary transfer",
            ));
        }
        let compression = match compress_algorithm {
            0 => Compression::None,
            1 => Compression::Deflate,
            other => {
                return Err(Error::sparse_header(
                    extent_index,
                    format!("unsupported compression algorithm {}", other),
                ))
            }
        };

        Ok(SparseHeader {
            format: HeaderFormat::Kdmv,
            version,
            flags,
            capacity_sectors,
            grain_size_sectors,
            descriptor_offset_sectors,
            descriptor_size_sectors,
            number_of_grain_table_entries,
            secondary_grain_directory_sector,
            primary_grain_directory_sector,
            overhead_sectors,
            compression,
        })
    }

    fn parse_cowd(extent_index: usize, data: &[u8]) -> Result<Self> {
        let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
        let flags = u32::from_le_bytes(data[8..12].try_into().unwrap());
        let capacity_sectors = u32::from_le_bytes(data[12..16].try_into().unwrap()) as u64;
        let grain_size_sectors = u32::from_le_bytes(data[16..20].try_into().unwrap()) as u64;
        // next_free_grain at 20..24 is not needed for reading.
        let number_of_grain_directory_entries =
            u32::from_le_bytes(data[24..28].try_into().unwrap());

        if version > 1 {
            return Err(Error::sparse_header(
                extent_index,
                format!("unsupported COWD version {}", version),
            ));
        }

        // COWD's grain table fan-out is fixed at 4096 entries per
        // directory entry (spec.md 4.3); the grain directory begins
        // immediately after the 512-byte header.
        const COWD_GTES_PER_GT: u32 = 4096;
        let _ = number_of_grain_directory_entries;

        Ok(SparseHeader {
            format: HeaderFormat::Cowd,
            version,
            flags,
            capacity_sectors,
            grain_size_sectors,
            descriptor_offset_sectors: 0,
            descriptor_size_sectors: 0,
            number_of_grain_table_entries: COWD_GTES_PER_GT,
            secondary_grain_directory_sector: 0,
            primary_grain_directory_sector: 1, // immediately after the header
            overhead_sectors: 1,
            compression: Compression::None,
        })
    }

    fn validate(&self, extent_index: usize, extent_size_sectors: u64) -> Result<()> {
        if self.grain_size_sectors == 0 {
            return Err(Error::sparse_header(extent_index, "grain_size_sectors is zero"));
        }
        if self.format == HeaderFormat::Kdmv && !self.grain_size_sectors.is_power_of_two() {
            return Err(Error::sparse_header(
                extent_index,
                format!(
                    "grain_size_sectors {} is not a power of two",
                    self.grain_size_sectors
                ),
            ));
        }
        if self.number_of_grain_table_entries == 0 || self.number_of_grain_table_entries > 16384 {
            return Err(Error::sparse_header(
                extent_index,
                format!(
                    "number_of_grain_table_entries {} out of range (1..=16384)",
                    self.number_of_grain_table_entries
                ),
            ));
        }
        if extent_size_sectors != 0 && self.overhead_sectors > extent_size_sectors {
            return Err(Error::sparse_header(
                extent_index,
                "overhead_sectors exceeds extent size",
            ));
        }
        if extent_size_sectors != 0
            && self.primary_grain_directory_sector != 0
            && self.primary_grain_directory_sector >= extent_size_sectors
            && !(self.has_markers() && self.primary_grain_directory_sector == u64::MAX)
        {
            return Err(Error::sparse_header(
                extent_index,
                "primary_grain_directory_sector does not fit within the extent",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kdmv_header(
        version: u32,
        flags: u32,
        capacity: u64,
        grain_size: u64,
        gd_offset: u64,
        gtes_per_gt: u32,
    ) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        buf[0..4].copy_from_slice(&VMDK_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&version.to_le_bytes());
        buf[8..12].copy_from_slice(&flags.to_le_bytes());
        buf[12..20].copy_from_slice(&capacity.to_le_bytes());
        buf[20..28].copy_from_slice(&grain_size.to_le_bytes());
        buf[28..36].copy_from_slice(&1u64.to_le_bytes()); // descriptor_offset
        buf[36..44].copy_from_slice(&20u64.to_le_bytes()); // descriptor_size
        buf[44..48].copy_from_slice(&gtes_per_gt.to_le_bytes());
        buf[48..56].copy_from_slice(&0u64.to_le_bytes()); // secondary gd
        buf[56..64].copy_from_slice(&gd_offset.to_le_bytes());
        buf[64..72].copy_from_slice(&1u64.to_le_bytes()); // overhead
        buf[73..77].copy_from_slice(&NEWLINE_TEST);
        buf[77..79].copy_from_slice(&0u16.to_le_bytes());
        buf
    }

    #[test]
    fn parses_valid_kdmv_header() {
        let data = kdmv_header(1, FLAG_VALID_NEWLINE, 1000, 128, 100, 512);
        let h = SparseHeader::parse(0, &data, 100_000).unwrap();
        assert_eq!(h.format, HeaderFormat::Kdmv);
        assert_eq!(h.capacity_sectors, 1000);
        assert_eq!(h.grain_size_sectors, 128);
        assert_eq!(h.primary_grain_directory_sector, 100);
        assert_eq!(h.grain_size_bytes(), 128 * 512);
    }

    #[test]
    fn rejects_bad_magic() {
        let data = vec![0u8; 512];
        assert!(SparseHeader::parse(0, &data, 100_000).is_err());
    }

    #[test]
    fn rejects_short_buffer() {
        let data = vec![0u8; 100];
        assert!(SparseHeader::parse(0, &data, 100_000).is_err());
    }

    #[test]
    fn rejects_non_power_of_two_grain_size_for_kdmv() {
        let data = kdmv_header(1, FLAG_VALID_NEWLINE, 1000, 100, 100, 512);
        assert!(SparseHeader::parse(0, &data, 100_000).is_err());
    }

    #[test]
    fn rejects_bad_newline_test_when_flag_set() {
        let mut data = kdmv_header(1, FLAG_VALID_NEWLINE, 1000, 128, 100, 512);
        data[73] = b'X';
        assert!(SparseHeader::parse(0, &data, 100_000).is_err());
    }

    #[test]
    fn accepts_missing_newline_test_when_flag_clear() {
        let mut data = kdmv_header(1, 0, 1000, 128, 100, 512);
        data[73..77].copy_from_slice(&[0, 0, 0, 0]);
        assert!(SparseHeader::parse(0, &data, 100_000).is_ok());
    }

    #[test]
    fn rejects_gtes_per_gt_out_of_range() {
        let data = kdmv_header(1, 0, 1000, 128, 100, 0);
        assert!(SparseHeader::parse(0, &data, 100_000).is_err());
        let data = kdmv_header(1, 0, 1000, 128, 100, 20000);
        assert!(SparseHeader::parse(0, &data, 100_000).is_err());
    }

    #[test]
    fn rejects_overhead_exceeding_extent_size() {
        let mut data = kdmv_header(1, 0, 1000, 128, 5, 512);
        data[64..72].copy_from_slice(&1_000_000u64.to_le_bytes());
        assert!(SparseHeader::parse(0, &data, 100_000).is_err());
    }

    #[test]
    fn parses_valid_cowd_header() {
        let mut buf = vec![0u8; 512];
        buf[0..4].copy_from_slice(&COWD_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&1u32.to_le_bytes());
        buf[8..12].copy_from_slice(&0u32.to_le_bytes());
        buf[12..16].copy_from_slice(&2048u32.to_le_bytes());
        buf[16..20].copy_from_slice(&128u32.to_le_bytes());
        buf[24..28].copy_from_slice(&1u32.to_le_bytes());

        let h = SparseHeader::parse(0, &buf, 100_000).unwrap();
        assert_eq!(h.format, HeaderFormat::Cowd);
        assert_eq!(h.capacity_sectors, 2048);
        assert_eq!(h.grain_size_sectors, 128);
        assert_eq!(h.number_of_grain_table_entries, 4096);
        assert_eq!(h.primary_grain_directory_sector, 1);
    }

    #[test]
    fn compression_flag_detection() {
        let data = kdmv_header(3, FLAG_VALID_NEWLINE | FLAG_HAS_GRAIN_COMPRESSION | FLAG_HAS_MARKERS, 1000, 128, 100, 512);
        let h = SparseHeader::parse(0, &data, 100_000).unwrap();
        assert!(h.has_grain_compression());
        assert!(h.has_markers());
    }

    #[test]
    fn num_grain_directory_entries_rounds_up() {
        // capacity 100_000 sectors; grains_per_gt = 128 * 512 = 65536 sectors -> 2 GD entries.
        let data = kdmv_header(1, FLAG_VALID_NEWLINE, 100_000, 128, 100, 512);
        let h = SparseHeader::parse(0, &data, 1_000_000).unwrap();
        assert_eq!(h.num_grain_directory_entries(), 2);
    }
}
