//! Compressed-grain decoder for stream-optimized extents (`spec.md` §4.7,
//! C7).
//!
//! Stream-optimized images replace the ordinary grain-table layout with
//! a sequential marker stream. Per the design notes this loader takes
//! option (a): scan the marker stream once and materialize an in-memory
//! index from logical grain number to the DATA marker's payload
//! location, rather than following the footer's grain-directory pointer.

use std::collections::HashMap;
use std::io::Read;

use flate2::read::DeflateDecoder;

use crate::error::{Error, Result};
use crate::pool::BackingPool;
use crate::sparse::header::SECTOR_SIZE;

const MARKER_LEN: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerType {
    Data,
    GrainTable,
    GrainDirectory,
    Footer,
    Eos,
}

impl MarkerType {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => MarkerType::Data,
            1 => MarkerType::GrainTable,
            2 => MarkerType::GrainDirectory,
            3 => MarkerType::Footer,
            4 => MarkerType::Eos,
            _ => return None,
        })
    }
}

struct Marker {
    value: u64,
    size: u32,
    marker_type: MarkerType,
}

impl Marker {
    fn parse(extent_index: usize, bytes: &[u8; 16]) -> Result<Self> {
        let value = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let size = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let raw_type = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        let marker_type = MarkerType::from_u32(raw_type).ok_or_else(|| {
            Error::corrupt_compressed_grain(
                extent_index,
                value,
                "marker-scan",
                format!("unrecognized marker type {}", raw_type),
            )
        })?;
        Ok(Marker {
            value,
            size,
            marker_type,
        })
    }
}

/// Byte location of one DATA marker's compressed payload.
#[derive(Debug, Clone, Copy)]
struct DataLocation {
    payload_offset: u64,
    compressed_size: u32,
}

/// An in-memory index from logical grain number to the DATA marker that
/// carries its compressed bytes, built by scanning the marker stream
/// once at open.
pub struct StreamIndex {
    by_grain: HashMap<u64, DataLocation>,
}

impl StreamIndex {
    /// Whether a DATA marker was found for the grain at logical sector
    /// `grain_sector` during the scan. Grains with no marker are holes.
    pub fn contains_grain(&self, grain_sector: u64) -> bool {
        self.by_grain.contains_key(&grain_sector)
    }

    /// Scan the marker stream of extent `extent_index` on backing file
    /// `backing_index`, starting at `start_sector`, until an EOS marker
    /// or a read past `stream_end_offset` (exclusive).
    pub fn scan(
        extent_index: usize,
        pool: &dyn BackingPool,
        backing_index: u32,
        start_sector: u64,
        stream_end_offset: u64,
    ) -> Result<Self> {
        let mut by_grain = HashMap::new();
        let mut offset = start_sector * SECTOR_SIZE;

        loop {
            if offset + MARKER_LEN > stream_end_offset {
                break;
            }
            let mut header = [0u8; 16];
            let n = pool
                .read_at(backing_index, offset, &mut header)
                .map_err(|e| {
                    Error::corrupt_compressed_grain(extent_index, 0, "marker-scan", e.to_string())
                })?;
            if n < 16 {
                break;
            }
            let marker = Marker::parse(extent_index, &header)?;
            let payload_offset = offset + MARKER_LEN;

            match marker.marker_type {
                MarkerType::Eos => break,
                MarkerType::Data => {
                    by_grain.insert(
                        marker.value,
                        DataLocation {
                            payload_offset,
                            compressed_size: marker.size,
                        },
                    );
                    offset = round_up_to_sector(payload_offset + marker.size as u64);
                }
                MarkerType::GrainTable | MarkerType::GrainDirectory | MarkerType::Footer => {
                    offset = round_up_to_sector(payload_offset + marker.size as u64);
                }
            }
        }

        Ok(StreamIndex { by_grain })
    }

    /// Decode the grain at logical sector `grain_sector` (the value
    /// recorded in the original grain table / directory entry for this
    /// grain), verifying the inflated length equals `grain_size_bytes`.
    pub fn decode_grain(
        &self,
        extent_index: usize,
        pool: &dyn BackingPool,
        backing_index: u32,
        grain_sector: u64,
        grain_size_bytes: usize,
    ) -> Result<Vec<u8>> {
        let loc = self.by_grain.get(&grain_sector).ok_or_else(|| {
            Error::corrupt_compressed_grain(
                extent_index,
                grain_sector,
                "locate",
                "no DATA marker found for grain",
            )
        })?;

        let mut compressed = vec![0u8; loc.compressed_size as usize];
        let n = pool
            .read_at(backing_index, loc.payload_offset, &mut compressed)
            .map_err(|e| {
                Error::corrupt_compressed_grain(extent_index, grain_sector, "read-payload", e.to_string())
            })?;
        if n < compressed.len() {
            return Err(Error::corrupt_compressed_grain(
                extent_index,
                grain_sector,
                "read-payload",
                "short read of compressed payload",
            ));
        }

        let mut out = Vec::with_capacity(grain_size_bytes);
        let mut decoder = DeflateDecoder::new(&compressed[..]);
        decoder.read_to_end(&mut out).map_err(|e| {
            Error::corrupt_compressed_grain(extent_index, grain_sector, "inflate", e.to_string())
        })?;

        if out.len() != grain_size_bytes {
            return Err(Error::corrupt_compressed_grain(
                extent_index,
                grain_sector,
                "inflate",
                format!(
                    "decompressed length {} does not match grain size {}",
                    out.len(),
                    grain_size_bytes
                ),
            ));
        }

        Ok(out)
    }
}

fn round_up_to_sector(len: u64) -> u64 {
    (len + SECTOR_SIZE - 1) / SECTOR_SIZE * SECTOR_SIZE
}
