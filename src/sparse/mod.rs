//! Sparse-extent format layer: header codec (C3), grain directory/table
//! loader (C4), the two direct-mapped caches (C5/C6), and the
//! stream-optimized compressed-grain decoder (C7).

pub mod cache;
pub mod grain_table;
pub mod header;
pub mod reader;
pub mod stream;

pub use cache::{DirectMappedCache, DEFAULT_GRAIN_DATA_CACHE_SIZE, DEFAULT_GRAIN_TABLE_CACHE_SIZE};
pub use grain_table::{load_grain_directory, load_grain_table, GrainDirectory, GrainTable};
pub use header::{Compression, HeaderFormat, SparseHeader};
pub use reader::SparseExtentReader;
