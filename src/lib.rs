//! Read-only access to VMware Virtual Disk (VMDK) images.
//!
//! A VMDK image is a logical block device whose bytes are stored across
//! one or more backing files ("extents"), described by a textual
//! descriptor. This crate turns that descriptor plus caller-supplied
//! backing storage (a [`BackingPool`]) into a single [`Handle`] exposing
//! ordinary `read_at(offset, buf)` semantics over the whole logical
//! disk, including sparse (grain-allocated), stream-optimized
//! (DEFLATE-compressed), and parent-chained (snapshot/linked-clone)
//! images.
//!
//! This crate does not write, create, or resize images, and it does not
//! open backing files itself — callers supply a [`BackingPool`]
//! (typically [`FilePool`]) mapping extent index to bytes.
//!
//! ```no_run
//! use std::sync::Arc;
//! use vmdk_core::{FilePool, Handle};
//!
//! # fn main() -> vmdk_core::Result<()> {
//! let descriptor = std::fs::read("disk.vmdk")?;
//! let pool = Arc::new(FilePool::open(&["disk-flat.vmdk"])?);
//! let mut handle = Handle::open(&descriptor, pool)?;
//! let mut buf = vec![0u8; 4096];
//! handle.read_at(0, &mut buf)?;
//! # Ok(())
//! # }
//! ```

pub mod descriptor;
pub mod error;
pub mod extent_table;
pub mod handle;
pub mod pool;
pub mod sniff;
pub mod sparse;
pub mod types;

pub use descriptor::{parse_descriptor, Extent, VmdkDescriptor};
pub use error::{Error, Result};
pub use extent_table::ExtentTable;
pub use handle::{Handle, HandleOptions, MAX_PARENT_CHAIN_DEPTH};
pub use pool::{BackingPool, FilePool, VecPool};
pub use sniff::is_vmdk;
pub use types::{AccessMode, DiskType, ExtentType};
