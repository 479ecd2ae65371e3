//! File-signature detection (`spec.md` §6.4).
//!
//! A light-weight check for "is this plausibly a VMDK", useful to
//! callers auto-discovering images without relying on file extensions.
//! This does not validate the header or descriptor; `Handle::open` is
//! the authority on well-formedness.

use crate::sparse::header::{COWD_MAGIC, VMDK_MAGIC};

const DESCRIPTOR_MAGIC: &str = "# Disk DescriptorFile";
const DESCRIPTOR_SNIFF_WINDOW: usize = 1024;

/// Whether `data` (the first bytes of a file) look like a VMDK: a
/// `KDMV`/`COWD` binary header, or a standalone textual descriptor
/// beginning with `# Disk DescriptorFile` within the first 1024 bytes.
pub fn is_vmdk(data: &[u8]) -> bool {
    if data.len() >= 4 {
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic == VMDK_MAGIC || magic == COWD_MAGIC {
            return true;
        }
    }

    let window = &data[..data.len().min(DESCRIPTOR_SNIFF_WINDOW)];
    matches!(std::str::from_utf8(window), Ok(text) if text.contains(DESCRIPTOR_MAGIC))
}
