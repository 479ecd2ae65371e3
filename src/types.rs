//! Shared disk- and extent-type enums (`spec.md` §3).

/// The VMDK disk type named by a descriptor's `createType` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskType {
    Flat2Gb,
    Sparse2Gb,
    MonolithicFlat,
    MonolithicSparse,
    StreamOptimized,
    VmfsFlat,
    VmfsFlatPreAllocated,
    VmfsFlatZeroed,
    VmfsRaw,
    VmfsRdm,
    VmfsRdmp,
    VmfsSparse,
    VmfsSparseThin,
    Custom,
    Device,
    DevicePartitioned,
}

impl DiskType {
    /// Parse a disk type from the descriptor's `createType` value.
    ///
    /// Matching is case-insensitive; the canonical spellings are VMware's
    /// own (e.g. `"monolithicSparse"`, `"twoGbMaxExtentSparse"`).
    pub fn from_create_type(s: &str) -> Option<Self> {
        Some(match s {
            _ if s.eq_ignore_ascii_case("twoGbMaxExtentFlat") => DiskType::Flat2Gb,
            _ if s.eq_ignore_ascii_case("twoGbMaxExtentSparse") => DiskType::Sparse2Gb,
            _ if s.eq_ignore_ascii_case("monolithicFlat") => DiskType::MonolithicFlat,
            _ if s.eq_ignore_ascii_case("monolithicSparse") => DiskType::MonolithicSparse,
            _ if s.eq_ignore_ascii_case("streamOptimized") => DiskType::StreamOptimized,
            _ if s.eq_ignore_ascii_case("vmfs") => DiskType::VmfsFlat,
            _ if s.eq_ignore_ascii_case("vmfsPreallocated") => DiskType::VmfsFlatPreAllocated,
            _ if s.eq_ignore_ascii_case("vmfsEagerZeroedThick") => DiskType::VmfsFlatZeroed,
            _ if s.eq_ignore_ascii_case("vmfsRaw") => DiskType::VmfsRaw,
            _ if s.eq_ignore_ascii_case("vmfsRDM") => DiskType::VmfsRdm,
            _ if s.eq_ignore_ascii_case("vmfsRDMP") => DiskType::VmfsRdmp,
            _ if s.eq_ignore_ascii_case("vmfsSparse") => DiskType::VmfsSparse,
            _ if s.eq_ignore_ascii_case("vmfsThin") => DiskType::VmfsSparseThin,
            _ if s.eq_ignore_ascii_case("custom") => DiskType::Custom,
            _ if s.eq_ignore_ascii_case("fullDevice") => DiskType::Device,
            _ if s.eq_ignore_ascii_case("partitionedDevice") => DiskType::DevicePartitioned,
            _ => return None,
        })
    }

    /// Whether this disk type admits a `parentCID`/parent chain.
    pub fn admits_parent(self) -> bool {
        matches!(
            self,
            DiskType::MonolithicSparse
                | DiskType::Sparse2Gb
                | DiskType::StreamOptimized
                | DiskType::VmfsSparse
                | DiskType::VmfsSparseThin
        )
    }
}

/// The type of a single extent-table line (`spec.md` §3/§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtentType {
    Flat,
    Sparse,
    Vmfs,
    VmfsSparse,
    VmfsRaw,
    VmfsRdm,
    Zero,
}

impl ExtentType {
    pub(crate) fn from_str(s: &str) -> Option<Self> {
        Some(match s.to_uppercase().as_str() {
            "FLAT" => ExtentType::Flat,
            "SPARSE" => ExtentType::Sparse,
            "VMFS" => ExtentType::Vmfs,
            "VMFSSPARSE" => ExtentType::VmfsSparse,
            "VMFSRAW" => ExtentType::VmfsRaw,
            "VMFSRDM" => ExtentType::VmfsRdm,
            "ZERO" => ExtentType::Zero,
            _ => return None,
        })
    }

    /// Whether this extent type is read via the sparse grain path.
    pub(crate) fn is_sparse(self) -> bool {
        matches!(self, ExtentType::Sparse | ExtentType::VmfsSparse)
    }

    /// Whether an extent line of this type requires a filename.
    pub(crate) fn requires_filename(self) -> bool {
        !matches!(self, ExtentType::Zero)
    }
}

/// Access mode declared on an extent-table line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    NoAccess,
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    pub(crate) fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "NOACCESS" => AccessMode::NoAccess,
            "RDONLY" => AccessMode::ReadOnly,
            "RW" => AccessMode::ReadWrite,
            _ => return None,
        })
    }

    /// Whether the core may read from an extent declaring this mode.
    pub fn is_readable(self) -> bool {
        matches!(self, AccessMode::ReadOnly | AccessMode::ReadWrite)
    }
}
