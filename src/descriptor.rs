//! VMDK descriptor file parsing (`spec.md` §4.2, C2).
//!
//! The descriptor is a line-oriented UTF-8 text format enumerating a
//! disk's extents and metadata. It may stand alone as its own file or be
//! embedded in a sparse extent's header (`descriptor_offset_sectors`..
//! `+descriptor_size_sectors`, §6.2).

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::types::{AccessMode, DiskType, ExtentType};

/// Maximum accepted descriptor size, per `spec.md` §4.2.
pub const MAX_DESCRIPTOR_LEN: usize = 16 * 1024;

/// A single extent-table line (`spec.md` §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extent {
    pub access: AccessMode,
    pub extent_type: ExtentType,
    /// Absent iff `extent_type == ExtentType::Zero`.
    pub filename: Option<String>,
    /// Offset within the backing file, in 512-byte sectors. Zero for
    /// SPARSE/ZERO extents.
    pub offset_sectors: u64,
    pub size_sectors: u64,
    /// Cumulative start within the disk; filled in by [`VmdkDescriptor::finalize`].
    pub logical_start_sector: u64,
    /// Index into the caller-supplied backing pool; filled in by the
    /// handle at open time, not by the parser.
    pub backing_index: Option<u32>,
}

/// Parsed VMDK descriptor (`spec.md` §3).
#[derive(Debug, Clone)]
pub struct VmdkDescriptor {
    pub version: u32,
    pub content_identifier: u32,
    pub parent_content_identifier: Option<u32>,
    pub create_type: String,
    pub disk_type: Option<DiskType>,
    pub parent_filename_hint: Option<String>,
    pub encoding: Option<String>,
    pub extents: Vec<Extent>,
    /// Opaque `ddb.*` key/value map, preserved verbatim.
    pub disk_database: HashMap<String, String>,
}

impl VmdkDescriptor {
    /// Total disk size in bytes (sum of extent sizes).
    pub fn media_size(&self) -> u64 {
        self.disk_size_sectors() * 512
    }

    /// Total disk size in 512-byte sectors.
    pub fn disk_size_sectors(&self) -> u64 {
        self.extents.iter().map(|e| e.size_sectors).sum()
    }

    /// Geometry convenience accessor: `ddb.geometry.cylinders`.
    pub fn geometry_cylinders(&self) -> Option<u64> {
        self.disk_database
            .get("ddb.geometry.cylinders")
            .and_then(|v| v.parse().ok())
    }

    /// Geometry convenience accessor: `ddb.geometry.heads`.
    pub fn geometry_heads(&self) -> Option<u32> {
        self.disk_database
            .get("ddb.geometry.heads")
            .and_then(|v| v.parse().ok())
    }

    /// Geometry convenience accessor: `ddb.geometry.sectors`.
    pub fn geometry_sectors(&self) -> Option<u32> {
        self.disk_database
            .get("ddb.geometry.sectors")
            .and_then(|v| v.parse().ok())
    }
}

/// Parse a VMDK descriptor from its UTF-8 text content.
///
/// Performs a single forward pass; see `spec.md` §4.2 for the grammar and
/// the exact set of conditions that produce `MalformedDescriptor`.
pub fn parse_descriptor(content: &str) -> Result<VmdkDescriptor> {
    if content.len() > MAX_DESCRIPTOR_LEN {
        return Err(Error::malformed_descriptor(
            0,
            format!(
                "descriptor exceeds {} byte limit ({} bytes)",
                MAX_DESCRIPTOR_LEN,
                content.len()
            ),
        ));
    }

    let mut version = None;
    let mut cid = None;
    let mut parent_cid = None;
    let mut create_type: Option<String> = None;
    let mut parent_filename_hint = None;
    let mut encoding = None;
    let mut extents = Vec::new();
    let mut disk_database = HashMap::new();
    let mut seen_header_keys: HashMap<String, ()> = HashMap::new();

    for (idx, raw_line) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with("ddb.") {
            let (key, value) = parse_key_value(line).ok_or_else(|| {
                Error::malformed_descriptor(line_no, format!("malformed ddb line: {}", line))
            })?;
            disk_database.insert(key, value);
            continue;
        }

        if is_extent_line(line) {
            let extent = parse_extent_line(line, line_no)?;
            extents.push(extent);
            continue;
        }

        if let Some((key, value)) = parse_key_value(line) {
            if seen_header_keys.contains_key(&key)
                && matches!(
                    key.as_str(),
                    "version" | "CID" | "parentCID" | "createType"
                )
            {
                return Err(Error::malformed_descriptor(
                    line_no,
                    format!("duplicate header key: {}", key),
                ));
            }
            seen_header_keys.insert(key.clone(), ());

            match key.as_str() {
                "version" => {
                    version = Some(value.parse::<u32>().map_err(|_| {
                        Error::malformed_descriptor(line_no, format!("invalid version: {}", value))
                    })?);
                }
                "CID" => {
                    cid = Some(u32::from_str_radix(&value, 16).map_err(|_| {
                        Error::malformed_descriptor(line_no, format!("invalid CID: {}", value))
                    })?);
                }
                "parentCID" => {
                    let v = u32::from_str_radix(&value, 16).map_err(|_| {
                        Error::malformed_descriptor(line_no, format!("invalid parentCID: {}", value))
                    })?;
                    // 0xffffffff is VMware's "no parent" sentinel.
                    if v != 0xffff_ffff {
                        parent_cid = Some(v);
                    }
                }
                "createType" => create_type = Some(value),
                "parentFileNameHint" => parent_filename_hint = Some(value),
                "encoding" => encoding = Some(value),
                _ => {
                    // Unknown header keys are ignored but not errors.
                }
            }
            continue;
        }

        // Lines matching none of the three regimes are tolerated: the
        // parsing contract (spec.md 4.2) enumerates the failure modes
        // exhaustively and "unrecognized line shape" is not among them.
        log::trace!("descriptor line {} not recognized, ignoring: {}", line_no, line);
    }

    let cid = cid.ok_or_else(|| Error::malformed_descriptor(0, "missing CID"))?;
    let create_type = create_type.ok_or_else(|| Error::malformed_descriptor(0, "missing createType"))?;
    let disk_type = DiskType::from_create_type(&create_type);
    if disk_type.is_none() {
        return Err(Error::malformed_descriptor(
            0,
            format!("unknown createType: {}", create_type),
        ));
    }
    if parent_cid.is_some() && !disk_type.unwrap().admits_parent() {
        return Err(Error::malformed_descriptor(
            0,
            format!("parentCID present but createType {} admits no parent", create_type),
        ));
    }

    let mut descriptor = VmdkDescriptor {
        version: version.unwrap_or(1),
        content_identifier: cid,
        parent_content_identifier: parent_cid,
        create_type,
        disk_type,
        parent_filename_hint,
        encoding,
        extents,
        disk_database,
    };
    descriptor.finalize()?;
    Ok(descriptor)
}

impl VmdkDescriptor {
    /// Compute each extent's `logical_start_sector` as an exclusive
    /// prefix sum, checking for `u64` overflow (`spec.md` §4.2).
    fn finalize(&mut self) -> Result<()> {
        let mut cumulative: u64 = 0;
        for extent in &mut self.extents {
            extent.logical_start_sector = cumulative;
            cumulative = cumulative.checked_add(extent.size_sectors).ok_or_else(|| {
                Error::malformed_descriptor(0, "extent table overflows u64 sector count")
            })?;
        }
        Ok(())
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn is_extent_line(line: &str) -> bool {
    line.starts_with("RW ")
        || line.starts_with("RDONLY ")
        || line.starts_with("NOACCESS ")
        || line == "RW"
        || line == "RDONLY"
        || line == "NOACCESS"
}

/// Parse a key=value or key = value line. Returns `None` if there is no
/// top-level `=` (extent lines never contain one outside the filename,
/// which this function is never called on).
fn parse_key_value(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    let mut value = line[eq_pos + 1..].trim().to_string();
    if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
        value = value[1..value.len() - 1].to_string();
    }
    Some((key, value))
}

/// Parse an extent line:
/// `<access> <size_sectors> <type> [<filename> [<offset_sectors>]]`
fn parse_extent_line(line: &str, line_no: usize) -> Result<Extent> {
    let mut parts = line.splitn(3, char::is_whitespace);
    let access_str = parts
        .next()
        .ok_or_else(|| Error::malformed_descriptor(line_no, "empty extent line"))?;
    let access = AccessMode::from_str(access_str)
        .ok_or_else(|| Error::malformed_descriptor(line_no, format!("invalid access mode: {}", access_str)))?;

    let rest = parts.next().unwrap_or("").trim_start();
    let mut rest_parts = rest.splitn(2, char::is_whitespace);
    let size_str = rest_parts
        .next()
        .ok_or_else(|| Error::malformed_descriptor(line_no, "extent line missing size"))?;
    let size_sectors: u64 = size_str.parse().map_err(|_| {
        Error::malformed_descriptor(line_no, format!("invalid extent size: {}", size_str))
    })?;
    if size_sectors == 0 {
        return Err(Error::malformed_descriptor(line_no, "extent size_sectors is zero"));
    }

    let rest2 = rest_parts.next().unwrap_or("").trim_start();
    let mut type_parts = rest2.splitn(2, char::is_whitespace);
    let type_str = type_parts
        .next()
        .ok_or_else(|| Error::malformed_descriptor(line_no, "extent line missing type"))?;
    let extent_type = ExtentType::from_str(type_str)
        .ok_or_else(|| Error::malformed_descriptor(line_no, format!("unknown extent type: {}", type_str)))?;

    let tail = type_parts.next().unwrap_or("").trim();

    if !extent_type.requires_filename() {
        return Ok(Extent {
            access,
            extent_type,
            filename: None,
            offset_sectors: 0,
            size_sectors,
            logical_start_sector: 0,
            backing_index: None,
        });
    }

    if tail.is_empty() {
        return Err(Error::malformed_descriptor(
            line_no,
            format!("extent type {:?} requires a filename", extent_type),
        ));
    }

    let (filename, offset_str) = parse_quoted_filename_and_offset(tail, line_no)?;
    let offset_sectors = if offset_str.is_empty() {
        0
    } else {
        offset_str.parse().map_err(|_| {
            Error::malformed_descriptor(line_no, format!("invalid extent offset: {}", offset_str))
        })?
    };

    Ok(Extent {
        access,
        extent_type,
        filename: Some(filename),
        offset_sectors,
        size_sectors,
        logical_start_sector: 0,
        backing_index: None,
    })
}

fn parse_quoted_filename_and_offset(s: &str, line_no: usize) -> Result<(String, String)> {
    let s = s.trim();
    if !s.starts_with('"') {
        return Err(Error::malformed_descriptor(
            line_no,
            format!("expected quoted filename, got: {}", s),
        ));
    }
    let end_quote = s[1..]
        .find('"')
        .ok_or_else(|| Error::malformed_descriptor(line_no, format!("unclosed quote in: {}", s)))?
        + 1;
    let filename = s[1..end_quote].to_string();
    let offset_str = s[end_quote + 1..].trim().to_string();
    Ok((filename, offset_str))
}
