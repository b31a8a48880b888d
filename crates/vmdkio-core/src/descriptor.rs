//! VMDK descriptor text parsing.
//!
//! The descriptor is a small `key = value` manifest, standalone or embedded
//! in a sparse extent, listing the extent files that make up the disk. The
//! read engine itself never sees descriptor text; this module turns it into
//! the extent tuples that [`crate::image::VmdkImage::open`] consumes. File
//! name resolution and opening stay with the caller.

use crate::error::{Error, Result};
use crate::image::{ExtentKind, ExtentLayout};

/// Content id value meaning "no parent image".
pub const NO_PARENT_CID: u32 = 0xffff_ffff;

/// The type column of an extent row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentRowKind {
    /// Raw data file (`FLAT`, `VMFS`).
    Flat,
    /// Sparse data file (`SPARSE` hosted, `VMFSSPARSE` COWD).
    Sparse,
    /// No storage; reads back as zeroes (`ZERO`).
    Zero,
    /// Raw device mapping (`VMFSRDM`, `VMFSRAW`); listed but not readable.
    RawDevice,
}

impl ExtentRowKind {
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "FLAT" | "VMFS" => Ok(ExtentRowKind::Flat),
            "SPARSE" | "VMFSSPARSE" => Ok(ExtentRowKind::Sparse),
            "ZERO" => Ok(ExtentRowKind::Zero),
            "VMFSRDM" | "VMFSRAW" => Ok(ExtentRowKind::RawDevice),
            _ => Err(Error::malformed_header(format!("unknown extent type: {}", s))),
        }
    }
}

/// One extent row of the descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentRow {
    /// Access mode column (`RW`, `RDONLY`, `NOACCESS`), advisory for reads.
    pub access: String,
    /// Size of this extent in 512-byte sectors.
    pub sectors: u64,
    pub kind: ExtentRowKind,
    /// Extent file name; absent for `ZERO` rows.
    pub filename: Option<String>,
    /// Start offset inside the extent file, in sectors.
    pub offset: u64,
}

/// Parsed descriptor content.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub version: u32,
    pub cid: u32,
    pub parent_cid: u32,
    /// The disk type string, e.g. `monolithicSparse` or `streamOptimized`.
    pub create_type: String,
    pub extents: Vec<ExtentRow>,
    /// BIOS geometry from the disk database section, when present.
    pub cylinders: u64,
    pub heads: u32,
    pub sectors_per_track: u32,
}

impl Descriptor {
    /// Total disk size in sectors, summed over the extent rows.
    pub fn disk_size_sectors(&self) -> u64 {
        self.extents.iter().map(|e| e.sectors).sum()
    }

    /// Total disk size in bytes.
    pub fn disk_size_bytes(&self) -> u64 {
        self.disk_size_sectors() * 512
    }

    /// True if the descriptor names a parent (delta link) image.
    pub fn has_parent(&self) -> bool {
        self.parent_cid != NO_PARENT_CID
    }

    /// The extent file names, in row order. Matches the pool index
    /// assignment of [`to_layout`]: open these files in the same order.
    ///
    /// [`to_layout`]: Descriptor::to_layout
    pub fn file_names(&self) -> Vec<&str> {
        self.extents
            .iter()
            .filter(|row| row.kind != ExtentRowKind::Zero)
            .filter_map(|row| row.filename.as_deref())
            .collect()
    }

    /// Convert the extent rows into the layout consumed by the image open
    /// path, assigning pool indices in row order (`ZERO` rows take none).
    pub fn to_layout(&self) -> Result<Vec<ExtentLayout>> {
        if self.has_parent() {
            return Err(Error::unsupported(format!(
                "delta images with a parent (CID {:#010x}) cannot be read standalone",
                self.parent_cid
            )));
        }
        let mut layout = Vec::with_capacity(self.extents.len());
        let mut next_file = 0usize;
        for row in &self.extents {
            match row.kind {
                ExtentRowKind::Zero => layout.push(ExtentLayout {
                    file: None,
                    kind: ExtentKind::Zero,
                    sectors: row.sectors,
                    offset: 0,
                }),
                ExtentRowKind::Flat | ExtentRowKind::Sparse => {
                    if row.filename.is_none() {
                        return Err(Error::malformed_header(format!(
                            "extent row of {} sectors has no file name",
                            row.sectors
                        )));
                    }
                    let kind = if row.kind == ExtentRowKind::Flat {
                        ExtentKind::Flat
                    } else {
                        ExtentKind::Sparse
                    };
                    layout.push(ExtentLayout {
                        file: Some(next_file),
                        kind,
                        sectors: row.sectors,
                        offset: row.offset,
                    });
                    next_file += 1;
                }
                ExtentRowKind::RawDevice => {
                    return Err(Error::unsupported(
                        "raw device mapping extents cannot be read".to_string(),
                    ))
                }
            }
        }
        Ok(layout)
    }
}

/// Parse descriptor text.
///
/// Unknown keys are ignored; extent rows are recognized by their access
/// mode column. Section comments (`# Extent description` and friends) carry
/// no information beyond the keys themselves and are skipped with every
/// other comment.
pub fn parse_descriptor(content: &str) -> Result<Descriptor> {
    let mut descriptor = Descriptor {
        version: 1,
        cid: 0,
        parent_cid: NO_PARENT_CID,
        create_type: String::new(),
        extents: Vec::new(),
        cylinders: 0,
        heads: 0,
        sectors_per_track: 0,
    };

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with("RW ") || line.starts_with("RDONLY ") || line.starts_with("NOACCESS ") {
            descriptor.extents.push(parse_extent_row(line)?);
            continue;
        }
        let Some((key, value)) = split_key_value(line) else {
            continue;
        };
        match key.as_str() {
            "version" => {
                descriptor.version = value
                    .parse()
                    .map_err(|_| Error::malformed_header(format!("invalid version: {}", value)))?;
            }
            "CID" => {
                descriptor.cid = u32::from_str_radix(&value, 16)
                    .map_err(|_| Error::malformed_header(format!("invalid CID: {}", value)))?;
            }
            "parentCID" => {
                descriptor.parent_cid = u32::from_str_radix(&value, 16)
                    .map_err(|_| Error::malformed_header(format!("invalid parentCID: {}", value)))?;
            }
            "createType" => descriptor.create_type = value,
            "ddb.geometry.cylinders" => {
                descriptor.cylinders = value.parse().unwrap_or(0);
            }
            "ddb.geometry.heads" => {
                descriptor.heads = value.parse().unwrap_or(0);
            }
            "ddb.geometry.sectors" => {
                descriptor.sectors_per_track = value.parse().unwrap_or(0);
            }
            _ => {}
        }
    }
    Ok(descriptor)
}

/// Split a `key = value` line, stripping surrounding quotes from the value.
fn split_key_value(line: &str) -> Option<(String, String)> {
    let eq = line.find('=')?;
    let key = line[..eq].trim().to_string();
    let mut value = line[eq + 1..].trim();
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value = &value[1..value.len() - 1];
    }
    Some((key, value.to_string()))
}

/// Parse an extent row like `RW 4192256 SPARSE "disk-s001.vmdk" 0`.
fn parse_extent_row(line: &str) -> Result<ExtentRow> {
    let mut tokens = line.split_whitespace();
    let access = tokens
        .next()
        .ok_or_else(|| Error::malformed_header(format!("invalid extent row: {}", line)))?
        .to_string();
    let sectors: u64 = tokens
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::malformed_header(format!("invalid extent size in: {}", line)))?;
    let kind = ExtentRowKind::from_str(
        tokens
            .next()
            .ok_or_else(|| Error::malformed_header(format!("invalid extent row: {}", line)))?,
    )?;

    // The file name is quoted and may itself contain spaces; locate it in
    // the raw line rather than in the token stream.
    let (filename, offset) = match line.find('"') {
        None => (None, 0),
        Some(quote) => {
            let (name, tail) = parse_quoted_filename(&line[quote..])?;
            let offset = if tail.is_empty() {
                0
            } else {
                tail.parse().map_err(|_| {
                    Error::malformed_header(format!("invalid extent offset in: {}", line))
                })?
            };
            (Some(name), offset)
        }
    };

    Ok(ExtentRow {
        access,
        sectors,
        kind,
        filename,
        offset,
    })
}

/// Split a quoted file name from whatever follows it.
fn parse_quoted_filename(s: &str) -> Result<(String, String)> {
    let s = s.trim();
    if !s.starts_with('"') {
        return Err(Error::malformed_header(format!(
            "expected quoted extent file name, got: {}",
            s
        )));
    }
    let close = s[1..]
        .find('"')
        .ok_or_else(|| Error::malformed_header(format!("unclosed quote in: {}", s)))?
        + 1;
    Ok((s[1..close].to_string(), s[close + 1..].trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# Disk DescriptorFile
version=1
CID=123a5678
parentCID=ffffffff
createType="twoGbMaxExtentSparse"

# Extent description
RW 4192256 SPARSE "disk-s001.vmdk"
RW 4192256 SPARSE "disk-s002.vmdk"
RW 2048 ZERO

# The Disk Data Base
ddb.geometry.cylinders = "16383"
ddb.geometry.heads = "16"
ddb.geometry.sectors = "63"
ddb.adapterType = "lsilogic"
"#;

    #[test]
    fn test_parse_sample() {
        let descriptor = parse_descriptor(SAMPLE).unwrap();
        assert_eq!(descriptor.version, 1);
        assert_eq!(descriptor.cid, 0x123a5678);
        assert!(!descriptor.has_parent());
        assert_eq!(descriptor.create_type, "twoGbMaxExtentSparse");
        assert_eq!(descriptor.extents.len(), 3);
        assert_eq!(descriptor.cylinders, 16383);
        assert_eq!(descriptor.heads, 16);
        assert_eq!(descriptor.disk_size_sectors(), 2 * 4192256 + 2048);

        let row = &descriptor.extents[0];
        assert_eq!(row.access, "RW");
        assert_eq!(row.kind, ExtentRowKind::Sparse);
        assert_eq!(row.filename.as_deref(), Some("disk-s001.vmdk"));
        assert_eq!(row.offset, 0);
        assert_eq!(descriptor.extents[2].kind, ExtentRowKind::Zero);
    }

    #[test]
    fn test_to_layout_assigns_pool_indices() {
        let descriptor = parse_descriptor(SAMPLE).unwrap();
        let layout = descriptor.to_layout().unwrap();
        assert_eq!(layout.len(), 3);
        assert_eq!(layout[0].file, Some(0));
        assert_eq!(layout[0].kind, ExtentKind::Sparse);
        assert_eq!(layout[1].file, Some(1));
        assert_eq!(layout[2].file, None);
        assert_eq!(layout[2].kind, ExtentKind::Zero);
        assert_eq!(descriptor.file_names(), vec!["disk-s001.vmdk", "disk-s002.vmdk"]);
    }

    #[test]
    fn test_parent_rejected_at_layout() {
        let text = SAMPLE.replace("parentCID=ffffffff", "parentCID=00000042");
        let descriptor = parse_descriptor(&text).unwrap();
        assert!(descriptor.has_parent());
        assert!(matches!(
            descriptor.to_layout(),
            Err(Error::UnsupportedFeature { .. })
        ));
    }

    #[test]
    fn test_flat_row_with_offset() {
        let row = parse_extent_row("RW 838860800 FLAT \"TestVM-flat.vmdk\" 128").unwrap();
        assert_eq!(row.sectors, 838860800);
        assert_eq!(row.kind, ExtentRowKind::Flat);
        assert_eq!(row.filename.as_deref(), Some("TestVM-flat.vmdk"));
        assert_eq!(row.offset, 128);
    }

    #[test]
    fn test_filename_with_spaces() {
        let row = parse_extent_row("RW 1000 SPARSE \"my disk file.vmdk\" 0").unwrap();
        assert_eq!(row.filename.as_deref(), Some("my disk file.vmdk"));
    }

    #[test]
    fn test_vmfs_rows_fold_to_flat_and_sparse() {
        assert_eq!(
            parse_extent_row("RW 1000 VMFS \"x-flat.vmdk\"").unwrap().kind,
            ExtentRowKind::Flat
        );
        assert_eq!(
            parse_extent_row("RW 1000 VMFSSPARSE \"x-delta.vmdk\"").unwrap().kind,
            ExtentRowKind::Sparse
        );
    }

    #[test]
    fn test_raw_device_rejected_at_layout() {
        let mut descriptor = parse_descriptor(SAMPLE).unwrap();
        descriptor.extents[1].kind = ExtentRowKind::RawDevice;
        assert!(matches!(
            descriptor.to_layout(),
            Err(Error::UnsupportedFeature { .. })
        ));
    }

    #[test]
    fn test_unknown_extent_type() {
        assert!(parse_extent_row("RW 1000 BOGUS \"x.vmdk\"").is_err());
    }

    #[test]
    fn test_bad_key_values() {
        assert!(parse_descriptor("CID=zzzz").is_err());
        assert!(parse_descriptor("version=abc").is_err());
        // Unknown keys are skipped.
        assert!(parse_descriptor("some.future.key = \"1\"").is_ok());
    }
}
