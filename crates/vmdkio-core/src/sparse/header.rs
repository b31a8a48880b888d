//! Sparse extent file headers.
//!
//! Two on-disk variants exist: the legacy COWD header (ESX redo logs,
//! `vmfsSparse` extents) and the hosted VMDK header (signature `KDMV`,
//! `monolithicSparse` / `streamOptimized` extents). Both occupy the first
//! 512 bytes of the extent file and store every size and offset in 512-byte
//! sectors. Parsing validates the variant-specific sanity rules and then
//! normalizes everything to bytes exactly once; the rest of the engine
//! never multiplies by the sector size again.

use log::debug;

use crate::bytes::{le_u16, le_u32, le_u64, u8_at};
use crate::error::{Error, Result};

/// Size of a sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// On-disk size of either header variant.
pub const HEADER_SIZE: usize = 512;

/// Signature of a COWD sparse extent file.
pub const COWD_SIGNATURE: [u8; 4] = *b"COWD";

/// Signature of a VMDK sparse extent file ("VMDK" as a little-endian u32).
pub const VMDK_SIGNATURE: [u8; 4] = *b"KDMV";

/// Flags in the VMDK sparse header.
pub const FLAG_VALID_NEWLINE_TEST: u32 = 1 << 0;
pub const FLAG_USE_SECONDARY_GD: u32 = 1 << 1;
pub const FLAG_HAS_COMPRESSED_GRAINS: u32 = 1 << 16;
pub const FLAG_HAS_MARKERS: u32 = 1 << 17;

/// Grain directory offset value meaning the real header is in the footer
/// at the end of a stream-optimized file.
pub const GD_AT_END: u64 = u64::MAX;

/// Highest VMDK sparse format version this library reads.
const MAX_SUPPORTED_VERSION: u32 = 3;

/// Fixed grain table entry count of the COWD variant.
const COWD_GT_ENTRIES: u32 = 4096;

/// Compression method applied to grain data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Deflate,
}

impl Compression {
    fn from_raw(raw: u16) -> Result<Self> {
        match raw {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Deflate),
            other => Err(Error::unsupported(format!(
                "unknown compression method {}",
                other
            ))),
        }
    }

    fn to_raw(self) -> u16 {
        match self {
            Compression::None => 0,
            Compression::Deflate => 1,
        }
    }
}

/// A parsed COWD sparse header, fields still in sectors as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CowdHeader {
    pub version: u32,
    pub flags: u32,
    pub capacity_sectors: u32,
    pub grain_sectors: u32,
    pub gd_sector: u32,
    /// Entry count as recorded on disk; the engine derives its own count
    /// from the capacity and surfaces this one for inspection only.
    pub gd_entry_count: u32,
}

/// A parsed VMDK sparse header, fields still in sectors as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmdkHeader {
    pub version: u32,
    pub flags: u32,
    pub capacity_sectors: u64,
    pub grain_sectors: u64,
    pub descriptor_sector: u64,
    pub descriptor_sectors: u64,
    pub gt_entries: u32,
    pub secondary_gd_sector: u64,
    pub gd_sector: u64,
    pub metadata_sectors: u64,
    pub is_dirty: bool,
    pub compression: Compression,
}

/// Either sparse header variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SparseHeader {
    Cowd(CowdHeader),
    Vmdk(VmdkHeader),
}

impl SparseHeader {
    /// Parse and validate a sparse header from the first [`HEADER_SIZE`]
    /// bytes of an extent file.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::malformed_header(format!(
                "header data too short: {} bytes",
                data.len()
            )));
        }
        let signature = [data[0], data[1], data[2], data[3]];
        match signature {
            COWD_SIGNATURE => Ok(SparseHeader::Cowd(CowdHeader::parse(data)?)),
            VMDK_SIGNATURE => Ok(SparseHeader::Vmdk(VmdkHeader::parse(data)?)),
            _ => Err(Error::malformed_header(format!(
                "unknown extent file signature {:02x?}",
                signature
            ))),
        }
    }

    /// Serialize back to the on-disk 512-byte form.
    pub fn emit(&self) -> [u8; HEADER_SIZE] {
        match self {
            SparseHeader::Cowd(h) => h.emit(),
            SparseHeader::Vmdk(h) => h.emit(),
        }
    }

    /// The flags word common to both variants.
    pub fn flags(&self) -> u32 {
        match self {
            SparseHeader::Cowd(h) => h.flags,
            SparseHeader::Vmdk(h) => h.flags,
        }
    }

    /// True if the primary grain directory offset points at the footer of a
    /// stream-optimized file rather than at a directory.
    pub fn directory_in_footer(&self) -> bool {
        matches!(self, SparseHeader::Vmdk(h) if h.gd_sector == GD_AT_END)
    }
}

impl CowdHeader {
    fn parse(data: &[u8]) -> Result<Self> {
        let header = Self {
            version: le_u32(data, 0x04)?,
            flags: le_u32(data, 0x08)?,
            capacity_sectors: le_u32(data, 0x0C)?,
            grain_sectors: le_u32(data, 0x10)?,
            gd_sector: le_u32(data, 0x14)?,
            gd_entry_count: le_u32(data, 0x18)?,
        };
        if header.grain_sectors == 0 {
            return Err(Error::malformed_header(
                "COWD grain size of 0 sectors".to_string(),
            ));
        }
        debug!(
            "parsed COWD header: version {} capacity {} sectors, grain {} sectors",
            header.version, header.capacity_sectors, header.grain_sectors
        );
        Ok(header)
    }

    fn emit(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0x00..0x04].copy_from_slice(&COWD_SIGNATURE);
        buf[0x04..0x08].copy_from_slice(&self.version.to_le_bytes());
        buf[0x08..0x0C].copy_from_slice(&self.flags.to_le_bytes());
        buf[0x0C..0x10].copy_from_slice(&self.capacity_sectors.to_le_bytes());
        buf[0x10..0x14].copy_from_slice(&self.grain_sectors.to_le_bytes());
        buf[0x14..0x18].copy_from_slice(&self.gd_sector.to_le_bytes());
        buf[0x18..0x1C].copy_from_slice(&self.gd_entry_count.to_le_bytes());
        buf
    }
}

impl VmdkHeader {
    fn parse(data: &[u8]) -> Result<Self> {
        let version = le_u32(data, 0x04)?;
        if version > MAX_SUPPORTED_VERSION {
            return Err(Error::unsupported(format!(
                "VMDK sparse format version {}",
                version
            )));
        }
        // The end-of-line sentinel bytes detect FTP-style newline mangling
        // of the file; a mismatch means the data stream is corrupt.
        if u8_at(data, 0x49)? != b'\n' {
            return Err(Error::malformed_header(
                "single end-of-line sentinel is not LF".to_string(),
            ));
        }
        if u8_at(data, 0x4A)? != b' ' {
            return Err(Error::malformed_header(
                "non end-of-line sentinel is not space".to_string(),
            ));
        }
        if u8_at(data, 0x4B)? != b'\r' || u8_at(data, 0x4C)? != b'\n' {
            return Err(Error::malformed_header(
                "double end-of-line sentinel is not CRLF".to_string(),
            ));
        }
        let header = Self {
            version,
            flags: le_u32(data, 0x08)?,
            capacity_sectors: le_u64(data, 0x0C)?,
            grain_sectors: le_u64(data, 0x14)?,
            descriptor_sector: le_u64(data, 0x1C)?,
            descriptor_sectors: le_u64(data, 0x24)?,
            gt_entries: le_u32(data, 0x2C)?,
            secondary_gd_sector: le_u64(data, 0x30)?,
            gd_sector: le_u64(data, 0x38)?,
            metadata_sectors: le_u64(data, 0x40)?,
            is_dirty: u8_at(data, 0x48)? != 0,
            compression: Compression::from_raw(le_u16(data, 0x4D)?)?,
        };
        if header.grain_sectors <= 8 {
            return Err(Error::malformed_header(format!(
                "grain size of {} sectors (must be larger than 8)",
                header.grain_sectors
            )));
        }
        if header.grain_sectors % 2 != 0 {
            return Err(Error::malformed_header(format!(
                "grain size of {} sectors is odd",
                header.grain_sectors
            )));
        }
        if header.gt_entries == 0 {
            return Err(Error::malformed_header(
                "grain table entry count of 0".to_string(),
            ));
        }
        if header.gt_entries > i32::MAX as u32 {
            return Err(Error::malformed_header(format!(
                "grain table entry count {} exceeds maximum",
                header.gt_entries
            )));
        }
        debug!(
            "parsed VMDK header: version {} capacity {} sectors, grain {} sectors, \
             {} GT entries, compression {:?}",
            header.version,
            header.capacity_sectors,
            header.grain_sectors,
            header.gt_entries,
            header.compression
        );
        Ok(header)
    }

    fn emit(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0x00..0x04].copy_from_slice(&VMDK_SIGNATURE);
        buf[0x04..0x08].copy_from_slice(&self.version.to_le_bytes());
        buf[0x08..0x0C].copy_from_slice(&self.flags.to_le_bytes());
        buf[0x0C..0x14].copy_from_slice(&self.capacity_sectors.to_le_bytes());
        buf[0x14..0x1C].copy_from_slice(&self.grain_sectors.to_le_bytes());
        buf[0x1C..0x24].copy_from_slice(&self.descriptor_sector.to_le_bytes());
        buf[0x24..0x2C].copy_from_slice(&self.descriptor_sectors.to_le_bytes());
        buf[0x2C..0x30].copy_from_slice(&self.gt_entries.to_le_bytes());
        buf[0x30..0x38].copy_from_slice(&self.secondary_gd_sector.to_le_bytes());
        buf[0x38..0x40].copy_from_slice(&self.gd_sector.to_le_bytes());
        buf[0x40..0x48].copy_from_slice(&self.metadata_sectors.to_le_bytes());
        buf[0x48] = self.is_dirty as u8;
        buf[0x49] = b'\n';
        buf[0x4A] = b' ';
        buf[0x4B] = b'\r';
        buf[0x4C] = b'\n';
        buf[0x4D..0x4F].copy_from_slice(&self.compression.to_raw().to_le_bytes());
        buf
    }
}

/// Geometry of one sparse extent, normalized to bytes.
///
/// Derived from a validated header; immutable afterwards. Everything the
/// index and grain readers need lives here so no later stage has to reach
/// back into the raw header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentGeometry {
    /// Virtual size covered by this extent in bytes.
    pub max_data_size: u64,
    /// Bytes per grain.
    pub grain_size: u64,
    /// Grain table entries per grain table.
    pub gt_entries: u64,
    /// Grain directory entry count, derived from the capacity.
    pub gd_entries: u64,
    /// On-disk size of one grain table, rounded up to a sector.
    pub grain_table_bytes: u64,
    /// On-disk size of the grain directory, rounded up to a sector.
    pub grain_directory_bytes: u64,
    /// Byte offset of the primary grain directory.
    pub primary_gd_offset: u64,
    /// Byte offset of the secondary grain directory, 0 if absent.
    pub secondary_gd_offset: u64,
    /// Byte offset of the embedded descriptor, 0 if absent.
    pub descriptor_offset: u64,
    /// Byte size of the embedded descriptor, 0 if absent.
    pub descriptor_size: u64,
    pub compression: Compression,
    pub flags: u32,
    pub is_dirty: bool,
}

fn sector_align(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR_SIZE) * SECTOR_SIZE
}

impl ExtentGeometry {
    /// Derive byte-normalized geometry from a validated header.
    pub fn from_header(header: &SparseHeader) -> Result<Self> {
        let mut geometry = match header {
            SparseHeader::Cowd(h) => Self {
                max_data_size: u64::from(h.capacity_sectors) * SECTOR_SIZE,
                grain_size: u64::from(h.grain_sectors) * SECTOR_SIZE,
                gt_entries: u64::from(COWD_GT_ENTRIES),
                gd_entries: 0,
                grain_table_bytes: 0,
                grain_directory_bytes: 0,
                primary_gd_offset: u64::from(h.gd_sector) * SECTOR_SIZE,
                secondary_gd_offset: 0,
                descriptor_offset: 0,
                descriptor_size: 0,
                compression: Compression::None,
                flags: h.flags,
                is_dirty: false,
            },
            SparseHeader::Vmdk(h) => {
                if h.gd_sector == GD_AT_END {
                    return Err(Error::malformed_header(
                        "grain directory offset points at the footer; \
                         re-read the header from the footer first"
                            .to_string(),
                    ));
                }
                let scale = |sectors: u64, what: &str| -> Result<u64> {
                    sectors.checked_mul(SECTOR_SIZE).ok_or_else(|| {
                        Error::malformed_header(format!("{} of {} sectors overflows", what, sectors))
                    })
                };
                Self {
                    max_data_size: scale(h.capacity_sectors, "capacity")?,
                    grain_size: scale(h.grain_sectors, "grain size")?,
                    gt_entries: u64::from(h.gt_entries),
                    gd_entries: 0,
                    grain_table_bytes: 0,
                    grain_directory_bytes: 0,
                    primary_gd_offset: scale(h.gd_sector, "grain directory offset")?,
                    secondary_gd_offset: scale(h.secondary_gd_sector, "secondary directory offset")?,
                    descriptor_offset: scale(h.descriptor_sector, "descriptor offset")?,
                    descriptor_size: scale(h.descriptor_sectors, "descriptor size")?,
                    compression: h.compression,
                    flags: h.flags,
                    is_dirty: h.is_dirty,
                }
            }
        };
        let group_span = geometry
            .gt_entries
            .checked_mul(geometry.grain_size)
            .filter(|&span| span > 0)
            .ok_or_else(|| {
                Error::malformed_header("grain table span is zero or overflows".to_string())
            })?;
        geometry.gd_entries = geometry.max_data_size.div_ceil(group_span);
        geometry.grain_table_bytes = sector_align(geometry.gt_entries * 4);
        geometry.grain_directory_bytes = sector_align(geometry.gd_entries * 4);
        Ok(geometry)
    }

    /// Virtual bytes covered by one grain directory entry.
    pub fn grain_group_span(&self) -> u64 {
        self.gt_entries * self.grain_size
    }

    /// True when grains are stored as marker-prefixed compressed payloads.
    pub fn has_compressed_grains(&self) -> bool {
        self.compression == Compression::Deflate && self.flags & FLAG_HAS_COMPRESSED_GRAINS != 0
    }

    /// The grain directory the read path should use. The secondary is only
    /// selected when the header asks for it.
    pub fn active_gd_offset(&self) -> u64 {
        if self.flags & FLAG_USE_SECONDARY_GD != 0 && self.secondary_gd_offset != 0 {
            self.secondary_gd_offset
        } else {
            self.primary_gd_offset
        }
    }
}
