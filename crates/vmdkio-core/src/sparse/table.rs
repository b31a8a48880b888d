//! Grain tables and grain markers.
//!
//! A grain table (one per grain group) is the second level of the index:
//! a packed array of little-endian u32 sector numbers, one per grain, zero
//! meaning unallocated. Stream-optimized extents additionally prefix each
//! allocated grain with a 12-byte marker carrying its logical block address
//! and the compressed payload size.

use crate::bytes::{le_u32, le_u64};
use crate::error::{Error, Result};
use crate::sparse::header::SECTOR_SIZE;

/// One grain table entry: where a single grain's payload lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrainRef {
    /// Unallocated; the grain reads back as zeroes.
    Sparse,
    /// Byte offset of the grain payload (or its marker, when compressed)
    /// within the extent file.
    Allocated(u64),
}

/// A decoded grain table ("grain group").
#[derive(Debug)]
pub struct GrainTable {
    entries: Vec<GrainRef>,
}

impl GrainTable {
    /// Decode `count` entries from a raw grain table block.
    pub fn decode(data: &[u8], count: u64) -> Result<Self> {
        let mut entries = Vec::with_capacity(count as usize);
        for index in 0..count as usize {
            let sector = le_u32(data, index * 4)?;
            entries.push(if sector == 0 {
                GrainRef::Sparse
            } else {
                GrainRef::Allocated(u64::from(sector) * SECTOR_SIZE)
            });
        }
        Ok(Self { entries })
    }

    /// A table whose grains are all unallocated, standing in for a sparse
    /// grain directory entry.
    pub fn synthetic_sparse(count: u64) -> Self {
        Self {
            entries: vec![GrainRef::Sparse; count as usize],
        }
    }

    /// The entry for grain `index` within this table.
    pub fn get(&self, index: u32) -> Result<GrainRef> {
        self.entries.get(index as usize).copied().ok_or_else(|| {
            Error::invalid_argument(format!(
                "grain table index {} out of range ({} entries)",
                index,
                self.entries.len()
            ))
        })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The 12-byte marker preceding a compressed grain payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrainMarker {
    /// Logical block address of the grain, in sectors.
    pub lba: u64,
    /// Size of the compressed payload that follows, in bytes.
    pub data_size: u32,
}

impl GrainMarker {
    /// On-disk size of the marker.
    pub const SIZE: usize = 12;

    /// Decode a marker from its on-disk form.
    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(Self {
            lba: le_u64(data, 0)?,
            data_size: le_u32(data, 8)?,
        })
    }

    /// Serialize to the on-disk 12-byte form.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.lba.to_le_bytes());
        buf[8..12].copy_from_slice(&self.data_size.to_le_bytes());
        buf
    }
}
