//! Grain directory loading.
//!
//! The grain directory is the top level of the two-level index: a flat,
//! sector-aligned array of little-endian u32 sector numbers, one per grain
//! table. A zero entry means the whole grain group is unallocated. It is
//! read in one sequential pass at open time; grain tables themselves are
//! loaded lazily later.

use log::{debug, warn};

use crate::bytes::le_u32;
use crate::error::{Error, Result};
use crate::io::IoPool;
use crate::sparse::header::{ExtentGeometry, HEADER_SIZE, SECTOR_SIZE};

/// One grain directory entry: where the grain table for a grain group lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrainGroupRef {
    /// No grain table; every grain in the group reads back as zeroes.
    Sparse,
    /// Byte offset of the grain table block within the extent file.
    Present(u64),
}

/// The fully decoded grain directory of one sparse extent.
#[derive(Debug)]
pub struct GrainDirectory {
    entries: Vec<GrainGroupRef>,
}

impl GrainDirectory {
    /// Read and decode the active grain directory.
    ///
    /// When `verify_secondary` is set and the extent carries a secondary
    /// (backup) directory, the raw bytes of both copies are compared and a
    /// mismatch is logged; it does not fail the open.
    pub fn load(
        pool: &mut dyn IoPool,
        file_index: usize,
        geometry: &ExtentGeometry,
        file_size: u64,
        verify_secondary: bool,
    ) -> Result<Self> {
        let offset = geometry.active_gd_offset();
        debug!(
            "loading grain directory: {} entries at offset {}",
            geometry.gd_entries, offset
        );
        let data = read_directory_block(pool, file_index, offset, geometry, file_size)?;
        let entries = decode_entries(&data, geometry, file_size)?;

        if verify_secondary && geometry.secondary_gd_offset != 0 {
            let secondary = if offset == geometry.secondary_gd_offset {
                geometry.primary_gd_offset
            } else {
                geometry.secondary_gd_offset
            };
            match read_directory_block(pool, file_index, secondary, geometry, file_size) {
                Ok(backup) if backup == data => {
                    debug!("secondary grain directory matches the primary")
                }
                Ok(_) => warn!(
                    "secondary grain directory at offset {} differs from the active copy",
                    secondary
                ),
                Err(e) => warn!("unable to read secondary grain directory: {}", e),
            }
        }
        Ok(Self { entries })
    }

    /// Number of grain directory entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the directory has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry for grain group `index`.
    pub fn get(&self, index: u32) -> Result<GrainGroupRef> {
        self.entries.get(index as usize).copied().ok_or_else(|| {
            Error::invalid_argument(format!(
                "grain directory index {} out of range ({} entries)",
                index,
                self.entries.len()
            ))
        })
    }

    /// Virtual bytes mapped by grain group `index`; the last group is
    /// clipped to the remaining capacity.
    pub fn group_span(&self, index: u32, geometry: &ExtentGeometry) -> u64 {
        let start = u64::from(index) * geometry.grain_group_span();
        geometry
            .grain_group_span()
            .min(geometry.max_data_size.saturating_sub(start))
    }
}

fn read_directory_block(
    pool: &mut dyn IoPool,
    file_index: usize,
    offset: u64,
    geometry: &ExtentGeometry,
    file_size: u64,
) -> Result<Vec<u8>> {
    if offset < HEADER_SIZE as u64
        || offset
            .checked_add(geometry.grain_directory_bytes)
            .map_or(true, |end| end > file_size)
    {
        return Err(Error::malformed_header(format!(
            "grain directory at offset {} does not fit in a {} byte file",
            offset, file_size
        )));
    }
    let mut data = vec![0u8; geometry.grain_directory_bytes as usize];
    pool.read_exact_at(file_index, offset, &mut data)?;
    Ok(data)
}

fn decode_entries(
    data: &[u8],
    geometry: &ExtentGeometry,
    file_size: u64,
) -> Result<Vec<GrainGroupRef>> {
    let mut entries = Vec::with_capacity(geometry.gd_entries as usize);
    for index in 0..geometry.gd_entries as usize {
        let sector = le_u32(data, index * 4)?;
        if sector == 0 {
            entries.push(GrainGroupRef::Sparse);
            continue;
        }
        let offset = u64::from(sector) * SECTOR_SIZE;
        if offset < HEADER_SIZE as u64
            || offset + geometry.grain_table_bytes > file_size
        {
            return Err(Error::malformed_header(format!(
                "grain directory entry {} points at {}, outside the extent file",
                index, offset
            )));
        }
        entries.push(GrainGroupRef::Present(offset));
    }
    Ok(entries)
}
