//! A single sparse extent: geometry, lazy index, grain reads.
//!
//! `SparseExtent` ties the pieces together for one extent file: the parsed
//! header and byte-normalized geometry, the eagerly loaded grain directory,
//! a bounded cache of lazily loaded grain tables, and the grain read path
//! (zero synthesis for sparse grains, positioned copies for raw grains,
//! marker-validated decompression for stream-optimized grains).

use std::io::Read;

use flate2::read::ZlibDecoder;
use log::debug;

use crate::cache::BoundedCache;
use crate::error::{Error, Result};
use crate::io::IoPool;
use crate::sparse::directory::{GrainDirectory, GrainGroupRef};
use crate::sparse::empty::detect_fill;
use crate::sparse::header::{ExtentGeometry, SparseHeader, HEADER_SIZE, SECTOR_SIZE};
use crate::sparse::table::{GrainMarker, GrainRef, GrainTable};

/// A decompressed grain held in the shared grain-data cache.
///
/// Grains that inflate to a single repeated byte are kept as that byte;
/// repeated hits then skip both the buffer copy and the fill scan.
#[derive(Debug)]
pub enum CachedGrain {
    /// Every byte of the grain equals the stored value.
    Fill(u8),
    /// Full decompressed payload, exactly one grain in size.
    Data(Vec<u8>),
}

/// Cache key: (extent id, grain directory index, grain table index).
pub type GrainDataKey = (usize, u32, u32);

/// The shared cache of decompressed grains.
pub type GrainDataCache = BoundedCache<GrainDataKey, CachedGrain>;

/// One open sparse extent file.
#[derive(Debug)]
pub struct SparseExtent {
    file_index: usize,
    file_size: u64,
    header: SparseHeader,
    geometry: ExtentGeometry,
    directory: GrainDirectory,
    tables: BoundedCache<u32, GrainTable>,
}

impl SparseExtent {
    /// Open the sparse extent stored in pool file `file_index`.
    ///
    /// Reads and validates the header (following the footer indirection of
    /// stream-optimized files), derives the geometry and loads the grain
    /// directory. Grain tables are left to be materialized on first touch.
    pub fn open(
        pool: &mut dyn IoPool,
        file_index: usize,
        table_cache_capacity: usize,
        verify_secondary: bool,
    ) -> Result<Self> {
        if table_cache_capacity == 0 {
            return Err(Error::invalid_argument(
                "grain table cache capacity must be non-zero".to_string(),
            ));
        }
        let file_size = pool.size(file_index)?;
        let mut header_buf = [0u8; HEADER_SIZE];
        pool.read_exact_at(file_index, 0, &mut header_buf)?;
        let mut header = SparseHeader::parse(&header_buf)?;

        if header.directory_in_footer() {
            // Stream-optimized files defer to a footer copy of the header,
            // written 1024 bytes before end-of-file once the directory
            // offset is known.
            let footer_offset = file_size
                .checked_sub(2 * HEADER_SIZE as u64)
                .ok_or_else(|| {
                    Error::malformed_header(format!(
                        "file of {} bytes cannot hold a footer",
                        file_size
                    ))
                })?;
            debug!("grain directory is in the footer; re-reading header at {}", footer_offset);
            pool.read_exact_at(file_index, footer_offset, &mut header_buf)?;
            header = SparseHeader::parse(&header_buf)?;
            if header.directory_in_footer() {
                return Err(Error::malformed_header(
                    "footer header also defers the grain directory".to_string(),
                ));
            }
        }

        let geometry = ExtentGeometry::from_header(&header)?;
        let directory =
            GrainDirectory::load(pool, file_index, &geometry, file_size, verify_secondary)?;
        Ok(Self {
            file_index,
            file_size,
            header,
            geometry,
            directory,
            tables: BoundedCache::new(table_cache_capacity),
        })
    }

    /// The byte-normalized geometry of this extent.
    pub fn geometry(&self) -> &ExtentGeometry {
        &self.geometry
    }

    /// The raw header as parsed from disk.
    pub fn header(&self) -> &SparseHeader {
        &self.header
    }

    /// Pool index of the backing file.
    pub fn file_index(&self) -> usize {
        self.file_index
    }

    /// Extract the embedded descriptor text, if the header carries one.
    pub fn read_descriptor(&self, pool: &mut dyn IoPool) -> Result<Option<String>> {
        if self.geometry.descriptor_offset == 0 || self.geometry.descriptor_size == 0 {
            return Ok(None);
        }
        if self.geometry.descriptor_offset + self.geometry.descriptor_size > self.file_size {
            return Err(Error::malformed_header(
                "embedded descriptor extends past end of file".to_string(),
            ));
        }
        let mut data = vec![0u8; self.geometry.descriptor_size as usize];
        pool.read_exact_at(self.file_index, self.geometry.descriptor_offset, &mut data)?;
        let text = String::from_utf8_lossy(&data);
        Ok(Some(text.trim_end_matches('\0').to_string()))
    }

    /// Resolve the grain table entry for (grain group, grain) coordinates,
    /// loading and caching the grain table on a miss.
    fn grain_ref(
        &mut self,
        pool: &mut dyn IoPool,
        gd_index: u32,
        gt_index: u32,
    ) -> Result<GrainRef> {
        match self.directory.get(gd_index)? {
            // A sparse directory entry stands for an entire unallocated
            // grain group; no table exists to load.
            GrainGroupRef::Sparse => Ok(GrainRef::Sparse),
            GrainGroupRef::Present(table_offset) => {
                if let Some(table) = self.tables.get(&gd_index) {
                    return table.get(gt_index);
                }
                debug!(
                    "grain table miss: group {} at offset {}",
                    gd_index, table_offset
                );
                let mut data = vec![0u8; self.geometry.grain_table_bytes as usize];
                pool.read_exact_at(self.file_index, table_offset, &mut data)?;
                let table = GrainTable::decode(&data, self.geometry.gt_entries)?;
                let entry = table.get(gt_index)?;
                self.tables.put(gd_index, table);
                Ok(entry)
            }
        }
    }

    /// Read from virtual offset `offset` within this extent into `buf`,
    /// stopping at the next grain boundary. Returns the number of bytes
    /// produced (at least 1 for an in-range request).
    pub fn read_at(
        &mut self,
        pool: &mut dyn IoPool,
        data_cache: &mut GrainDataCache,
        extent_id: usize,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if offset >= self.geometry.max_data_size {
            return Err(Error::invalid_argument(format!(
                "offset {} outside extent of {} bytes",
                offset, self.geometry.max_data_size
            )));
        }
        let group_span = self.geometry.grain_group_span();
        let gd_index = u32::try_from(offset / group_span)
            .map_err(|_| Error::invalid_argument("grain group index overflows".to_string()))?;
        let within_group = offset % group_span;
        let gt_index = (within_group / self.geometry.grain_size) as u32;
        let within_grain = within_group % self.geometry.grain_size;

        let want = buf
            .len()
            .min((self.geometry.grain_size - within_grain) as usize)
            .min((self.geometry.max_data_size - offset) as usize);
        let out = &mut buf[..want];

        match self.grain_ref(pool, gd_index, gt_index)? {
            GrainRef::Sparse => out.fill(0),
            GrainRef::Allocated(physical) if self.geometry.has_compressed_grains() => {
                let grain_start = offset - within_grain;
                self.read_compressed(
                    pool,
                    data_cache,
                    (extent_id, gd_index, gt_index),
                    physical,
                    grain_start,
                    within_grain as usize,
                    out,
                )?;
            }
            GrainRef::Allocated(physical) => {
                if physical < HEADER_SIZE as u64
                    || physical + self.geometry.grain_size > self.file_size
                {
                    return Err(Error::malformed_grain(format!(
                        "grain at offset {} does not fit in a {} byte file",
                        physical, self.file_size
                    )));
                }
                pool.read_exact_at(self.file_index, physical + within_grain, out)?;
            }
        }
        Ok(want)
    }

    /// Serve a slice of a compressed grain through the shared data cache.
    #[allow(clippy::too_many_arguments)]
    fn read_compressed(
        &mut self,
        pool: &mut dyn IoPool,
        data_cache: &mut GrainDataCache,
        key: GrainDataKey,
        physical: u64,
        grain_start: u64,
        within_grain: usize,
        out: &mut [u8],
    ) -> Result<()> {
        if let Some(cached) = data_cache.get(&key) {
            copy_cached(cached, within_grain, out);
            return Ok(());
        }
        let grain = self.inflate_grain(pool, physical, grain_start)?;
        copy_cached(&grain, within_grain, out);
        data_cache.put(key, grain);
        Ok(())
    }

    /// Read, validate and decompress one grain.
    fn inflate_grain(
        &self,
        pool: &mut dyn IoPool,
        physical: u64,
        grain_start: u64,
    ) -> Result<CachedGrain> {
        let mut marker_buf = [0u8; GrainMarker::SIZE];
        if physical < HEADER_SIZE as u64
            || physical + GrainMarker::SIZE as u64 > self.file_size
        {
            return Err(Error::malformed_grain(format!(
                "grain marker at offset {} does not fit in a {} byte file",
                physical, self.file_size
            )));
        }
        pool.read_exact_at(self.file_index, physical, &mut marker_buf)?;
        let marker = GrainMarker::parse(&marker_buf)?;

        let marker_offset = marker.lba.checked_mul(SECTOR_SIZE).ok_or_else(|| {
            Error::malformed_grain(format!("grain marker LBA {} overflows", marker.lba))
        })?;
        if marker_offset != grain_start {
            return Err(Error::malformed_grain(format!(
                "grain marker LBA {} maps to offset {}, expected {}",
                marker.lba, marker_offset, grain_start
            )));
        }
        let data_end = physical + GrainMarker::SIZE as u64 + u64::from(marker.data_size);
        if marker.data_size == 0 || data_end > self.file_size {
            return Err(Error::malformed_grain(format!(
                "compressed grain of {} bytes at offset {} does not fit",
                marker.data_size, physical
            )));
        }

        let mut compressed = vec![0u8; marker.data_size as usize];
        pool.read_exact_at(
            self.file_index,
            physical + GrainMarker::SIZE as u64,
            &mut compressed,
        )?;

        let grain_size = self.geometry.grain_size as usize;
        let mut decoder = ZlibDecoder::new(&compressed[..]);
        let mut payload = vec![0u8; grain_size];
        decoder.read_exact(&mut payload).map_err(|e| {
            Error::decompress(format!("grain inflates to fewer than {} bytes: {}", grain_size, e))
        })?;
        let mut probe = [0u8; 1];
        let extra = decoder
            .read(&mut probe)
            .map_err(|e| Error::decompress(format!("inflate failed past grain end: {}", e)))?;
        if extra != 0 {
            return Err(Error::decompress(format!(
                "grain inflates beyond {} bytes",
                grain_size
            )));
        }
        if decoder.total_in() < compressed.len() as u64 {
            return Err(Error::decompress(format!(
                "{} residual bytes after compressed grain",
                compressed.len() as u64 - decoder.total_in()
            )));
        }

        Ok(match detect_fill(&payload) {
            Some(byte) => CachedGrain::Fill(byte),
            None => CachedGrain::Data(payload),
        })
    }
}

fn copy_cached(grain: &CachedGrain, within_grain: usize, out: &mut [u8]) {
    match grain {
        CachedGrain::Fill(byte) => out.fill(*byte),
        CachedGrain::Data(data) => {
            out.copy_from_slice(&data[within_grain..within_grain + out.len()])
        }
    }
}
