//! In-memory VMDK fixtures for the integration tests.
//!
//! Images are assembled byte-by-byte the way the format stores them:
//! header, grain directory, grain tables, then grain payloads. The builder
//! keeps fixtures small while still exercising the full metadata path.

// Not every test binary uses every fixture helper.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Write;

use flate2::{write::ZlibEncoder, Compression};
use vmdkio_core::sparse::header::{
    CowdHeader, SparseHeader, VmdkHeader, FLAG_HAS_COMPRESSED_GRAINS, FLAG_HAS_MARKERS,
    FLAG_VALID_NEWLINE_TEST,
};
use vmdkio_core::sparse::table::GrainMarker;
use vmdkio_core::sparse::Compression as GrainCompression;

pub const SECTOR: u64 = 512;

pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn align_sector(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR) * SECTOR
}

fn put(file: &mut Vec<u8>, offset: u64, data: &[u8]) {
    let offset = offset as usize;
    if file.len() < offset + data.len() {
        file.resize(offset + data.len(), 0);
    }
    file[offset..offset + data.len()].copy_from_slice(data);
}

/// Builds a hosted (`KDMV`) sparse extent file with chosen geometry and a
/// chosen set of allocated grains.
pub struct SparseImageBuilder {
    capacity_sectors: u64,
    grain_sectors: u64,
    gt_entries: u32,
    compressed: bool,
    grains: BTreeMap<u64, Vec<u8>>,
}

impl SparseImageBuilder {
    pub fn new(capacity_sectors: u64) -> Self {
        Self {
            capacity_sectors,
            grain_sectors: 128,
            gt_entries: 512,
            compressed: false,
            grains: BTreeMap::new(),
        }
    }

    pub fn grain_sectors(mut self, sectors: u64) -> Self {
        self.grain_sectors = sectors;
        self
    }

    pub fn gt_entries(mut self, entries: u32) -> Self {
        self.gt_entries = entries;
        self
    }

    /// Store grains as marker-prefixed zlib streams (stream-optimized).
    pub fn compressed(mut self) -> Self {
        self.compressed = true;
        self
    }

    pub fn grain_bytes(&self) -> usize {
        (self.grain_sectors * SECTOR) as usize
    }

    /// Allocate grain `index` with the given payload (one grain in size).
    pub fn grain(mut self, index: u64, data: Vec<u8>) -> Self {
        assert_eq!(data.len(), self.grain_bytes(), "payload must be one grain");
        self.grains.insert(index, data);
        self
    }

    /// Allocate grain `index` filled with a single byte value.
    pub fn fill_grain(self, index: u64, byte: u8) -> Self {
        let data = vec![byte; self.grain_bytes()];
        self.grain(index, data)
    }

    /// The expected contents of the whole virtual extent.
    pub fn model(&self) -> Vec<u8> {
        let mut model = vec![0u8; (self.capacity_sectors * SECTOR) as usize];
        let grain_bytes = self.grain_bytes();
        for (&index, data) in &self.grains {
            let start = index as usize * grain_bytes;
            model[start..start + grain_bytes].copy_from_slice(data);
        }
        model
    }

    pub fn build(&self) -> Vec<u8> {
        let grain_bytes = self.grain_sectors * SECTOR;
        let group_span = u64::from(self.gt_entries) * grain_bytes;
        let capacity_bytes = self.capacity_sectors * SECTOR;
        let gd_entries = capacity_bytes.div_ceil(group_span);
        let gd_bytes = align_sector(gd_entries * 4);
        let gt_bytes = align_sector(u64::from(self.gt_entries) * 4);

        // Group allocated grains by their grain directory entry.
        let mut groups: BTreeMap<u64, BTreeMap<u64, &[u8]>> = BTreeMap::new();
        for (&index, data) in &self.grains {
            let gd_index = index / u64::from(self.gt_entries);
            let gt_index = index % u64::from(self.gt_entries);
            groups.entry(gd_index).or_default().insert(gt_index, data);
        }

        let gd_offset = SECTOR;
        let mut cursor = gd_offset + gd_bytes;
        let mut gd = vec![0u32; gd_entries as usize];
        let mut tables: BTreeMap<u64, (u64, Vec<u32>)> = BTreeMap::new();
        for &gd_index in groups.keys() {
            gd[gd_index as usize] = (cursor / SECTOR) as u32;
            tables.insert(gd_index, (cursor, vec![0u32; self.gt_entries as usize]));
            cursor += gt_bytes;
        }

        let mut file = Vec::new();
        for (gd_index, grains) in &groups {
            let table = tables.get_mut(gd_index).unwrap();
            for (&gt_index, data) in grains {
                table.1[gt_index as usize] = (cursor / SECTOR) as u32;
                if self.compressed {
                    let lba = (*gd_index * group_span + gt_index * grain_bytes) / SECTOR;
                    let compressed = zlib(data);
                    let marker = GrainMarker {
                        lba,
                        data_size: compressed.len() as u32,
                    };
                    put(&mut file, cursor, &marker.to_bytes());
                    put(&mut file, cursor + GrainMarker::SIZE as u64, &compressed);
                    cursor += align_sector(GrainMarker::SIZE as u64 + compressed.len() as u64);
                } else {
                    put(&mut file, cursor, data);
                    cursor += grain_bytes;
                }
            }
        }
        // Trailing sparse data may leave the file shorter than the metadata
        // says; pad so every referenced block fits.
        if (file.len() as u64) < cursor {
            file.resize(cursor as usize, 0);
        }

        let mut flags = FLAG_VALID_NEWLINE_TEST;
        if self.compressed {
            flags |= FLAG_HAS_COMPRESSED_GRAINS | FLAG_HAS_MARKERS;
        }
        let header = VmdkHeader {
            version: 1,
            flags,
            capacity_sectors: self.capacity_sectors,
            grain_sectors: self.grain_sectors,
            descriptor_sector: 0,
            descriptor_sectors: 0,
            gt_entries: self.gt_entries,
            secondary_gd_sector: 0,
            gd_sector: 1,
            metadata_sectors: 0,
            is_dirty: false,
            compression: if self.compressed {
                GrainCompression::Deflate
            } else {
                GrainCompression::None
            },
        };
        put(&mut file, 0, &SparseHeader::Vmdk(header).emit());

        let mut gd_raw = Vec::with_capacity(gd.len() * 4);
        for entry in &gd {
            gd_raw.extend_from_slice(&entry.to_le_bytes());
        }
        put(&mut file, gd_offset, &gd_raw);
        for (offset, entries) in tables.values() {
            let mut raw = Vec::with_capacity(entries.len() * 4);
            for entry in entries {
                raw.extend_from_slice(&entry.to_le_bytes());
            }
            put(&mut file, *offset, &raw);
        }
        file
    }
}

/// Builds a legacy COWD extent file. The grain table entry count is fixed
/// at 4096, so one table serves small fixtures.
pub struct CowdImageBuilder {
    capacity_sectors: u32,
    grain_sectors: u32,
    grains: BTreeMap<u64, Vec<u8>>,
}

impl CowdImageBuilder {
    pub fn new(capacity_sectors: u32, grain_sectors: u32) -> Self {
        Self {
            capacity_sectors,
            grain_sectors,
            grains: BTreeMap::new(),
        }
    }

    pub fn grain_bytes(&self) -> usize {
        (self.grain_sectors as u64 * SECTOR) as usize
    }

    pub fn grain(mut self, index: u64, data: Vec<u8>) -> Self {
        assert_eq!(data.len(), self.grain_bytes());
        self.grains.insert(index, data);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let grain_bytes = u64::from(self.grain_sectors) * SECTOR;
        let capacity_bytes = u64::from(self.capacity_sectors) * SECTOR;
        let group_span = 4096 * grain_bytes;
        let gd_entries = capacity_bytes.div_ceil(group_span);
        let gd_bytes = align_sector(gd_entries * 4);
        let gt_bytes = 4096 * 4;

        let gd_offset = SECTOR;
        let gt_offset = gd_offset + gd_bytes;
        let mut cursor = gt_offset + gt_bytes;

        let mut file = Vec::new();
        let mut gt = vec![0u32; 4096];
        for (&index, data) in &self.grains {
            assert!(index < 4096, "fixture supports one grain table");
            gt[index as usize] = (cursor / SECTOR) as u32;
            put(&mut file, cursor, data);
            cursor += grain_bytes;
        }
        if (file.len() as u64) < cursor {
            file.resize(cursor as usize, 0);
        }

        let header = CowdHeader {
            version: 1,
            flags: 3,
            capacity_sectors: self.capacity_sectors,
            grain_sectors: self.grain_sectors,
            gd_sector: (gd_offset / SECTOR) as u32,
            gd_entry_count: gd_entries as u32,
        };
        put(&mut file, 0, &SparseHeader::Cowd(header).emit());

        let mut gd_raw = Vec::new();
        for entry in 0..gd_entries {
            let sector = if entry == 0 { (gt_offset / SECTOR) as u32 } else { 0 };
            gd_raw.extend_from_slice(&sector.to_le_bytes());
        }
        put(&mut file, gd_offset, &gd_raw);

        let mut gt_raw = Vec::with_capacity(gt.len() * 4);
        for entry in &gt {
            gt_raw.extend_from_slice(&entry.to_le_bytes());
        }
        put(&mut file, gt_offset, &gt_raw);
        file
    }
}
