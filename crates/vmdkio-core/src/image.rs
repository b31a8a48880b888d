//! The opened image: extent table, random-access resolver, lifecycle.
//!
//! A `VmdkImage` presents the virtual block device described by one or more
//! extent files as a contiguous, byte-addressable range `[0, media_size)`.
//! Reads walk the extent table, then each sparse extent's two-level index,
//! one grain at a time. The handle is single-owner; after construction only
//! the caches and the cursor mutate.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;

use crate::error::{Error, Result};
use crate::io::IoPool;
use crate::sparse::extent::{GrainDataCache, SparseExtent};
use crate::sparse::header::{ExtentGeometry, SparseHeader, SECTOR_SIZE};

/// Default capacity of each per-extent grain table cache.
pub const DEFAULT_GRAIN_TABLE_CACHE: usize = 16;

/// Default capacity of the shared decompressed-grain cache.
pub const DEFAULT_GRAIN_DATA_CACHE: usize = 16;

/// Tunables for opening an image.
///
/// Both cache capacities must be non-zero; `open_with_options` rejects a
/// zero value with [`Error::InvalidArgument`].
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Grain tables cached per sparse extent.
    pub grain_table_cache: usize,
    /// Decompressed grains cached across all extents.
    pub grain_data_cache: usize,
    /// Read the secondary (backup) grain directory and log a warning if it
    /// disagrees with the active copy. Debug aid, off by default.
    pub verify_secondary_directory: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            grain_table_cache: DEFAULT_GRAIN_TABLE_CACHE,
            grain_data_cache: DEFAULT_GRAIN_DATA_CACHE,
            verify_secondary_directory: false,
        }
    }
}

/// The kind of one extent in an image layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentKind {
    /// COWD or VMDK sparse extent file; the variant is read off the file.
    Sparse,
    /// Raw data file; bytes are served as stored.
    Flat,
    /// No backing storage; reads return zeroes.
    Zero,
}

/// One row of a pre-resolved image layout.
///
/// Multi-file images are opened from a layout built by the caller (usually
/// via [`crate::descriptor`]): every extent names its pool file, its kind,
/// and its virtual length. A single-file image is the one-row special case
/// (see [`VmdkImage::open_single`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentLayout {
    /// Pool index of the backing file; `None` only for [`ExtentKind::Zero`].
    pub file: Option<usize>,
    pub kind: ExtentKind,
    /// Virtual length in sectors. For sparse extents 0 means "use the
    /// capacity recorded in the extent header".
    pub sectors: u64,
    /// Start offset inside the backing file, in sectors (flat extents).
    pub offset: u64,
}

/// Read-only description of one opened extent's virtual span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentSpan {
    pub v_start: u64,
    pub v_len: u64,
    pub kind: ExtentKind,
}

/// A cloneable flag for cancelling in-progress reads.
///
/// The resolver checks the flag between grain iterations; in-flight I/O is
/// not interrupted. The flag stays raised until [`clear`] is called.
///
/// [`clear`]: AbortHandle::clear
#[derive(Debug, Clone)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Ask the owning image to fail its current and future reads with
    /// [`Error::Aborted`].
    pub fn signal_abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Lower the flag again.
    pub fn clear(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    /// True if the flag is raised.
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
enum ExtentSlot {
    Sparse(SparseExtent),
    Flat { file: usize, file_offset: u64 },
    Zero,
}

#[derive(Debug)]
struct ExtentEntry {
    v_start: u64,
    v_len: u64,
    slot: ExtentSlot,
}

/// An opened VMDK image.
///
/// The handle moves through header parsing and directory loading during
/// [`open`] and is read-ready when construction returns. A structural or
/// I/O fault during a read closes the handle permanently; out-of-bounds
/// requests and aborts do not.
///
/// [`open`]: VmdkImage::open
pub struct VmdkImage {
    pool: Box<dyn IoPool>,
    extents: Vec<ExtentEntry>,
    media_size: u64,
    grain_data: GrainDataCache,
    cursor: u64,
    closed: bool,
    abort: Arc<AtomicBool>,
    /// Error to surface on the next read after a partial read returned the
    /// bytes it had already produced (std::io::Read convention).
    pending_error: Option<Error>,
}

impl VmdkImage {
    /// Open an image from a pre-resolved layout with default options.
    pub fn open(pool: Box<dyn IoPool>, layout: &[ExtentLayout]) -> Result<Self> {
        Self::open_with_options(pool, layout, OpenOptions::default())
    }

    /// Open a single-file sparse image (monolithic or stream-optimized):
    /// pool file 0 is the whole disk.
    pub fn open_single(pool: Box<dyn IoPool>) -> Result<Self> {
        Self::open(
            pool,
            &[ExtentLayout {
                file: Some(0),
                kind: ExtentKind::Sparse,
                sectors: 0,
                offset: 0,
            }],
        )
    }

    /// Open an image from a pre-resolved layout.
    ///
    /// Every row is opened and validated; the extents must tile the virtual
    /// range without gaps, which holds by construction since each row's span
    /// starts where the previous one ended.
    pub fn open_with_options(
        mut pool: Box<dyn IoPool>,
        layout: &[ExtentLayout],
        options: OpenOptions,
    ) -> Result<Self> {
        if options.grain_table_cache == 0 || options.grain_data_cache == 0 {
            return Err(Error::invalid_argument(
                "cache capacities must be non-zero".to_string(),
            ));
        }
        if layout.is_empty() {
            return Err(Error::invalid_argument("image layout has no extents".to_string()));
        }
        let mut extents = Vec::with_capacity(layout.len());
        let mut v_start = 0u64;
        for (index, row) in layout.iter().enumerate() {
            let (slot, v_len) = Self::open_extent(pool.as_mut(), index, row, &options)?;
            extents.push(ExtentEntry {
                v_start,
                v_len,
                slot,
            });
            v_start += v_len;
        }
        let media_size = v_start;
        debug!(
            "image ready: {} extents, media size {} bytes",
            extents.len(),
            media_size
        );
        Ok(Self {
            pool,
            extents,
            media_size,
            grain_data: GrainDataCache::new(options.grain_data_cache),
            cursor: 0,
            closed: false,
            abort: Arc::new(AtomicBool::new(false)),
            pending_error: None,
        })
    }

    fn open_extent(
        pool: &mut dyn IoPool,
        index: usize,
        row: &ExtentLayout,
        options: &OpenOptions,
    ) -> Result<(ExtentSlot, u64)> {
        let declared_bytes = row
            .sectors
            .checked_mul(SECTOR_SIZE)
            .ok_or_else(|| Error::invalid_argument(format!("extent {} sector count overflows", index)))?;
        match row.kind {
            ExtentKind::Zero => {
                if row.file.is_some() {
                    return Err(Error::invalid_argument(format!(
                        "zero extent {} must not name a file",
                        index
                    )));
                }
                if declared_bytes == 0 {
                    return Err(Error::invalid_argument(format!(
                        "zero extent {} has no length",
                        index
                    )));
                }
                Ok((ExtentSlot::Zero, declared_bytes))
            }
            ExtentKind::Flat => {
                let file = row.file.ok_or_else(|| {
                    Error::invalid_argument(format!("flat extent {} names no file", index))
                })?;
                if declared_bytes == 0 {
                    return Err(Error::invalid_argument(format!(
                        "flat extent {} has no length",
                        index
                    )));
                }
                let file_offset = row.offset * SECTOR_SIZE;
                let needed = file_offset + declared_bytes;
                let file_size = pool.size(file)?;
                if needed > file_size {
                    return Err(Error::invalid_argument(format!(
                        "flat extent {} needs {} bytes but file has {}",
                        index, needed, file_size
                    )));
                }
                Ok((ExtentSlot::Flat { file, file_offset }, declared_bytes))
            }
            ExtentKind::Sparse => {
                let file = row.file.ok_or_else(|| {
                    Error::invalid_argument(format!("sparse extent {} names no file", index))
                })?;
                let extent = SparseExtent::open(
                    pool,
                    file,
                    options.grain_table_cache,
                    options.verify_secondary_directory,
                )?;
                let capacity = extent.geometry().max_data_size;
                if declared_bytes != 0 && declared_bytes != capacity {
                    return Err(Error::invalid_argument(format!(
                        "sparse extent {} declares {} bytes but its header holds {}",
                        index, declared_bytes, capacity
                    )));
                }
                Ok((ExtentSlot::Sparse(extent), capacity))
            }
        }
    }

    /// Total virtual size of the disk in bytes.
    pub fn size(&self) -> u64 {
        self.media_size
    }

    /// True once the handle has been closed, explicitly or by a fault.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the handle; subsequent operations fail with [`Error::Closed`].
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// A handle for aborting reads from outside the owner.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(Arc::clone(&self.abort))
    }

    /// The virtual spans of the opened extents, in order.
    pub fn spans(&self) -> Vec<ExtentSpan> {
        self.extents
            .iter()
            .map(|entry| ExtentSpan {
                v_start: entry.v_start,
                v_len: entry.v_len,
                kind: match entry.slot {
                    ExtentSlot::Sparse(_) => ExtentKind::Sparse,
                    ExtentSlot::Flat { .. } => ExtentKind::Flat,
                    ExtentSlot::Zero => ExtentKind::Zero,
                },
            })
            .collect()
    }

    /// Header and geometry of extent `index`, if it is sparse.
    pub fn sparse_details(&self, index: usize) -> Option<(&SparseHeader, &ExtentGeometry)> {
        match &self.extents.get(index)?.slot {
            ExtentSlot::Sparse(extent) => Some((extent.header(), extent.geometry())),
            _ => None,
        }
    }

    /// The embedded descriptor text of the first sparse extent carrying one.
    pub fn descriptor_text(&mut self) -> Result<Option<String>> {
        if self.closed {
            return Err(Error::Closed);
        }
        for entry in &self.extents {
            if let ExtentSlot::Sparse(extent) = &entry.slot {
                if let Some(text) = extent.read_descriptor(self.pool.as_mut())? {
                    return Ok(Some(text));
                }
            }
        }
        Ok(None)
    }

    /// Position the cursor used by the `Read` implementation. Validates
    /// bounds only; no I/O happens.
    pub fn seek_to(&mut self, offset: u64) -> Result<u64> {
        if self.closed {
            return Err(Error::Closed);
        }
        if offset > self.media_size {
            return Err(Error::OutOfBounds {
                offset,
                media_size: self.media_size,
            });
        }
        self.cursor = offset;
        Ok(offset)
    }

    /// Read up to `buf.len()` bytes at the given virtual offset.
    ///
    /// Returns the number of bytes produced, which is less than requested
    /// only when the read reaches end of media or a fault interrupts it.
    /// In the latter case the bytes read so far are returned and the error
    /// surfaces on the next call.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if let Some(error) = self.pending_error.take() {
            return Err(error);
        }
        if self.closed {
            return Err(Error::Closed);
        }
        if offset > self.media_size {
            return Err(Error::OutOfBounds {
                offset,
                media_size: self.media_size,
            });
        }
        let len = buf.len().min((self.media_size - offset) as usize);
        let mut done = 0usize;
        while done < len {
            if self.abort.load(Ordering::Relaxed) {
                return self.fail(Error::Aborted, done);
            }
            let position = offset + done as u64;
            let index = self.extent_index(position);
            let chunk_result = {
                let entry = &mut self.extents[index];
                let within = position - entry.v_start;
                let chunk = (len - done).min((entry.v_len - within) as usize);
                let out = &mut buf[done..done + chunk];
                match &mut entry.slot {
                    ExtentSlot::Zero => {
                        out.fill(0);
                        Ok(chunk)
                    }
                    ExtentSlot::Flat { file, file_offset } => self
                        .pool
                        .read_exact_at(*file, *file_offset + within, out)
                        .map(|()| chunk),
                    ExtentSlot::Sparse(extent) => {
                        extent.read_at(self.pool.as_mut(), &mut self.grain_data, index, within, out)
                    }
                }
            };
            match chunk_result {
                Ok(n) => done += n,
                Err(error) => return self.fail(error, done),
            }
        }
        Ok(done)
    }

    /// Index of the extent containing virtual position `position`.
    fn extent_index(&self, position: u64) -> usize {
        self.extents
            .partition_point(|entry| entry.v_start + entry.v_len <= position)
    }

    /// Record a mid-read fault. Structural and I/O faults close the handle;
    /// if bytes were already produced they are returned now and the error
    /// is surfaced by the next read.
    fn fail(&mut self, error: Error, done: usize) -> Result<usize> {
        if error.is_fatal() {
            debug!("closing image after fault: {}", error);
            self.closed = true;
        }
        if done > 0 {
            self.pending_error = Some(error);
            Ok(done)
        } else {
            Err(error)
        }
    }
}

fn into_io_error(error: Error) -> io::Error {
    let kind = match &error {
        Error::Io { source, .. } => source.kind(),
        Error::InvalidArgument { .. } | Error::OutOfBounds { .. } => io::ErrorKind::InvalidInput,
        Error::Aborted => io::ErrorKind::Interrupted,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, error)
}

impl Read for VmdkImage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cursor >= self.media_size && !self.closed && self.pending_error.is_none() {
            return Ok(0);
        }
        let n = self.read_at(self.cursor, buf).map_err(into_io_error)?;
        self.cursor += n as u64;
        Ok(n)
    }
}

impl Seek for VmdkImage {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.cursor.checked_add_signed(delta),
            SeekFrom::End(delta) => self.media_size.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek position overflows")
        })?;
        self.seek_to(target).map_err(into_io_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemPool;

    #[test]
    fn test_empty_layout_rejected() {
        let pool = Box::new(MemPool::new());
        assert!(matches!(
            VmdkImage::open(pool, &[]),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_zero_cache_capacity_rejected() {
        let layout = [ExtentLayout {
            file: None,
            kind: ExtentKind::Zero,
            sectors: 16,
            offset: 0,
        }];
        for (tables, grains) in [(0usize, 16usize), (16, 0), (0, 0)] {
            let options = OpenOptions {
                grain_table_cache: tables,
                grain_data_cache: grains,
                verify_secondary_directory: false,
            };
            let pool = Box::new(MemPool::new());
            assert!(matches!(
                VmdkImage::open_with_options(pool, &layout, options),
                Err(Error::InvalidArgument { .. })
            ));
        }
    }

    #[test]
    fn test_zero_extent_image() {
        let pool = Box::new(MemPool::new());
        let layout = [ExtentLayout {
            file: None,
            kind: ExtentKind::Zero,
            sectors: 16,
            offset: 0,
        }];
        let mut image = VmdkImage::open(pool, &layout).unwrap();
        assert_eq!(image.size(), 16 * 512);
        let mut buf = [0xFFu8; 64];
        assert_eq!(image.read_at(100, &mut buf).unwrap(), 64);
        assert_eq!(buf, [0u8; 64]);
    }

    #[test]
    fn test_flat_extent_with_offset_column() {
        let mut pool = MemPool::new();
        let mut data = vec![0u8; 3 * 512];
        data[512..].fill(0x42);
        pool.push(data);
        let layout = [ExtentLayout {
            file: Some(0),
            kind: ExtentKind::Flat,
            sectors: 2,
            offset: 1,
        }];
        let mut image = VmdkImage::open(Box::new(pool), &layout).unwrap();
        assert_eq!(image.size(), 1024);
        let mut buf = [0u8; 4];
        image.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0x42; 4]);
    }

    #[test]
    fn test_flat_extent_too_short() {
        let mut pool = MemPool::new();
        pool.push(vec![0u8; 512]);
        let layout = [ExtentLayout {
            file: Some(0),
            kind: ExtentKind::Flat,
            sectors: 4,
            offset: 0,
        }];
        assert!(matches!(
            VmdkImage::open(Box::new(pool), &layout),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_read_past_media_is_out_of_bounds() {
        let pool = Box::new(MemPool::new());
        let layout = [ExtentLayout {
            file: None,
            kind: ExtentKind::Zero,
            sectors: 2,
            offset: 0,
        }];
        let mut image = VmdkImage::open(pool, &layout).unwrap();
        let mut buf = [0u8; 8];
        // Exactly at the end: zero bytes, not an error.
        assert_eq!(image.read_at(1024, &mut buf).unwrap(), 0);
        assert!(matches!(
            image.read_at(1025, &mut buf),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_closed_handle_fails() {
        let pool = Box::new(MemPool::new());
        let layout = [ExtentLayout {
            file: None,
            kind: ExtentKind::Zero,
            sectors: 2,
            offset: 0,
        }];
        let mut image = VmdkImage::open(pool, &layout).unwrap();
        image.close();
        let mut buf = [0u8; 8];
        assert!(matches!(image.read_at(0, &mut buf), Err(Error::Closed)));
        assert!(matches!(image.seek_to(0), Err(Error::Closed)));
    }

    #[test]
    fn test_abort_fails_read_without_closing() {
        let pool = Box::new(MemPool::new());
        let layout = [ExtentLayout {
            file: None,
            kind: ExtentKind::Zero,
            sectors: 8,
            offset: 0,
        }];
        let mut image = VmdkImage::open(pool, &layout).unwrap();
        let abort = image.abort_handle();
        abort.signal_abort();
        let mut buf = [0u8; 16];
        assert!(matches!(image.read_at(0, &mut buf), Err(Error::Aborted)));
        assert!(!image.is_closed());
        abort.clear();
        assert_eq!(image.read_at(0, &mut buf).unwrap(), 16);
    }

    #[test]
    fn test_seek_bounds() {
        let pool = Box::new(MemPool::new());
        let layout = [ExtentLayout {
            file: None,
            kind: ExtentKind::Zero,
            sectors: 2,
            offset: 0,
        }];
        let mut image = VmdkImage::open(pool, &layout).unwrap();
        assert_eq!(image.seek_to(1024).unwrap(), 1024);
        assert!(matches!(
            image.seek_to(1025),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_std_read_seek() {
        let pool = Box::new(MemPool::new());
        let layout = [ExtentLayout {
            file: None,
            kind: ExtentKind::Zero,
            sectors: 2,
            offset: 0,
        }];
        let mut image = VmdkImage::open(pool, &layout).unwrap();
        image.seek(SeekFrom::End(-4)).unwrap();
        let mut buf = [0xAAu8; 16];
        assert_eq!(image.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &[0u8; 4]);
        assert_eq!(image.read(&mut buf).unwrap(), 0);
    }
}
