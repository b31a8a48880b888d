//! Pooled random-access I/O over the files backing an image.
//!
//! A VMDK image may span several extent data files. The read engine never
//! touches the filesystem directly; it addresses files by their index in an
//! [`IoPool`] and asks for absolute-offset reads. This keeps path handling,
//! descriptor resolution and OS handles outside the core.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use memmap2::Mmap;

use crate::error::{Error, Result};

/// Random access to a set of backing files, addressed by pool index.
///
/// Implementations must not return short reads: `read_exact_at` either
/// fills the whole buffer or fails.
pub trait IoPool {
    /// Fill `buf` with bytes starting at `offset` in file `index`.
    fn read_exact_at(&mut self, index: usize, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// The size in bytes of file `index`.
    fn size(&mut self, index: usize) -> Result<u64>;

    /// Number of files in the pool.
    fn len(&self) -> usize;

    /// True if the pool holds no files.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn bad_index(index: usize, len: usize) -> Error {
    Error::invalid_argument(format!("file index {} out of range (pool has {})", index, len))
}

/// An [`IoPool`] over open file handles, reading with seek + read.
#[derive(Debug)]
pub struct FilePool {
    files: Vec<File>,
}

impl FilePool {
    /// Wrap already-opened files.
    pub fn new(files: Vec<File>) -> Self {
        Self { files }
    }

    /// Open every path read-only, in order.
    pub fn from_paths<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            files.push(File::open(path).map_err(|e| Error::io(e, path))?);
        }
        Ok(Self { files })
    }

    /// Append a file, returning its pool index.
    pub fn push(&mut self, file: File) -> usize {
        self.files.push(file);
        self.files.len() - 1
    }
}

impl IoPool for FilePool {
    fn read_exact_at(&mut self, index: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        let len = self.files.len();
        let file = self.files.get_mut(index).ok_or_else(|| bad_index(index, len))?;
        file.seek(SeekFrom::Start(offset)).map_err(Error::io_simple)?;
        file.read_exact(buf).map_err(Error::io_simple)
    }

    fn size(&mut self, index: usize) -> Result<u64> {
        let len = self.files.len();
        let file = self.files.get(index).ok_or_else(|| bad_index(index, len))?;
        Ok(file.metadata().map_err(Error::io_simple)?.len())
    }

    fn len(&self) -> usize {
        self.files.len()
    }
}

/// An [`IoPool`] over memory-mapped files.
///
/// Lets the operating system manage caching and paging; reads are plain
/// slice copies.
pub struct MmapPool {
    maps: Vec<Mmap>,
}

impl MmapPool {
    /// Map every path read-only, in order.
    pub fn from_paths<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut maps = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let file = File::open(path).map_err(|e| Error::io(e, path))?;
            // Safety: the mapping is read-only and the file was just opened
            // by us; it stays alive for the lifetime of the Mmap.
            let map = unsafe { Mmap::map(&file).map_err(|e| Error::io(e, path))? };
            maps.push(map);
        }
        Ok(Self { maps })
    }
}

impl IoPool for MmapPool {
    fn read_exact_at(&mut self, index: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        let len = self.maps.len();
        let map = self.maps.get(index).ok_or_else(|| bad_index(index, len))?;
        let start = usize::try_from(offset)
            .map_err(|_| Error::invalid_argument(format!("offset {} exceeds address space", offset)))?;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= map.len())
            .ok_or_else(|| {
                Error::io_simple(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("read of {} bytes at {} exceeds mapped file", buf.len(), offset),
                ))
            })?;
        buf.copy_from_slice(&map[start..end]);
        Ok(())
    }

    fn size(&mut self, index: usize) -> Result<u64> {
        let len = self.maps.len();
        let map = self.maps.get(index).ok_or_else(|| bad_index(index, len))?;
        Ok(map.len() as u64)
    }

    fn len(&self) -> usize {
        self.maps.len()
    }
}

/// An in-memory [`IoPool`], used by tests and fixture builders.
#[derive(Debug, Default)]
pub struct MemPool {
    buffers: Vec<Vec<u8>>,
}

impl MemPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a buffer as the next pool file, returning its index.
    pub fn push(&mut self, data: Vec<u8>) -> usize {
        self.buffers.push(data);
        self.buffers.len() - 1
    }
}

impl IoPool for MemPool {
    fn read_exact_at(&mut self, index: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        let len = self.buffers.len();
        let data = self.buffers.get(index).ok_or_else(|| bad_index(index, len))?;
        let start = usize::try_from(offset)
            .map_err(|_| Error::invalid_argument(format!("offset {} exceeds address space", offset)))?;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                Error::io_simple(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("read of {} bytes at {} exceeds buffer", buf.len(), offset),
                ))
            })?;
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn size(&mut self, index: usize) -> Result<u64> {
        let len = self.buffers.len();
        let data = self.buffers.get(index).ok_or_else(|| bad_index(index, len))?;
        Ok(data.len() as u64)
    }

    fn len(&self) -> usize {
        self.buffers.len()
    }
}
