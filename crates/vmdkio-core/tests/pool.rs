//! File-backed I/O pool behavior.

mod common;

use std::io::Write;

use common::SparseImageBuilder;
use tempfile::NamedTempFile;
use vmdkio_core::image::VmdkImage;
use vmdkio_core::io::{FilePool, IoPool, MmapPool};

fn write_temp(data: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create temp file");
    file.write_all(data).expect("failed to write fixture");
    file.flush().expect("failed to flush");
    file
}

#[test]
fn file_pool_positioned_reads() {
    let pattern: Vec<u8> = (0u8..=255).cycle().take(2048).collect();
    let temp = write_temp(&pattern);
    let mut pool = FilePool::from_paths(&[temp.path()]).unwrap();
    assert_eq!(pool.len(), 1);
    assert_eq!(pool.size(0).unwrap(), 2048);

    let mut buf = [0u8; 8];
    pool.read_exact_at(0, 256, &mut buf).unwrap();
    assert_eq!(&buf, &pattern[256..264]);
    // Reads are idempotent in position: repeat the same offset.
    pool.read_exact_at(0, 256, &mut buf).unwrap();
    assert_eq!(&buf, &pattern[256..264]);

    assert!(pool.read_exact_at(0, 2045, &mut buf).is_err());
    assert!(pool.read_exact_at(1, 0, &mut buf).is_err());
}

#[test]
fn mmap_pool_matches_file_pool() {
    let pattern: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
    let temp = write_temp(&pattern);
    let mut files = FilePool::from_paths(&[temp.path()]).unwrap();
    let mut maps = MmapPool::from_paths(&[temp.path()]).unwrap();
    assert_eq!(files.size(0).unwrap(), maps.size(0).unwrap());

    let mut from_file = [0u8; 64];
    let mut from_map = [0u8; 64];
    for offset in [0u64, 100, 4000] {
        files.read_exact_at(0, offset, &mut from_file).unwrap();
        maps.read_exact_at(0, offset, &mut from_map).unwrap();
        assert_eq!(from_file, from_map, "mismatch at offset {}", offset);
    }
    assert!(maps.read_exact_at(0, 4090, &mut from_map).is_err());
}

#[test]
fn open_missing_path_reports_it() {
    let err = FilePool::from_paths(&["/nonexistent/path/disk.vmdk"]).unwrap_err();
    assert!(err.to_string().contains("/nonexistent/path/disk.vmdk"));
    assert!(MmapPool::from_paths(&["/nonexistent/path/disk.vmdk"]).is_err());
}

#[test]
fn image_opens_through_both_file_backends() {
    let fixture = SparseImageBuilder::new(256).fill_grain(0, 0x3C).build();
    let temp = write_temp(&fixture);

    let pool = FilePool::from_paths(&[temp.path()]).unwrap();
    let mut image = VmdkImage::open_single(Box::new(pool)).unwrap();
    let mut buf = [0u8; 16];
    image.read_at(0, &mut buf).unwrap();
    assert_eq!(buf, [0x3C; 16]);

    let pool = MmapPool::from_paths(&[temp.path()]).unwrap();
    let mut image = VmdkImage::open_single(Box::new(pool)).unwrap();
    let mut buf = [0u8; 16];
    image.read_at(0, &mut buf).unwrap();
    assert_eq!(buf, [0x3C; 16]);
}
