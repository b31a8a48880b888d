//! vmdkio Core Library
//!
//! This crate reads VMware VMDK virtual disk images and exposes the
//! virtual block device they describe as a contiguous, byte-addressable
//! range. Sparse extents (hosted `KDMV` and legacy `COWD` variants,
//! including stream-optimized images with compressed grains) are resolved
//! through their grain directory and grain tables; unallocated regions
//! read back as zeroes.
//!
//! # Modules
//!
//! - `error` - Error types and Result alias
//! - `bytes` - bounded little-endian field extraction
//! - `io` - pooled random-access I/O over the backing files
//! - `cache` - bounded LRU caches
//! - `descriptor` - descriptor text parsing into extent tuples
//! - `sparse` - sparse extent headers, index structures and grain reads
//! - `image` - the opened image handle and random-access resolver

pub mod bytes;
pub mod cache;
pub mod descriptor;
pub mod error;
pub mod image;
pub mod io;
pub mod sparse;

pub use error::{Error, Result};
pub use image::{
    AbortHandle, ExtentKind, ExtentLayout, ExtentSpan, OpenOptions, VmdkImage,
};
pub use io::{FilePool, IoPool, MemPool, MmapPool};
