//! Sparse extent machinery: headers, index structures and grain reads.

pub mod directory;
pub mod empty;
pub mod extent;
pub mod header;
pub mod table;

pub use directory::{GrainDirectory, GrainGroupRef};
pub use empty::detect_fill;
pub use extent::{CachedGrain, GrainDataCache, GrainDataKey, SparseExtent};
pub use header::{
    Compression, CowdHeader, ExtentGeometry, SparseHeader, VmdkHeader, COWD_SIGNATURE,
    HEADER_SIZE, SECTOR_SIZE, VMDK_SIGNATURE,
};
pub use table::{GrainMarker, GrainRef, GrainTable};
