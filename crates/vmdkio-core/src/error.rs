//! Error types for the vmdkio core library.

use std::path::PathBuf;

/// The main error type for VMDK read operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An argument was out of range or otherwise unusable.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A sparse extent file header failed signature or sanity checks.
    #[error("malformed header: {message}")]
    MalformedHeader { message: String },

    /// The image uses a format feature this library does not implement.
    #[error("unsupported feature: {message}")]
    UnsupportedFeature { message: String },

    /// A grain or its marker is inconsistent with the index that points at it.
    #[error("malformed grain: {message}")]
    MalformedGrain { message: String },

    /// A compressed grain failed to inflate to the expected size.
    #[error("decompression failed: {message}")]
    Decompress { message: String },

    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// The handle was closed, either explicitly or by an earlier fault.
    #[error("image handle is closed")]
    Closed,

    /// The abort flag was raised while a read was in progress.
    #[error("read aborted")]
    Aborted,

    /// A position beyond the end of the virtual disk was requested.
    #[error("offset {offset} is out of bounds (media size {media_size})")]
    OutOfBounds { offset: u64, media_size: u64 },
}

/// A specialized Result type for VMDK read operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an invalid-argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a malformed-header error.
    pub fn malformed_header(message: impl Into<String>) -> Self {
        Self::MalformedHeader {
            message: message.into(),
        }
    }

    /// Create an unsupported-feature error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedFeature {
            message: message.into(),
        }
    }

    /// Create a malformed-grain error.
    pub fn malformed_grain(message: impl Into<String>) -> Self {
        Self::MalformedGrain {
            message: message.into(),
        }
    }

    /// Create a decompression error.
    pub fn decompress(message: impl Into<String>) -> Self {
        Self::Decompress {
            message: message.into(),
        }
    }

    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// True for faults that poison the handle: structural and I/O failures
    /// close the image, out-of-bounds requests and aborts do not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MalformedHeader { .. }
                | Self::MalformedGrain { .. }
                | Self::Decompress { .. }
                | Self::Io { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}
