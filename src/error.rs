//! Error handling.

use ndarray::ShapeError;
use thiserror::Error;
use tokio::sync::AcquireError;

/// Reduction engine error type
///
/// This type encapsulates the various errors that may occur. Validation
/// errors are raised eagerly, before any partitioning or I/O takes place;
/// per-partition I/O errors propagate through the executor's result channel
/// without affecting other in-flight partitions.
#[derive(Debug, Error)]
pub enum QuadStemError {
    /// Format header magic/signature mismatch
    #[error("invalid magic number: {observed:#x} != {expected:#x}")]
    FormatInvalid { expected: u64, observed: u64 },

    /// Format header could not be read
    #[error("failed to read dataset header from {path}")]
    HeaderUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// File size inconsistent with the declared geometry
    #[error("file size {actual} does not match declared geometry ({expected} bytes)")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Tile or partition geometry incompatible with the dataset shape
    #[error("incompatible geometry: {reason}")]
    Geometry { reason: String },

    /// Crop region not aligned to whole signal frames
    #[error("this dataset only supports whole-frame crop regions")]
    UnsupportedCrop,

    /// Complex-valued masks have no sparse representation
    #[error("complex masks do not support the sparse representation")]
    ComplexSparse,

    /// Error reading data from the underlying storage
    #[error("failed to read dataset data from {path}")]
    DatasetRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Error converting from bytes to a type
    #[error("failed to convert from bytes to {type_name}")]
    FromBytes { type_name: &'static str },

    /// Error creating ndarray view from a shape
    #[error("failed to create array from shape")]
    ShapeInvalid(#[from] ShapeError),

    /// Error converting between integer types
    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),

    /// Insufficient memory to process a partition
    #[error("insufficient memory to process partition ({requested} > {total})")]
    InsufficientMemory { requested: usize, total: usize },

    /// Error acquiring a semaphore
    #[error("error acquiring resources")]
    SemaphoreAcquire(#[from] AcquireError),

    /// A worker task panicked or was aborted
    #[error("worker task failed")]
    TaskJoin(#[from] tokio::task::JoinError),

    /// A partial result does not fit the result buffer
    #[error("partial result does not fit result buffer: {reason}")]
    ResultMismatch { reason: String },
}

impl QuadStemError {
    /// Shorthand for a geometry validation failure.
    pub fn geometry(reason: impl Into<String>) -> Self {
        QuadStemError::Geometry {
            reason: reason.into(),
        }
    }
}
