//! Error types for the parann crate.

use thiserror::Error;

use crate::point::Metric;

/// Result type alias for parann operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during clustering, groundtruth computation and I/O.
///
/// `EmptyLeaf`, `IndexOutOfRange` and `DuplicateLeafSlot` signal corrupted
/// input or a broken partition primitive. They abort the whole call and no
/// partial result is returned.
#[derive(Error, Debug)]
pub enum Error {
    /// The partition primitive delivered a leaf with no indices.
    #[error("Partition produced an empty leaf set")]
    EmptyLeaf,

    /// A point index is outside the point range.
    #[error("Point index {index} out of range for {len} points")]
    IndexOutOfRange { index: usize, len: usize },

    /// Two leaves claimed the same output slot.
    #[error("Leaf slot {slot} written twice")]
    DuplicateLeafSlot { slot: usize },

    /// Invalid parameter value.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Dimension mismatch between two point ranges.
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Base and query ranges declare different metrics.
    #[error("Metric mismatch: base uses {base}, queries use {query}")]
    MetricMismatch { base: Metric, query: Metric },

    /// A binary file does not match the expected layout.
    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
