//! Error types for index construction, queries, and persistence.

use crate::distance::Metric;
use thiserror::Error;

/// Errors returned by [`AnnIndex`](crate::index::AnnIndex) operations.
///
/// Every failure is reported to the caller; nothing is retried internally.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Vector length differs from the index dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// The index dimension.
        expected: usize,
        /// The length that was supplied.
        actual: usize,
    },

    /// Item id is not assigned.
    #[error("item {id} out of range (index holds {n_items} items)")]
    OutOfRange {
        /// The requested id.
        id: u32,
        /// Number of items currently held.
        n_items: usize,
    },

    /// Build requested on an index with no items.
    #[error("cannot build an index with zero items")]
    EmptyIndex,

    /// Mutation or rebuild after the index became ready.
    #[error("index already built; items and trees are immutable")]
    BuildAlreadyFinalized,

    /// Query issued while the index is still ingesting items.
    #[error("index not built yet")]
    IndexNotBuilt,

    /// Operation issued after `unload`.
    #[error("index not loaded")]
    IndexNotLoaded,

    /// Item id was already assigned a vector.
    #[error("item {0} already exists")]
    ItemAlreadyExists(u32),

    /// Index file was built with a different metric than the handle expects.
    #[error("metric mismatch: expected {expected}, file holds {actual}")]
    MetricMismatch {
        /// The handle's metric.
        expected: Metric,
        /// The metric recorded in the file.
        actual: Metric,
    },

    /// Rejected configuration or argument.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Sized build thread pool could not be created.
    #[error("thread pool error: {0}")]
    ThreadPool(String),

    /// Disk error during save or load.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// File marker, version, checksum, length, or structure is invalid.
    #[error("corrupt index file: {0}")]
    CorruptFormat(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, IndexError>;
