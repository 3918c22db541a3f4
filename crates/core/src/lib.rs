//! # rpforest-core
//!
//! Approximate nearest neighbor search over a forest of random-projection
//! trees, with a flat node arena that is identical in memory and on disk so a
//! saved index can be memory-mapped and shared by many readers.
//!
//! This is the core library crate with no async or CLI dependencies, suitable
//! for embedding directly or behind a language binding.

/// Global configuration constants: format markers, limits, and tuning parameters.
pub mod config;
/// Angular and Euclidean distances, margins, and splitting hyperplanes.
pub mod distance;
/// Error type shared by every operation.
pub mod error;
/// Node arena, single-tree builder, and parallel forest construction.
pub mod forest;
/// The two-phase `AnnIndex` object and its configuration.
pub mod index;
/// Best-first multi-tree k-NN search.
pub mod search;
/// File layout, the ready index image, save, load, and verification.
pub mod storage;
/// Item vector storage for the ingest phase.
pub mod store;

pub use distance::Metric;
pub use error::{IndexError, Result};
pub use index::{AnnIndex, IndexConfig};
pub use search::Neighbor;
pub use storage::{verify_index_file, Header};
