//! Storage layer: on-disk layout and the ready index image.
//!
//! A ready index is one flat word buffer in file layout, owned after a build or
//! a full read, or memory-mapped after a load. Writes use an atomic temp-file +
//! rename; a CRC32 in the header guards the header and another guards the body.

/// File header, section layout, and checksums.
pub mod format;
/// Index image assembly, save, load, and verification.
pub mod persistence;

pub use format::Header;
pub use persistence::{verify_index_file, IndexImage};
