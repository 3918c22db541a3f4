//! Global configuration constants for rpforest.
//!
//! Tuning parameters, input validation limits, and on-disk format constants are
//! defined here. These are compile-time constants; per-index runtime settings
//! live in [`IndexConfig`](crate::index::IndexConfig) and CLI arguments.

/// Four-byte marker at the start of every index file (`"RPFT"` read as a little-endian u32).
pub const FORMAT_MAGIC: u32 = u32::from_le_bytes(*b"RPFT");

/// On-disk format version. Bumped on any incompatible layout change.
pub const FORMAT_VERSION: u32 = 1;

/// Number of 32-bit words in the fixed file header.
pub const HEADER_WORDS: usize = 16;

/// Number of 32-bit words preceding the payload of every node record (`tag`, `count`).
pub const NODE_HEADER_WORDS: usize = 2;

/// Words an internal node stores besides its normal vector: left child, right child, bias.
pub const SPLIT_FIXED_WORDS: usize = 3;

/// How many hyperplanes are sampled for a working set before falling back to a
/// random bisection.
///
/// A sample fails when every item lands on the same side, or when the two
/// sampled items coincide so that no normal can be formed.
pub const SPLIT_ATTEMPTS: usize = 3;

/// Relative length below which two sampled items are considered coincident
/// and cannot define a splitting plane.
pub const SPLIT_EPSILON: f32 = 1e-6;

/// Maximum allowed vector dimension.
pub const MAX_DIMENSION: usize = 65_536;

/// Maximum allowed leaf bucket size. Keeps every node stride well inside the
/// `u32` header field.
pub const MAX_BUCKET_SIZE: usize = 65_536;

/// Maximum number of zero values `add_item` writes to fill the gap below a
/// new id (`gap ids * dimension`). Ids further out are rejected as out of range.
pub const MAX_GAP_FILL: usize = 1 << 28;

/// Seed used when the caller never calls `set_seed`.
pub const DEFAULT_SEED: u64 = 0x5EED_0F_A11_7EE5;

/// Multiplier used to derive one independent seed per tree from the index seed.
pub const TREE_SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;
