//! On-disk index layout.
//!
//! An index file is a sequence of little-endian 32-bit words:
//!
//! ```text
//! header   16 words (see Header)
//! roots    n_trees words
//! arena    n_nodes * stride words
//! vectors  n_items * dimension f32 bits
//! norms    n_items f32 bits
//! ```
//!
//! The header carries two CRC32s: one over its own first twelve words and one
//! over everything after the header. Only the header checksum is checked on
//! every load; the body checksum is checked by `verify_index_file`.

use crate::config::{FORMAT_MAGIC, FORMAT_VERSION, HEADER_WORDS, MAX_BUCKET_SIZE, MAX_DIMENSION};
use crate::distance::Metric;
use crate::error::{IndexError, Result};
use crate::forest::NodeLayout;
use serde::Serialize;
use std::borrow::Cow;
use std::ops::Range;

const MAGIC: usize = 0;
const VERSION: usize = 1;
const DIMENSION: usize = 2;
const METRIC: usize = 3;
const BUCKET_SIZE: usize = 4;
const STRIDE: usize = 5;
const N_ITEMS: usize = 6;
const N_TREES: usize = 7;
const N_NODES: usize = 8;
const SEED_LO: usize = 9;
const SEED_HI: usize = 10;
const BODY_CRC: usize = 11;
const HEADER_CRC: usize = 12;

/// Decoded file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Header {
    pub version: u32,
    pub dimension: u32,
    pub metric: Metric,
    pub bucket_size: u32,
    pub stride: u32,
    pub n_items: u32,
    pub n_trees: u32,
    pub n_nodes: u32,
    pub seed: u64,
    pub body_crc: u32,
}

/// Word ranges of each body section, relative to the start of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyLayout {
    pub roots: Range<usize>,
    pub arena: Range<usize>,
    pub vectors: Range<usize>,
    pub norms: Range<usize>,
    /// Total file length in words.
    pub total: usize,
}

impl Header {
    pub fn node_layout(&self) -> NodeLayout {
        NodeLayout::new(self.dimension as usize, self.bucket_size as usize)
    }

    /// Serializes the header, filling in its own checksum.
    pub fn encode(&self) -> [u32; HEADER_WORDS] {
        let mut words = [0u32; HEADER_WORDS];
        words[MAGIC] = FORMAT_MAGIC;
        words[VERSION] = self.version;
        words[DIMENSION] = self.dimension;
        words[METRIC] = self.metric.tag();
        words[BUCKET_SIZE] = self.bucket_size;
        words[STRIDE] = self.stride;
        words[N_ITEMS] = self.n_items;
        words[N_TREES] = self.n_trees;
        words[N_NODES] = self.n_nodes;
        words[SEED_LO] = self.seed as u32;
        words[SEED_HI] = (self.seed >> 32) as u32;
        words[BODY_CRC] = self.body_crc;
        words[HEADER_CRC] = words_crc(&words[..HEADER_CRC]);
        words
    }

    /// Parses and checks the header at the start of `words`.
    pub fn decode(words: &[u32]) -> Result<Self> {
        if words.len() < HEADER_WORDS {
            return Err(IndexError::CorruptFormat(format!(
                "file holds {} words, shorter than the {HEADER_WORDS}-word header",
                words.len()
            )));
        }
        if words[MAGIC] != FORMAT_MAGIC {
            return Err(IndexError::CorruptFormat(format!(
                "bad magic {:#010x}",
                words[MAGIC]
            )));
        }
        if words[VERSION] != FORMAT_VERSION {
            return Err(IndexError::CorruptFormat(format!(
                "unsupported format version {} (expected {FORMAT_VERSION})",
                words[VERSION]
            )));
        }
        let crc = words_crc(&words[..HEADER_CRC]);
        if crc != words[HEADER_CRC] {
            return Err(IndexError::CorruptFormat(format!(
                "header checksum mismatch: stored {:#010x}, computed {crc:#010x}",
                words[HEADER_CRC]
            )));
        }
        let metric = Metric::from_tag(words[METRIC]).ok_or_else(|| {
            IndexError::CorruptFormat(format!("unknown metric tag {}", words[METRIC]))
        })?;

        let header = Header {
            version: words[VERSION],
            dimension: words[DIMENSION],
            metric,
            bucket_size: words[BUCKET_SIZE],
            stride: words[STRIDE],
            n_items: words[N_ITEMS],
            n_trees: words[N_TREES],
            n_nodes: words[N_NODES],
            seed: u64::from(words[SEED_LO]) | (u64::from(words[SEED_HI]) << 32),
            body_crc: words[BODY_CRC],
        };
        header.check_geometry()?;
        Ok(header)
    }

    fn check_geometry(&self) -> Result<()> {
        let dimension = self.dimension as usize;
        if dimension == 0 || dimension > MAX_DIMENSION {
            return Err(IndexError::CorruptFormat(format!(
                "dimension {dimension} outside 1..={MAX_DIMENSION}"
            )));
        }
        let bucket_size = self.bucket_size as usize;
        if bucket_size == 0 || bucket_size > MAX_BUCKET_SIZE {
            return Err(IndexError::CorruptFormat(format!(
                "bucket size {bucket_size} outside 1..={MAX_BUCKET_SIZE}"
            )));
        }
        let expected = self.node_layout().stride;
        if self.stride as usize != expected {
            return Err(IndexError::CorruptFormat(format!(
                "node stride {} does not match dimension {} and bucket size {} (expected {expected})",
                self.stride, self.dimension, self.bucket_size
            )));
        }
        Ok(())
    }

    /// Section ranges implied by this header. Fails if the sizes overflow.
    pub fn body_layout(&self) -> Result<BodyLayout> {
        let overflow = || IndexError::CorruptFormat("section sizes overflow".into());
        let n_items = self.n_items as usize;
        let roots_end = HEADER_WORDS
            .checked_add(self.n_trees as usize)
            .ok_or_else(overflow)?;
        let arena_end = (self.n_nodes as usize)
            .checked_mul(self.stride as usize)
            .and_then(|w| w.checked_add(roots_end))
            .ok_or_else(overflow)?;
        let vectors_end = n_items
            .checked_mul(self.dimension as usize)
            .and_then(|w| w.checked_add(arena_end))
            .ok_or_else(overflow)?;
        let norms_end = vectors_end.checked_add(n_items).ok_or_else(overflow)?;
        Ok(BodyLayout {
            roots: HEADER_WORDS..roots_end,
            arena: roots_end..arena_end,
            vectors: arena_end..vectors_end,
            norms: vectors_end..norms_end,
            total: norms_end,
        })
    }
}

/// Little-endian bytes of `words`; borrowed on little-endian targets.
pub fn word_bytes(words: &[u32]) -> Cow<'_, [u8]> {
    if cfg!(target_endian = "little") {
        Cow::Borrowed(bytemuck::cast_slice(words))
    } else {
        Cow::Owned(words.iter().flat_map(|w| w.to_le_bytes()).collect())
    }
}

/// CRC32 of the little-endian encoding of `words`.
pub fn words_crc(words: &[u32]) -> u32 {
    crc32fast::hash(&word_bytes(words))
}
