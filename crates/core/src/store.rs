//! Dense item vector storage.
//!
//! [`VectorStore`] owns the vectors added during the ingest phase, laid out
//! contiguously (item `i` occupies `data[i * f..(i + 1) * f]`) with one cached
//! L2 norm per item. [`ItemVectors`] is the borrowed view that tree building and
//! search read from; a ready index hands out the same view over its file image.

use crate::config::MAX_GAP_FILL;
use crate::distance::{norm, Metric};
use crate::error::{IndexError, Result};

/// Borrowed, read-only view over item vectors and their norms.
#[derive(Debug, Clone, Copy)]
pub struct ItemVectors<'a> {
    data: &'a [f32],
    norms: &'a [f32],
    dimension: usize,
}

impl<'a> ItemVectors<'a> {
    /// Wraps flat vector data. `data.len()` must equal `norms.len() * dimension`.
    pub fn new(data: &'a [f32], norms: &'a [f32], dimension: usize) -> Self {
        debug_assert_eq!(data.len(), norms.len() * dimension);
        Self {
            data,
            norms,
            dimension,
        }
    }

    /// Number of items.
    #[inline]
    pub fn len(&self) -> usize {
        self.norms.len()
    }

    /// Returns `true` if the view holds no items.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.norms.is_empty()
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Vector of item `id`. Caller guarantees `id < len()`.
    #[inline]
    pub fn vector(&self, id: u32) -> &'a [f32] {
        let start = id as usize * self.dimension;
        &self.data[start..start + self.dimension]
    }

    /// Cached L2 norm of item `id`. Caller guarantees `id < len()`.
    #[inline]
    pub fn norm(&self, id: u32) -> f32 {
        self.norms[id as usize]
    }

    /// Checks that `id` names an assigned item.
    pub fn check(&self, id: u32) -> Result<()> {
        if (id as usize) < self.len() {
            Ok(())
        } else {
            Err(IndexError::OutOfRange {
                id,
                n_items: self.len(),
            })
        }
    }

    /// Exact distance between two stored items.
    pub fn distance(&self, metric: Metric, i: u32, j: u32) -> Result<f32> {
        self.check(i)?;
        self.check(j)?;
        Ok(metric.distance(self.vector(i), self.norm(i), self.vector(j), self.norm(j)))
    }

    /// Raw flat vector data.
    pub fn data(&self) -> &'a [f32] {
        self.data
    }

    /// Raw norm array.
    pub fn norms(&self) -> &'a [f32] {
        self.norms
    }
}

/// Growable store for the ingest phase.
#[derive(Debug, Clone, Default)]
pub struct VectorStore {
    data: Vec<f32>,
    norms: Vec<f32>,
    dimension: usize,
    /// Ids that were zero-filled because a larger id was added first.
    holes: Vec<bool>,
}

impl VectorStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            data: Vec::new(),
            norms: Vec::new(),
            dimension,
            holes: Vec::new(),
        }
    }

    /// Number of items, including zero-filled gaps.
    pub fn len(&self) -> usize {
        self.norms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.norms.is_empty()
    }

    /// Stores `vector` under `id`.
    ///
    /// Ids beyond the current count zero-fill the gap, keeping ids dense; a gap
    /// id may be filled later. A gap of more than [`MAX_GAP_FILL`] values is
    /// rejected with `OutOfRange`. Re-adding an id that already holds a vector
    /// is rejected. A failed call leaves the store unchanged.
    pub fn add_item(&mut self, id: u32, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let idx = id as usize;
        if idx < self.len() {
            if !self.holes[idx] {
                return Err(IndexError::ItemAlreadyExists(id));
            }
            self.holes[idx] = false;
            let start = idx * self.dimension;
            self.data[start..start + self.dimension].copy_from_slice(vector);
            self.norms[idx] = norm(vector);
            return Ok(());
        }
        let gap = idx - self.len();
        let fill = gap
            .checked_mul(self.dimension)
            .filter(|&fill| fill <= MAX_GAP_FILL)
            .ok_or(IndexError::OutOfRange {
                id,
                n_items: self.len(),
            })?;
        self.data
            .try_reserve(fill + self.dimension)
            .map_err(|e| IndexError::InvalidConfig(format!("cannot store item {id}: {e}")))?;
        if gap > 0 {
            self.data.resize(idx * self.dimension, 0.0);
            self.norms.resize(idx, 0.0);
            self.holes.resize(idx, true);
        }
        self.data.extend_from_slice(vector);
        self.norms.push(norm(vector));
        self.holes.push(false);
        Ok(())
    }

    /// Borrowed view over the current contents.
    pub fn view(&self) -> ItemVectors<'_> {
        ItemVectors::new(&self.data, &self.norms, self.dimension)
    }
}
