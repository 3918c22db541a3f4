//! Distance metrics and splitting hyperplanes.
//!
//! Two metrics are supported. [`Metric::Angular`] compares directions only: it
//! reports `sqrt(2 - 2 cos θ)`, the Euclidean distance between the unit-normalized
//! vectors, so identical directions are at distance 0 regardless of magnitude.
//! [`Metric::Euclidean`] reports the plain L2 distance.
//!
//! Both metrics also define how a tree splits space: a [`Hyperplane`] sampled
//! from two items, and a signed margin that decides which side a vector falls on.

pub mod simd;

use crate::config::SPLIT_EPSILON;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use simd::{dot_f32, euclidean_sq_f32};

/// Distance metric selected at index creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Cosine-based distance on implicitly normalized vectors. Range: \[0, 2\].
    Angular,
    /// L2 distance on raw coordinates. Range: \[0, ∞).
    Euclidean,
}

/// Which child of a split a vector belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    /// Side selected by a signed margin. Points exactly on the plane go left.
    #[inline]
    pub fn of_margin(margin: f32) -> Self {
        if margin > 0.0 {
            Side::Right
        } else {
            Side::Left
        }
    }
}

/// A splitting hyperplane: `margin(x) = dot(normal, x) - bias`.
///
/// Angular planes always pass through the origin (`bias == 0`).
#[derive(Debug, Clone, PartialEq)]
pub struct Hyperplane {
    pub normal: Vec<f32>,
    pub bias: f32,
}

impl Hyperplane {
    /// The all-zero plane. Every margin is 0, so a query keeps the far child at
    /// the best far-side priority. Stored for forced random bisections.
    pub fn zero(dimension: usize) -> Self {
        Self {
            normal: vec![0.0; dimension],
            bias: 0.0,
        }
    }

    /// Signed margin of `x` against this plane.
    #[inline]
    pub fn margin(&self, x: &[f32]) -> f32 {
        margin(&self.normal, self.bias, x)
    }
}

/// Signed margin of `x` against the plane `(normal, bias)`.
#[inline]
pub fn margin(normal: &[f32], bias: f32, x: &[f32]) -> f32 {
    dot_f32(normal, x) - bias
}

/// L2 norm of a vector.
#[inline]
pub fn norm(v: &[f32]) -> f32 {
    dot_f32(v, v).sqrt()
}

impl Metric {
    /// Tag stored in the file header (1 = angular, 2 = euclidean).
    pub fn tag(self) -> u32 {
        match self {
            Metric::Angular => 1,
            Metric::Euclidean => 2,
        }
    }

    /// Inverse of [`Metric::tag`].
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Metric::Angular),
            2 => Some(Metric::Euclidean),
            _ => None,
        }
    }

    /// Distance between `a` and `b`, given their precomputed norms.
    ///
    /// Norms are only consulted by [`Metric::Angular`]. A zero-norm vector has no
    /// direction; its angular distance to anything is `sqrt(2)` (orthogonal).
    #[inline]
    pub fn distance(self, a: &[f32], a_norm: f32, b: &[f32], b_norm: f32) -> f32 {
        match self {
            Metric::Angular => {
                let denom = a_norm * b_norm;
                let d = if denom > 0.0 {
                    2.0 - 2.0 * dot_f32(a, b) / denom
                } else {
                    2.0
                };
                d.max(0.0).sqrt()
            }
            Metric::Euclidean => euclidean_sq_f32(a, b).max(0.0).sqrt(),
        }
    }

    /// Perpendicular bisector of two sampled items, or `None` when the items
    /// coincide (under this metric) and no normal can be formed.
    ///
    /// For angular the normal is the normalized difference of the two unit
    /// vectors. For euclidean it is the normalized difference of the raw
    /// vectors, with a bias placing the plane through their midpoint.
    pub fn split_plane(self, a: &[f32], a_norm: f32, b: &[f32], b_norm: f32) -> Option<Hyperplane> {
        let mut normal: Vec<f32> = match self {
            Metric::Angular => {
                let inv_a = if a_norm > 0.0 { 1.0 / a_norm } else { 0.0 };
                let inv_b = if b_norm > 0.0 { 1.0 / b_norm } else { 0.0 };
                a.iter()
                    .zip(b)
                    .map(|(x, y)| x * inv_a - y * inv_b)
                    .collect()
            }
            Metric::Euclidean => a.iter().zip(b).map(|(x, y)| x - y).collect(),
        };
        // Differences of unit vectors are compared absolutely, raw differences
        // relative to the larger sample.
        let scale = match self {
            Metric::Angular => 1.0,
            Metric::Euclidean => a_norm.max(b_norm),
        };
        let n = norm(&normal);
        if !n.is_finite() || n <= scale * SPLIT_EPSILON {
            return None;
        }
        for x in normal.iter_mut() {
            *x /= n;
        }
        let bias = match self {
            Metric::Angular => 0.0,
            Metric::Euclidean => {
                let midpoint: Vec<f32> = a.iter().zip(b).map(|(x, y)| 0.5 * (x + y)).collect();
                dot_f32(&normal, &midpoint)
            }
        };
        Some(Hyperplane { normal, bias })
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Angular => f.write_str("angular"),
            Metric::Euclidean => f.write_str("euclidean"),
        }
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "angular" | "cosine" => Ok(Metric::Angular),
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            other => Err(format!(
                "unknown metric '{other}' (expected 'angular' or 'euclidean')"
            )),
        }
    }
}
