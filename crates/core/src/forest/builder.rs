//! Single-tree construction by iterative random-projection partitioning.
//!
//! A working set larger than the bucket size is split by the perpendicular
//! bisector of two randomly sampled members; each side becomes a new working
//! set. Pending working sets live on an explicit stack, so deep trees never
//! grow the call stack, and node indices are assigned in a fixed pre-order:
//! the same seed always yields the same arena.

use crate::config::SPLIT_ATTEMPTS;
use crate::distance::{Hyperplane, Metric, Side};
use crate::forest::arena::{ArenaBuf, NodeLayout};
use crate::store::ItemVectors;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Counters collected while building one tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub nodes: usize,
    pub leaves: usize,
    pub max_depth: usize,
    /// Splits that fell back to random bisection.
    pub forced_splits: usize,
}

impl TreeStats {
    pub fn merge(&mut self, other: &TreeStats) {
        self.nodes += other.nodes;
        self.leaves += other.leaves;
        self.max_depth = self.max_depth.max(other.max_depth);
        self.forced_splits += other.forced_splits;
    }
}

/// One tree's nodes, with tree-local indices. The root is node 0.
#[derive(Debug, Clone)]
pub struct BuiltTree {
    pub arena: ArenaBuf,
    pub stats: TreeStats,
}

/// A pending working set.
struct Frame {
    items: Vec<u32>,
    /// Split node (and side) that must point at the node built from this frame.
    parent: Option<(u32, Side)>,
    depth: usize,
}

struct Partition {
    plane: Hyperplane,
    left: Vec<u32>,
    right: Vec<u32>,
    forced: bool,
}

/// Builds one tree over all items of `items`.
pub struct TreeBuilder<'a> {
    items: ItemVectors<'a>,
    metric: Metric,
    layout: NodeLayout,
    rng: StdRng,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(items: ItemVectors<'a>, metric: Metric, layout: NodeLayout, seed: u64) -> Self {
        Self {
            items,
            metric,
            layout,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn build(mut self) -> BuiltTree {
        let n_items = self.items.len();
        let leaves_hint = n_items / self.layout.bucket_size.max(1) + 1;
        let mut arena = ArenaBuf::with_capacity(self.layout, 2 * leaves_hint);
        let mut stats = TreeStats::default();
        let mut stack = vec![Frame {
            items: (0..n_items as u32).collect(),
            parent: None,
            depth: 0,
        }];

        while let Some(frame) = stack.pop() {
            stats.max_depth = stats.max_depth.max(frame.depth);
            let idx = if frame.items.len() <= self.layout.bucket_size {
                stats.leaves += 1;
                arena.push_leaf(&frame.items)
            } else {
                let partition = self.partition(&frame.items);
                if partition.forced {
                    stats.forced_splits += 1;
                }
                let idx = arena.push_split(&partition.plane, frame.items.len() as u32);
                // Right is pushed first so the left subtree is numbered first.
                stack.push(Frame {
                    items: partition.right,
                    parent: Some((idx, Side::Right)),
                    depth: frame.depth + 1,
                });
                stack.push(Frame {
                    items: partition.left,
                    parent: Some((idx, Side::Left)),
                    depth: frame.depth + 1,
                });
                idx
            };
            if let Some((parent, side)) = frame.parent {
                arena.set_child(parent, side, idx);
            }
        }

        stats.nodes = arena.len();
        BuiltTree { arena, stats }
    }

    /// Splits `ids` (more than one item) into two non-empty sides.
    fn partition(&mut self, ids: &[u32]) -> Partition {
        for _ in 0..SPLIT_ATTEMPTS {
            let Some(plane) = self.sample_plane(ids) else {
                continue;
            };
            let (left, right): (Vec<u32>, Vec<u32>) = ids.iter().copied().partition(|&id| {
                Side::of_margin(plane.margin(self.items.vector(id))) == Side::Left
            });
            if !left.is_empty() && !right.is_empty() {
                return Partition {
                    plane,
                    left,
                    right,
                    forced: false,
                };
            }
        }
        self.random_bisection(ids)
    }

    /// Bisector of two distinct members of `ids`, or `None` if they coincide.
    fn sample_plane(&mut self, ids: &[u32]) -> Option<Hyperplane> {
        let n = ids.len();
        let i = self.rng.gen_range(0..n);
        let mut j = self.rng.gen_range(0..n - 1);
        if j >= i {
            j += 1;
        }
        let (a, b) = (ids[i], ids[j]);
        self.metric.split_plane(
            self.items.vector(a),
            self.items.norm(a),
            self.items.vector(b),
            self.items.norm(b),
        )
    }

    /// Coin flip per item, with both sides guaranteed non-empty.
    fn random_bisection(&mut self, ids: &[u32]) -> Partition {
        let mut left = Vec::with_capacity(ids.len() / 2 + 1);
        let mut right = Vec::with_capacity(ids.len() / 2 + 1);
        for &id in ids {
            if self.rng.gen_bool(0.5) {
                right.push(id);
            } else {
                left.push(id);
            }
        }
        if left.is_empty() {
            if let Some(id) = right.pop() {
                left.push(id);
            }
        } else if right.is_empty() {
            if let Some(id) = left.pop() {
                right.push(id);
            }
        }
        Partition {
            plane: Hyperplane::zero(self.layout.dimension),
            left,
            right,
            forced: true,
        }
    }
}
