//! Random-projection forest: an ordered list of tree roots over one shared arena.
//!
//! Trees are independent: each is built by its own [`TreeBuilder`] with a seed
//! derived from the index seed and the tree ordinal, into a private
//! [`ArenaBuf`] with tree-local indices. Builders run in parallel on rayon; a
//! single writer then concatenates the buffers in tree order, relocating child
//! references. The resulting arena does not depend on the number of threads.

/// Flat node records and their views.
pub mod arena;
/// Iterative single-tree builder.
pub mod builder;

pub use arena::{ArenaBuf, Node, NodeArena, NodeLayout, SplitNode};
pub use builder::{BuiltTree, TreeBuilder, TreeStats};

use crate::config::TREE_SEED_STRIDE;
use crate::distance::Metric;
use crate::error::{IndexError, Result};
use crate::store::ItemVectors;
use rayon::prelude::*;

/// A freshly built forest: root list plus the shared arena.
#[derive(Debug, Clone)]
pub struct Forest {
    pub roots: Vec<u32>,
    pub arena: ArenaBuf,
    pub stats: TreeStats,
}

/// Borrowed forest used by search, over either a built or a loaded image.
#[derive(Debug, Clone, Copy)]
pub struct ForestView<'a> {
    pub roots: &'a [u32],
    pub arena: NodeArena<'a>,
}

/// Seed for tree `tree` of an index seeded with `seed`.
pub fn tree_seed(seed: u64, tree: usize) -> u64 {
    seed.wrapping_add((tree as u64 + 1).wrapping_mul(TREE_SEED_STRIDE))
}

/// Builds `n_trees` trees over `items`.
///
/// `threads == 0` uses the global rayon pool; any other value builds on a
/// dedicated pool of that size.
pub fn build_forest(
    items: ItemVectors<'_>,
    metric: Metric,
    layout: NodeLayout,
    n_trees: usize,
    seed: u64,
    threads: usize,
) -> Result<Forest> {
    let build_all = || -> Vec<BuiltTree> {
        (0..n_trees)
            .into_par_iter()
            .map(|tree| TreeBuilder::new(items, metric, layout, tree_seed(seed, tree)).build())
            .collect()
    };
    let trees = if threads == 0 {
        build_all()
    } else {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| IndexError::ThreadPool(e.to_string()))?
            .install(build_all)
    };

    let total_nodes: usize = trees.iter().map(|t| t.arena.len()).sum();
    if total_nodes > u32::MAX as usize {
        return Err(IndexError::InvalidConfig(format!(
            "forest of {total_nodes} nodes exceeds the 32-bit node index space"
        )));
    }

    let mut arena = ArenaBuf::with_capacity(layout, total_nodes);
    let mut roots = Vec::with_capacity(n_trees);
    let mut stats = TreeStats::default();
    for (i, tree) in trees.iter().enumerate() {
        roots.push(arena.append_relocated(&tree.arena));
        stats.merge(&tree.stats);
        tracing::debug!(
            tree = i,
            nodes = tree.stats.nodes,
            leaves = tree.stats.leaves,
            depth = tree.stats.max_depth,
            forced_splits = tree.stats.forced_splits,
            "tree built"
        );
    }

    Ok(Forest {
        roots,
        arena,
        stats,
    })
}

impl Forest {
    pub fn view(&self) -> ForestView<'_> {
        ForestView {
            roots: &self.roots,
            arena: self.arena.view(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::VectorStore;

    fn grid_store() -> VectorStore {
        let mut store = VectorStore::new(2);
        let mut id = 0;
        for x in 0..20 {
            for y in 0..20 {
                store.add_item(id, &[x as f32, y as f32]).unwrap();
                id += 1;
            }
        }
        store
    }

    #[test]
    fn test_roots_point_at_tree_starts() {
        let store = grid_store();
        let layout = NodeLayout::new(2, 8);
        let forest = build_forest(store.view(), Metric::Euclidean, layout, 4, 1, 0).unwrap();
        assert_eq!(forest.roots.len(), 4);
        assert_eq!(forest.roots[0], 0);
        assert!(forest.roots.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(forest.stats.nodes, forest.arena.len());
        assert!(forest.arena.view().validate(&forest.roots, 400).is_ok());
    }

    #[test]
    fn test_thread_count_does_not_change_arena() {
        let store = grid_store();
        let layout = NodeLayout::new(2, 5);
        let parallel = build_forest(store.view(), Metric::Angular, layout, 6, 9, 0).unwrap();
        let serial = build_forest(store.view(), Metric::Angular, layout, 6, 9, 1).unwrap();
        assert_eq!(parallel.roots, serial.roots);
        assert_eq!(parallel.arena.words(), serial.arena.words());
    }

    #[test]
    fn test_tree_seeds_differ() {
        assert_ne!(tree_seed(0, 0), tree_seed(0, 1));
        assert_ne!(tree_seed(0, 0), 0);
    }
}
