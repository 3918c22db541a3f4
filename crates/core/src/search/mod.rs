//! Best-first k-NN search across every tree of a forest.
//!
//! One priority queue holds nodes from all trees. Roots start at `+inf`; at a
//! split, the child on the query's side inherits the parent's priority and the
//! other child gets `min(parent, -|margin|)`, so a far side close to the plane
//! stays competitive while one far beyond it sinks. Leaves feed a de-duplicated
//! candidate set until `search_k` ids are gathered; candidates are then ranked
//! by exact distance.

/// Per-query candidate set.
pub mod candidates;

use candidates::CandidateSet;
use crate::distance::{norm, Metric, Side};
use crate::forest::{ForestView, Node};
use crate::store::ItemVectors;
use ordered_float::OrderedFloat;
use serde::Serialize;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

thread_local! {
    /// Candidate set reused by every query on this thread.
    static SEARCH_CANDIDATES: RefCell<CandidateSet> = RefCell::new(CandidateSet::new());
}

/// One search result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Neighbor {
    pub id: u32,
    pub distance: f32,
}

/// Pending node in the traversal queue. Max-heap on priority; on ties the
/// lower node index pops first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueEntry {
    priority: OrderedFloat<f32>,
    node: u32,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Candidate budget used when the caller does not give one.
pub fn default_search_k(n: usize, n_trees: usize) -> usize {
    n.saturating_mul(n_trees)
}

/// Returns up to `n` approximate nearest items to `query`, nearest first, ties
/// broken by lower id.
///
/// `query.len()` must equal the item dimension. At least
/// `max(search_k, n)` candidates are gathered unless the forest runs out.
pub fn search(
    forest: ForestView<'_>,
    items: ItemVectors<'_>,
    metric: Metric,
    query: &[f32],
    n: usize,
    search_k: Option<usize>,
) -> Vec<Neighbor> {
    if n == 0 || items.is_empty() {
        return Vec::new();
    }
    let budget = search_k
        .unwrap_or_else(|| default_search_k(n, forest.roots.len()))
        .max(n)
        .min(items.len());

    let query_norm = norm(query);
    let mut ranked: Vec<Neighbor> = SEARCH_CANDIDATES.with(|cell| {
        let mut candidates = cell.borrow_mut();
        candidates.reset(items.len());
        collect_candidates(forest, query, budget, &mut candidates);
        candidates
            .ids()
            .iter()
            .map(|&id| Neighbor {
                id,
                distance: metric.distance(query, query_norm, items.vector(id), items.norm(id)),
            })
            .collect()
    });
    ranked.sort_unstable_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
    ranked.truncate(n);
    ranked
}

/// Pops nodes best-first until `budget` distinct ids are gathered or the
/// queue drains.
fn collect_candidates(
    forest: ForestView<'_>,
    query: &[f32],
    budget: usize,
    candidates: &mut CandidateSet,
) {
    let mut queue: BinaryHeap<QueueEntry> = forest
        .roots
        .iter()
        .map(|&node| QueueEntry {
            priority: OrderedFloat(f32::INFINITY),
            node,
        })
        .collect();

    while candidates.len() < budget {
        let Some(QueueEntry { priority, node }) = queue.pop() else {
            break;
        };
        match forest.arena.node(node) {
            Node::Leaf(ids) => candidates.extend_from_leaf(ids),
            Node::Split(split) => {
                let margin = crate::distance::margin(split.normal, split.bias, query);
                let near = Side::of_margin(margin);
                let far = match near {
                    Side::Left => Side::Right,
                    Side::Right => Side::Left,
                };
                queue.push(QueueEntry {
                    priority,
                    node: split.child(near),
                });
                queue.push(QueueEntry {
                    priority: priority.min(OrderedFloat(-margin.abs())),
                    node: split.child(far),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::{build_forest, Forest, NodeLayout};
    use crate::store::VectorStore;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_store(n: usize, dimension: usize, seed: u64) -> VectorStore {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut store = VectorStore::new(dimension);
        for id in 0..n {
            let v: Vec<f32> = (0..dimension).map(|_| rng.gen_range(-1.0..1.0)).collect();
            store.add_item(id as u32, &v).unwrap();
        }
        store
    }

    fn forest(store: &VectorStore, metric: Metric, n_trees: usize) -> Forest {
        let dim = store.view().dimension();
        let layout = NodeLayout::new(dim, NodeLayout::default_bucket_size(dim));
        build_forest(store.view(), metric, layout, n_trees, 17, 0).unwrap()
    }

    fn brute_force(store: &VectorStore, metric: Metric, query: &[f32], n: usize) -> Vec<u32> {
        let items = store.view();
        let qn = norm(query);
        let mut all: Vec<(f32, u32)> = (0..items.len() as u32)
            .map(|id| (metric.distance(query, qn, items.vector(id), items.norm(id)), id))
            .collect();
        all.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        all.into_iter().take(n).map(|(_, id)| id).collect()
    }

    #[test]
    fn test_full_budget_matches_brute_force() {
        let store = random_store(300, 5, 2);
        for metric in [Metric::Angular, Metric::Euclidean] {
            let f = forest(&store, metric, 3);
            let query = [0.2, -0.4, 0.1, 0.9, -0.3];
            let got = search(f.view(), store.view(), metric, &query, 10, Some(300));
            let ids: Vec<u32> = got.iter().map(|nb| nb.id).collect();
            assert_eq!(ids, brute_force(&store, metric, &query, 10), "{metric}");
            assert!(got.windows(2).all(|w| w[0].distance <= w[1].distance));
        }
    }

    #[test]
    fn test_results_are_distinct() {
        let store = random_store(200, 4, 5);
        let f = forest(&store, Metric::Euclidean, 10);
        let got = search(f.view(), store.view(), Metric::Euclidean, &[0.0; 4], 50, None);
        let mut ids: Vec<u32> = got.iter().map(|nb| nb.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), got.len());
    }

    #[test]
    fn test_ties_break_by_lower_id() {
        let mut store = VectorStore::new(2);
        store.add_item(0, &[5.0, 5.0]).unwrap();
        store.add_item(1, &[1.0, 0.0]).unwrap();
        store.add_item(2, &[0.0, 1.0]).unwrap();
        store.add_item(3, &[-1.0, 0.0]).unwrap();
        let f = forest(&store, Metric::Euclidean, 2);
        let got = search(f.view(), store.view(), Metric::Euclidean, &[0.0, 0.0], 3, None);
        let ids: Vec<u32> = got.iter().map(|nb| nb.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_zero_n_returns_nothing() {
        let store = random_store(20, 3, 1);
        let f = forest(&store, Metric::Angular, 2);
        assert!(search(f.view(), store.view(), Metric::Angular, &[1.0, 0.0, 0.0], 0, None).is_empty());
    }

    #[test]
    fn test_queue_prefers_priority_then_lower_node() {
        let mut heap = BinaryHeap::new();
        heap.push(QueueEntry {
            priority: OrderedFloat(-0.5),
            node: 1,
        });
        heap.push(QueueEntry {
            priority: OrderedFloat(f32::INFINITY),
            node: 9,
        });
        heap.push(QueueEntry {
            priority: OrderedFloat(f32::INFINITY),
            node: 4,
        });
        let order: Vec<u32> = std::iter::from_fn(|| heap.pop().map(|e| e.node)).collect();
        assert_eq!(order, vec![4, 9, 1]);
    }

    #[test]
    fn test_default_search_k() {
        assert_eq!(default_search_k(10, 5), 50);
        assert_eq!(default_search_k(usize::MAX, 2), usize::MAX);
    }
}
