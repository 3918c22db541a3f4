//! Flat, index-addressed node arena.
//!
//! Every node occupies one fixed-size record of `stride` 32-bit words, so node
//! `i` lives at `words[i * stride..(i + 1) * stride]` and children are referenced
//! by index, never by address. The same word layout is used in memory and on
//! disk, which lets a loaded file be traversed in place.
//!
//! ```text
//! word 0      tag      0 = leaf, 1 = split
//! word 1      count    leaf: number of items; split: items below this node
//! leaf:       item ids [count], zero padded
//! split:      left, right, bias (f32 bits), normal [f32; dimension]
//! ```

use crate::config::{MAX_BUCKET_SIZE, MAX_DIMENSION, NODE_HEADER_WORDS, SPLIT_FIXED_WORDS};
use crate::distance::{Hyperplane, Side};
use crate::error::{IndexError, Result};

const LEAF_TAG: u32 = 0;
const SPLIT_TAG: u32 = 1;

const LEFT: usize = NODE_HEADER_WORDS;
const RIGHT: usize = NODE_HEADER_WORDS + 1;
const BIAS: usize = NODE_HEADER_WORDS + 2;
const NORMAL: usize = NODE_HEADER_WORDS + SPLIT_FIXED_WORDS;

/// Record geometry shared by every node of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    pub dimension: usize,
    pub bucket_size: usize,
    pub stride: usize,
}

impl NodeLayout {
    /// Bucket size that exactly fills the payload of a split record.
    pub fn default_bucket_size(dimension: usize) -> usize {
        dimension + SPLIT_FIXED_WORDS
    }

    /// Geometry for parameters already checked by [`NodeLayout::try_new`].
    pub fn new(dimension: usize, bucket_size: usize) -> Self {
        let payload = dimension.saturating_add(SPLIT_FIXED_WORDS).max(bucket_size);
        Self {
            dimension,
            bucket_size,
            stride: payload.saturating_add(NODE_HEADER_WORDS),
        }
    }

    /// Checked geometry: both parameters within their limits and a stride
    /// that fits in a `u32`.
    pub fn try_new(dimension: usize, bucket_size: usize) -> Result<Self> {
        if dimension == 0 || dimension > MAX_DIMENSION {
            return Err(IndexError::InvalidConfig(format!(
                "dimension {dimension} outside 1..={MAX_DIMENSION}"
            )));
        }
        if bucket_size == 0 || bucket_size > MAX_BUCKET_SIZE {
            return Err(IndexError::InvalidConfig(format!(
                "bucket size {bucket_size} outside 1..={MAX_BUCKET_SIZE}"
            )));
        }
        let stride = dimension
            .checked_add(SPLIT_FIXED_WORDS)
            .map(|split| split.max(bucket_size))
            .and_then(|payload| payload.checked_add(NODE_HEADER_WORDS))
            .filter(|&stride| u32::try_from(stride).is_ok())
            .ok_or_else(|| IndexError::InvalidConfig("node stride overflows".into()))?;
        Ok(Self {
            dimension,
            bucket_size,
            stride,
        })
    }
}

/// A decoded split record.
#[derive(Debug, Clone, Copy)]
pub struct SplitNode<'a> {
    pub left: u32,
    pub right: u32,
    pub bias: f32,
    pub normal: &'a [f32],
    pub descendants: u32,
}

impl SplitNode<'_> {
    #[inline]
    pub fn child(&self, side: Side) -> u32 {
        match side {
            Side::Left => self.left,
            Side::Right => self.right,
        }
    }
}

/// A decoded node record.
#[derive(Debug, Clone, Copy)]
pub enum Node<'a> {
    Leaf(&'a [u32]),
    Split(SplitNode<'a>),
}

/// Read-only view over arena words, whether owned or memory-mapped.
#[derive(Debug, Clone, Copy)]
pub struct NodeArena<'a> {
    words: &'a [u32],
    layout: NodeLayout,
}

impl<'a> NodeArena<'a> {
    pub fn new(words: &'a [u32], layout: NodeLayout) -> Self {
        debug_assert_eq!(words.len() % layout.stride, 0);
        Self { words, layout }
    }

    /// Number of nodes.
    #[inline]
    pub fn len(&self) -> usize {
        self.words.len() / self.layout.stride
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn layout(&self) -> NodeLayout {
        self.layout
    }

    /// The raw words backing this arena.
    pub fn words(&self) -> &'a [u32] {
        self.words
    }

    #[inline]
    fn record(&self, idx: u32) -> &'a [u32] {
        let start = idx as usize * self.layout.stride;
        &self.words[start..start + self.layout.stride]
    }

    /// Decodes node `idx`. Caller guarantees `idx < len()`.
    #[inline]
    pub fn node(&self, idx: u32) -> Node<'a> {
        let rec = self.record(idx);
        let count = rec[1];
        if rec[0] == LEAF_TAG {
            let start = NODE_HEADER_WORDS;
            Node::Leaf(&rec[start..start + count as usize])
        } else {
            Node::Split(SplitNode {
                left: rec[LEFT],
                right: rec[RIGHT],
                bias: f32::from_bits(rec[BIAS]),
                normal: bytemuck::cast_slice(&rec[NORMAL..NORMAL + self.layout.dimension]),
                descendants: count,
            })
        }
    }

    /// Checks the structural invariants a traversal relies on.
    ///
    /// Children must come strictly after their parent and lie inside the arena,
    /// and every node must have exactly one parent, counting a root entry as
    /// its parent. Together these make each root the top of a tree, so a
    /// traversal visits every node at most once. Leaves must respect the
    /// bucket size and reference existing items.
    pub fn validate(&self, roots: &[u32], n_items: usize) -> Result<()> {
        let n_nodes = self.len();
        let mut parents = vec![0u8; n_nodes];
        for &root in roots {
            let root = root as usize;
            if root >= n_nodes {
                return Err(IndexError::CorruptFormat(format!(
                    "root {root} outside arena of {n_nodes} nodes"
                )));
            }
            parents[root] = parents[root].saturating_add(1);
        }
        for idx in 0..n_nodes {
            let rec = self.record(idx as u32);
            match rec[0] {
                LEAF_TAG => {
                    let count = rec[1] as usize;
                    if count > self.layout.bucket_size {
                        return Err(IndexError::CorruptFormat(format!(
                            "leaf {idx} holds {count} items (bucket size {})",
                            self.layout.bucket_size
                        )));
                    }
                    let items = &rec[NODE_HEADER_WORDS..NODE_HEADER_WORDS + count];
                    if let Some(&bad) = items.iter().find(|&&id| id as usize >= n_items) {
                        return Err(IndexError::CorruptFormat(format!(
                            "leaf {idx} references item {bad} (item count {n_items})"
                        )));
                    }
                }
                SPLIT_TAG => {
                    if rec[LEFT] == rec[RIGHT] {
                        return Err(IndexError::CorruptFormat(format!(
                            "split {idx} has both children at node {}",
                            rec[LEFT]
                        )));
                    }
                    for child in [rec[LEFT], rec[RIGHT]] {
                        let child = child as usize;
                        if child <= idx || child >= n_nodes {
                            return Err(IndexError::CorruptFormat(format!(
                                "split {idx} has invalid child {child} (node count {n_nodes})"
                            )));
                        }
                        parents[child] = parents[child].saturating_add(1);
                    }
                }
                tag => {
                    return Err(IndexError::CorruptFormat(format!(
                        "node {idx} has unknown tag {tag}"
                    )));
                }
            }
        }
        match parents.iter().position(|&count| count != 1) {
            Some(node) if parents[node] == 0 => Err(IndexError::CorruptFormat(format!(
                "node {node} is unreachable from every root"
            ))),
            Some(node) => Err(IndexError::CorruptFormat(format!(
                "node {node} is shared by {} parents",
                parents[node]
            ))),
            None => Ok(()),
        }
    }
}

/// Append-only arena under construction.
#[derive(Debug, Clone)]
pub struct ArenaBuf {
    words: Vec<u32>,
    layout: NodeLayout,
}

impl ArenaBuf {
    pub fn new(layout: NodeLayout) -> Self {
        Self {
            words: Vec::new(),
            layout,
        }
    }

    pub fn with_capacity(layout: NodeLayout, nodes: usize) -> Self {
        Self {
            words: Vec::with_capacity(nodes * layout.stride),
            layout,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.words.len() / self.layout.stride
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    fn push_record(&mut self) -> (u32, usize) {
        let idx = self.len() as u32;
        let start = self.words.len();
        self.words.resize(start + self.layout.stride, 0);
        (idx, start)
    }

    /// Appends a leaf holding `items`. Caller guarantees `items.len() <= bucket_size`.
    pub fn push_leaf(&mut self, items: &[u32]) -> u32 {
        debug_assert!(items.len() <= self.layout.bucket_size);
        let (idx, start) = self.push_record();
        let rec = &mut self.words[start..start + self.layout.stride];
        rec[0] = LEAF_TAG;
        rec[1] = items.len() as u32;
        rec[NODE_HEADER_WORDS..NODE_HEADER_WORDS + items.len()].copy_from_slice(items);
        idx
    }

    /// Appends a split node with unset children; fill them with [`ArenaBuf::set_child`].
    pub fn push_split(&mut self, plane: &Hyperplane, descendants: u32) -> u32 {
        debug_assert_eq!(plane.normal.len(), self.layout.dimension);
        let (idx, start) = self.push_record();
        let rec = &mut self.words[start..start + self.layout.stride];
        rec[0] = SPLIT_TAG;
        rec[1] = descendants;
        rec[BIAS] = plane.bias.to_bits();
        for (slot, x) in rec[NORMAL..NORMAL + plane.normal.len()]
            .iter_mut()
            .zip(&plane.normal)
        {
            *slot = x.to_bits();
        }
        idx
    }

    /// Points the `side` child of split node `parent` at `child`.
    pub fn set_child(&mut self, parent: u32, side: Side, child: u32) {
        let start = parent as usize * self.layout.stride;
        debug_assert_eq!(self.words[start], SPLIT_TAG);
        let slot = match side {
            Side::Left => LEFT,
            Side::Right => RIGHT,
        };
        self.words[start + slot] = child;
    }

    /// Appends every node of `other`, shifting its child references by the
    /// current length. Returns that shift, which is also the new index of
    /// `other`'s node 0.
    pub fn append_relocated(&mut self, other: &ArenaBuf) -> u32 {
        debug_assert_eq!(self.layout, other.layout);
        let offset = self.len() as u32;
        let base = self.words.len();
        self.words.extend_from_slice(&other.words);
        for rec in self.words[base..].chunks_exact_mut(self.layout.stride) {
            if rec[0] == SPLIT_TAG {
                rec[LEFT] += offset;
                rec[RIGHT] += offset;
            }
        }
        offset
    }

    pub fn view(&self) -> NodeArena<'_> {
        NodeArena::new(&self.words, self.layout)
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }
}
