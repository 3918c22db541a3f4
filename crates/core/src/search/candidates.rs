//! De-duplicated candidate ids gathered from forest leaves.
//!
//! Leaves of different trees overlap heavily, so one query sees most ids more
//! than once. Membership is a bitset over item ids; the ids themselves are
//! kept in first-seen order, which is also what `reset` uses to clear only
//! the bits the previous query set.

const WORD_BITS: usize = u64::BITS as usize;

/// Distinct item ids seen by the current query, in first-seen order.
#[derive(Debug, Default)]
pub struct CandidateSet {
    bits: Vec<u64>,
    ids: Vec<u32>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empties the set and makes room for ids below `n_items`.
    pub fn reset(&mut self, n_items: usize) {
        for &id in &self.ids {
            let id = id as usize;
            self.bits[id / WORD_BITS] &= !(1 << (id % WORD_BITS));
        }
        self.ids.clear();
        let words = n_items.div_ceil(WORD_BITS);
        if words > self.bits.len() {
            self.bits.resize(words, 0);
        }
    }

    /// Adds the ids of one leaf, skipping those already present.
    /// Every id must be below the `n_items` given to `reset`.
    #[inline]
    pub fn extend_from_leaf(&mut self, leaf: &[u32]) {
        for &id in leaf {
            let (word, bit) = (id as usize / WORD_BITS, id as usize % WORD_BITS);
            let mask = 1u64 << bit;
            if self.bits[word] & mask == 0 {
                self.bits[word] |= mask;
                self.ids.push(id);
            }
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlapping_leaves_keep_first_seen_order() {
        let mut set = CandidateSet::new();
        set.reset(200);
        set.extend_from_leaf(&[9, 130, 2]);
        set.extend_from_leaf(&[2, 64, 9, 199]);
        set.extend_from_leaf(&[63, 64]);
        assert_eq!(set.ids(), &[9, 130, 2, 64, 199, 63]);
        assert_eq!(set.len(), 6);
    }

    #[test]
    fn test_reset_forgets_previous_query() {
        let mut set = CandidateSet::new();
        set.reset(100);
        set.extend_from_leaf(&[1, 70, 99]);
        set.reset(100);
        assert!(set.is_empty());
        assert!(set.bits.iter().all(|&w| w == 0));
        set.extend_from_leaf(&[70, 1]);
        assert_eq!(set.ids(), &[70, 1]);
    }

    #[test]
    fn test_reset_grows_for_larger_index() {
        let mut set = CandidateSet::new();
        set.reset(10);
        set.extend_from_leaf(&[3]);
        set.reset(1000);
        assert_eq!(set.bits.len(), 16);
        set.extend_from_leaf(&[999, 3, 999]);
        assert_eq!(set.ids(), &[999, 3]);

        // A smaller index afterwards reuses the wider bitset.
        set.reset(5);
        assert_eq!(set.bits.len(), 16);
        set.extend_from_leaf(&[4, 0, 4]);
        assert_eq!(set.ids(), &[4, 0]);
    }
}
