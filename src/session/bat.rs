//! Block allocation tables and the fusion arithmetic.
//!
//! Every session carries two sets relative to its up-link: `plus` (blocks
//! allocated) and `minus` (blocks freed). The blocks a session can see are
//! obtained by replaying the sets from the root of its chain:
//! `state = (state - minus) | plus`. A root's `minus` has nothing to apply
//! to and is only kept reserved until the root is fused away.

use std::collections::btree_set;
use std::collections::BTreeSet;

use crate::types::{BlockId, BlockRange, LineageError, Result};

/// Ordered set of block numbers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockSet(BTreeSet<u64>);

impl BlockSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set holding every block of `ranges`.
    pub fn from_ranges(ranges: &[BlockRange]) -> Self {
        let mut set = Self::new();
        for range in ranges {
            set.insert_range(*range);
        }
        set
    }

    /// Adds every block of `range`.
    pub fn insert_range(&mut self, range: BlockRange) {
        self.0.extend(range.iter().map(|b| b.0));
    }

    /// Adds one block; returns `false` if it was already present.
    pub fn insert(&mut self, block: BlockId) -> bool {
        self.0.insert(block.0)
    }

    /// Removes one block; returns `false` if it was absent.
    pub fn remove(&mut self, block: BlockId) -> bool {
        self.0.remove(&block.0)
    }

    /// Returns `true` if `block` is in the set.
    pub fn contains(&self, block: BlockId) -> bool {
        self.0.contains(&block.0)
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` for the empty set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates blocks in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.0.iter().copied().map(BlockId)
    }

    /// `self ∪ other`.
    pub fn union(&self, other: &BlockSet) -> BlockSet {
        BlockSet(self.0.union(&other.0).copied().collect())
    }

    /// `self − other`.
    pub fn difference(&self, other: &BlockSet) -> BlockSet {
        BlockSet(self.0.difference(&other.0).copied().collect())
    }

    /// `self ∩ other`.
    pub fn intersection(&self, other: &BlockSet) -> BlockSet {
        BlockSet(self.0.intersection(&other.0).copied().collect())
    }

    /// Adds every block of `other`.
    pub fn extend_from(&mut self, other: &BlockSet) {
        self.0.extend(other.0.iter().copied());
    }

    /// Compacts the set into maximal contiguous runs.
    pub fn to_ranges(&self) -> Vec<BlockRange> {
        let mut out: Vec<BlockRange> = Vec::new();
        for block in self.0.iter().copied() {
            match out.last_mut() {
                Some(last) if last.end().0 == block && last.len < u32::MAX => last.len += 1,
                _ => out.push(BlockRange::new(BlockId(block), 1)),
            }
        }
        out
    }
}

impl FromIterator<u64> for BlockSet {
    fn from_iter<T: IntoIterator<Item = u64>>(iter: T) -> Self {
        BlockSet(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a BlockSet {
    type Item = &'a u64;
    type IntoIter = btree_set::Iter<'a, u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Allocation delta of one session relative to its up-link.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Delta {
    /// Blocks allocated.
    pub plus: BlockSet,
    /// Blocks freed.
    pub minus: BlockSet,
}

/// Outcome of fusing a parent delta into its only child.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fused {
    /// The child's delta, now relative to the parent's up-link.
    pub child: Delta,
    /// Blocks nobody references any more; they go back to the free pool.
    pub released: BlockSet,
}

/// Merges `parent` into `child`.
///
/// `parent_is_root` is set when the parent has no live up-link; the merged
/// child then becomes a root itself and keeps no `minus`.
pub fn fuse(parent: &Delta, child: &Delta, parent_is_root: bool) -> Result<Fused> {
    check_disjoint(&parent.plus, &child.plus, "block allocated by both parent and child")?;
    check_disjoint(&child.plus, &child.minus, "block both allocated and freed by child")?;
    check_disjoint(&parent.minus, &child.plus, "child reallocated a block its parent freed")?;
    check_disjoint(&parent.plus, &parent.minus, "block both allocated and freed by parent")?;

    let plus = parent.plus.difference(&child.minus).union(&child.plus);
    let inherited_minus = parent.minus.union(&child.minus.difference(&parent.plus));
    let mut released = parent.plus.intersection(&child.minus);
    let minus = if parent_is_root {
        released.extend_from(&inherited_minus);
        BlockSet::new()
    } else {
        inherited_minus
    };
    Ok(Fused {
        child: Delta { plus, minus },
        released,
    })
}

fn check_disjoint(a: &BlockSet, b: &BlockSet, what: &str) -> Result<()> {
    let overlap = a.intersection(b);
    let first = overlap.iter().next();
    match first {
        None => Ok(()),
        Some(first) => Err(LineageError::FusionInvariant(format!(
            "{what}: block {first} ({} overlapping)",
            overlap.len()
        ))),
    }
}

/// Replays deltas from a root (first element) down to a session.
pub fn replay<'a>(path: impl IntoIterator<Item = &'a Delta>) -> BlockSet {
    let mut iter = path.into_iter();
    let Some(root) = iter.next() else {
        return BlockSet::new();
    };
    let mut state = root.plus.clone();
    for delta in iter {
        state = state.difference(&delta.minus).union(&delta.plus);
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(blocks: &[u64]) -> BlockSet {
        blocks.iter().copied().collect()
    }

    fn delta(plus: &[u64], minus: &[u64]) -> Delta {
        Delta {
            plus: set(plus),
            minus: set(minus),
        }
    }

    #[test]
    fn ranges_compact_runs() {
        let s = set(&[2, 3, 4, 9, 11, 12]);
        assert_eq!(
            s.to_ranges(),
            vec![
                BlockRange::new(BlockId(2), 3),
                BlockRange::new(BlockId(9), 1),
                BlockRange::new(BlockId(11), 2),
            ]
        );
        assert_eq!(BlockSet::from_ranges(&s.to_ranges()), s);
    }

    #[test]
    fn fuse_releases_blocks_only_the_parent_needed() {
        // root: {2,3,4}; parent frees 2 and allocates 5,6; child frees 5 and allocates 7.
        let root = delta(&[2, 3, 4], &[]);
        let parent = delta(&[5, 6], &[2]);
        let child = delta(&[7], &[5, 3]);
        let fused = fuse(&parent, &child, false).unwrap();
        assert_eq!(fused.child.plus, set(&[6, 7]));
        assert_eq!(fused.child.minus, set(&[2, 3]));
        assert_eq!(fused.released, set(&[5]));
        assert_eq!(
            replay([&root, &parent, &child]),
            replay([&root, &fused.child])
        );
    }

    #[test]
    fn fusing_a_root_drops_minus() {
        let parent = delta(&[2, 3], &[]);
        let child = delta(&[4], &[3]);
        let fused = fuse(&parent, &child, true).unwrap();
        assert_eq!(fused.child.plus, set(&[2, 4]));
        assert!(fused.child.minus.is_empty());
        assert_eq!(fused.released, set(&[3]));
    }

    #[test]
    fn overlapping_allocations_violate_accounting() {
        let parent = delta(&[5], &[]);
        let child = delta(&[5], &[]);
        let err = fuse(&parent, &child, false).unwrap_err();
        assert!(matches!(err, LineageError::FusionInvariant(_)));
        assert!(err.is_fatal());

        let parent = delta(&[], &[8]);
        let child = delta(&[8], &[]);
        assert!(fuse(&parent, &child, false).is_err());
    }

    #[test]
    fn replay_of_nothing_is_empty() {
        assert!(replay(std::iter::empty()).is_empty());
    }
}
