use crate::types::{BlockId, BlockRange, LineageError, Result};

/// Free extents kept sorted by start block and coalesced.
#[derive(Clone, Default, Debug)]
pub struct FreePool {
    extents: Vec<BlockRange>,
}

fn coalesce_with(left: &mut BlockRange, right: &BlockRange) -> bool {
    if left.end() == right.start {
        left.len += right.len;
        true
    } else {
        false
    }
}

impl FreePool {
    /// Returns the free extents in ascending order.
    pub fn extents(&self) -> &[BlockRange] {
        &self.extents
    }

    /// Total number of free blocks.
    pub fn free_blocks(&self) -> u64 {
        self.extents.iter().map(|e| e.len as u64).sum()
    }

    /// Takes `n` contiguous blocks from the smallest extent that fits.
    pub fn take(&mut self, n: u32) -> Option<BlockRange> {
        let pos = self
            .extents
            .iter()
            .enumerate()
            .filter(|(_, e)| e.len >= n)
            .min_by_key(|(_, e)| (e.len, e.start.0))
            .map(|(pos, _)| pos)?;
        let extent = &mut self.extents[pos];
        let taken = BlockRange::new(extent.start, n);
        if extent.len == n {
            self.extents.remove(pos);
        } else {
            extent.start = BlockId(extent.start.0 + n as u64);
            extent.len -= n;
        }
        Some(taken)
    }

    /// Returns `range` to the pool; overlapping an already free extent is a
    /// double free.
    pub fn give(&mut self, range: BlockRange) -> Result<()> {
        if range.len == 0 {
            return Ok(());
        }
        let pos = self
            .extents
            .partition_point(|e| e.start.0 < range.start.0);
        if let Some(prev) = pos.checked_sub(1).map(|p| &self.extents[p]) {
            if prev.end().0 > range.start.0 {
                return Err(LineageError::Invalid("block freed twice"));
            }
        }
        if let Some(next) = self.extents.get(pos) {
            if range.end().0 > next.start.0 {
                return Err(LineageError::Invalid("block freed twice"));
            }
        }
        self.extents.insert(pos, range);
        if pos + 1 < self.extents.len() {
            let next = self.extents[pos + 1];
            if coalesce_with(&mut self.extents[pos], &next) {
                self.extents.remove(pos + 1);
            }
        }
        if pos > 0 {
            let cur = self.extents[pos];
            if coalesce_with(&mut self.extents[pos - 1], &cur) {
                self.extents.remove(pos);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: u64, len: u32) -> BlockRange {
        BlockRange::new(BlockId(start), len)
    }

    #[test]
    fn give_coalesces_neighbours() {
        let mut pool = FreePool::default();
        pool.give(r(10, 2)).unwrap();
        pool.give(r(14, 2)).unwrap();
        pool.give(r(12, 2)).unwrap();
        assert_eq!(pool.extents(), &[r(10, 6)]);
        assert_eq!(pool.free_blocks(), 6);
    }

    #[test]
    fn take_prefers_smallest_fit() {
        let mut pool = FreePool::default();
        pool.give(r(2, 8)).unwrap();
        pool.give(r(20, 3)).unwrap();
        assert_eq!(pool.take(3), Some(r(20, 3)));
        assert_eq!(pool.take(2), Some(r(2, 2)));
        assert_eq!(pool.extents(), &[r(4, 6)]);
        assert_eq!(pool.take(7), None);
    }

    #[test]
    fn overlapping_give_is_rejected() {
        let mut pool = FreePool::default();
        pool.give(r(5, 5)).unwrap();
        assert!(pool.give(r(9, 2)).is_err());
        assert!(pool.give(r(3, 3)).is_err());
        assert!(pool.give(r(10, 1)).is_ok());
    }
}
