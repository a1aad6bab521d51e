//! Block store consumed by the session engine.
//!
//! The engine only needs a handful of operations from the storage layer:
//! whole-block reads and writes, allocation and release of block runs, and a
//! cache flush. Blocks `0` and `1` are reserved for the two superblock slots.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::primitives::io::BlockFile;
use crate::types::{BlockId, BlockRange, LineageError, Result};

mod pool;

pub use pool::FreePool;

/// First block that may be handed out by [`BlockStore::allocate`].
pub const FIRST_DATA_BLOCK: u64 = 2;

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Smallest accepted block size; the superblock must fit in one block.
pub const MIN_BLOCK_SIZE: usize = 512;

/// Storage of fixed-size blocks with a free pool.
pub trait BlockStore: Send + Sync {
    /// Size of every block in bytes.
    fn block_size(&self) -> usize;
    /// Reads block `id` into `dst`, which must be exactly one block long.
    fn read_block(&self, id: BlockId, dst: &mut [u8]) -> Result<()>;
    /// Writes one whole block.
    fn write_block(&self, id: BlockId, src: &[u8]) -> Result<()>;
    /// Allocates `n` contiguous blocks.
    fn allocate(&self, n: u32) -> Result<BlockRange>;
    /// Returns a run of blocks to the free pool.
    fn free(&self, range: BlockRange) -> Result<()>;
    /// Makes every completed write durable.
    fn flush_caches(&self) -> Result<()>;
    /// Rebuilds the free pool so that exactly the blocks outside `in_use`
    /// (and outside the reserved superblock slots) are available.
    fn restore_allocation(&self, in_use: &[BlockRange]) -> Result<()>;
}

fn check_len(block_size: usize, len: usize) -> Result<()> {
    if len != block_size {
        return Err(LineageError::Invalid("buffer is not one block long"));
    }
    Ok(())
}

fn check_count(n: u32) -> Result<()> {
    if n == 0 {
        return Err(LineageError::Invalid("cannot allocate zero blocks"));
    }
    Ok(())
}

/// Builds the free pool for `[FIRST_DATA_BLOCK, high_water)` minus `in_use`,
/// returning the pool and the possibly raised high-water mark.
fn rebuild_pool(in_use: &[BlockRange], high_water: u64) -> Result<(FreePool, u64)> {
    let mut used: Vec<BlockRange> = in_use.iter().copied().filter(|r| r.len > 0).collect();
    used.sort_by_key(|r| r.start.0);
    let mut high = high_water.max(FIRST_DATA_BLOCK);
    let mut pool = FreePool::default();
    let mut cursor = FIRST_DATA_BLOCK;
    for range in used {
        if range.start.0 < FIRST_DATA_BLOCK {
            return Err(LineageError::Corruption("superblock slot recorded as allocated"));
        }
        if range.start.0 < cursor {
            return Err(LineageError::Corruption("block recorded as allocated twice"));
        }
        if range.start.0 > cursor {
            pool.give(BlockRange::new(BlockId(cursor), (range.start.0 - cursor) as u32))?;
        }
        cursor = range.end().0;
        high = high.max(cursor);
    }
    if high > cursor {
        pool.give(BlockRange::new(BlockId(cursor), (high - cursor) as u32))?;
    }
    Ok((pool, high))
}

struct FileState {
    pool: FreePool,
    high_water: u64,
}

/// File-backed block store; block `n` lives at byte offset `n * block_size`.
pub struct FileBlockStore {
    io: BlockFile,
    block_size: usize,
    state: Mutex<FileState>,
}

impl FileBlockStore {
    /// Opens (creating if needed) the block file at `path`.
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        if block_size < MIN_BLOCK_SIZE || !block_size.is_power_of_two() {
            return Err(LineageError::Invalid("block size must be a power of two >= 512"));
        }
        let io = BlockFile::open(path)?;
        let blocks = io.len()? / block_size as u64;
        let high_water = blocks.max(FIRST_DATA_BLOCK);
        if io.len()? < FIRST_DATA_BLOCK * block_size as u64 {
            io.set_len(FIRST_DATA_BLOCK * block_size as u64)?;
        }
        Ok(Self {
            io,
            block_size,
            state: Mutex::new(FileState {
                pool: FreePool::default(),
                high_water,
            }),
        })
    }

    /// Number of blocks currently backed by the file.
    pub fn high_water(&self) -> u64 {
        self.state.lock().high_water
    }

    fn offset(&self, id: BlockId) -> Result<u64> {
        id.0.checked_mul(self.block_size as u64)
            .ok_or(LineageError::Invalid("block offset overflow"))
    }
}

impl BlockStore for FileBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, id: BlockId, dst: &mut [u8]) -> Result<()> {
        check_len(self.block_size, dst.len())?;
        self.io.read_exact_at(self.offset(id)?, dst)
    }

    fn write_block(&self, id: BlockId, src: &[u8]) -> Result<()> {
        check_len(self.block_size, src.len())?;
        self.io.write_all_at(self.offset(id)?, src)
    }

    fn allocate(&self, n: u32) -> Result<BlockRange> {
        check_count(n)?;
        let mut state = self.state.lock();
        if let Some(range) = state.pool.take(n) {
            trace!(start = range.start.0, len = n, "blocks.allocate.reuse");
            return Ok(range);
        }
        let start = state.high_water;
        let new_high = start + n as u64;
        self.io.set_len(new_high * self.block_size as u64)?;
        state.high_water = new_high;
        trace!(start, len = n, "blocks.allocate.extend");
        Ok(BlockRange::new(BlockId(start), n))
    }

    fn free(&self, range: BlockRange) -> Result<()> {
        let mut state = self.state.lock();
        if range.start.0 < FIRST_DATA_BLOCK || range.checked_end()?.0 > state.high_water {
            return Err(LineageError::Invalid("freed range outside the data area"));
        }
        state.pool.give(range)
    }

    fn flush_caches(&self) -> Result<()> {
        self.io.sync()
    }

    fn restore_allocation(&self, in_use: &[BlockRange]) -> Result<()> {
        let file_blocks = self.io.len()? / self.block_size as u64;
        let (pool, high) = rebuild_pool(in_use, file_blocks)?;
        if high > file_blocks {
            self.io.set_len(high * self.block_size as u64)?;
        }
        debug!(
            free_blocks = pool.free_blocks(),
            high_water = high,
            "blocks.restore_allocation"
        );
        let mut state = self.state.lock();
        state.pool = pool;
        state.high_water = high;
        Ok(())
    }
}

#[derive(Default)]
struct MemInner {
    blocks: HashMap<u64, Box<[u8]>>,
    pool: FreePool,
    high_water: u64,
    flushes: u64,
}

/// In-memory block store. Clones share the same blocks, which lets tests
/// model several processes looking at one disk.
#[derive(Clone)]
pub struct MemBlockStore {
    block_size: usize,
    inner: Arc<Mutex<MemInner>>,
}

impl MemBlockStore {
    /// Creates an empty store with the given block size.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            inner: Arc::new(Mutex::new(MemInner {
                high_water: FIRST_DATA_BLOCK,
                ..MemInner::default()
            })),
        }
    }

    /// Number of successful `flush_caches` calls.
    pub fn flushes(&self) -> u64 {
        self.inner.lock().flushes
    }

    /// Number of blocks currently in the free pool.
    pub fn free_blocks(&self) -> u64 {
        self.inner.lock().pool.free_blocks()
    }

    /// Blocks currently in the free pool, in ascending order.
    pub fn free_list(&self) -> Vec<BlockRange> {
        self.inner.lock().pool.extents().to_vec()
    }

    /// Block one past the highest block ever allocated.
    pub fn high_water(&self) -> u64 {
        self.inner.lock().high_water
    }
}

impl Default for MemBlockStore {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl BlockStore for MemBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, id: BlockId, dst: &mut [u8]) -> Result<()> {
        check_len(self.block_size, dst.len())?;
        let inner = self.inner.lock();
        match inner.blocks.get(&id.0) {
            Some(data) => dst.copy_from_slice(data),
            None => dst.fill(0),
        }
        Ok(())
    }

    fn write_block(&self, id: BlockId, src: &[u8]) -> Result<()> {
        check_len(self.block_size, src.len())?;
        self.inner.lock().blocks.insert(id.0, src.into());
        Ok(())
    }

    fn allocate(&self, n: u32) -> Result<BlockRange> {
        check_count(n)?;
        let mut inner = self.inner.lock();
        if let Some(range) = inner.pool.take(n) {
            return Ok(range);
        }
        let start = inner.high_water;
        inner.high_water += n as u64;
        Ok(BlockRange::new(BlockId(start), n))
    }

    fn free(&self, range: BlockRange) -> Result<()> {
        let mut inner = self.inner.lock();
        if range.start.0 < FIRST_DATA_BLOCK || range.checked_end()?.0 > inner.high_water {
            return Err(LineageError::Invalid("freed range outside the data area"));
        }
        inner.pool.give(range)?;
        for block in range.iter() {
            inner.blocks.remove(&block.0);
        }
        Ok(())
    }

    fn flush_caches(&self) -> Result<()> {
        self.inner.lock().flushes += 1;
        Ok(())
    }

    fn restore_allocation(&self, in_use: &[BlockRange]) -> Result<()> {
        let mut inner = self.inner.lock();
        let (pool, high) = rebuild_pool(in_use, inner.high_water)?;
        inner.pool = pool;
        inner.high_water = high;
        Ok(())
    }
}
