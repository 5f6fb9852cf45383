//! Slab-based block allocator.
//!
//! A slab is one `BytesMut` allocation carved into fixed-size blocks. Leased
//! blocks own their slice of the slab exclusively; dropping a `Block` hands the
//! storage back to the free list of the pool it came from.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::buf::{BufMut, Limit};
use bytes::BytesMut;
use parking_lot::Mutex;

use crate::error::PoolError;

/// Distance between two blocks inside a slab.
pub const BLOCK_STRIDE: usize = 4096;

/// Bytes of every stride left unused.
pub const BLOCK_UNUSED: usize = 64;

/// Usable bytes per block.
pub const BLOCK_SIZE: usize = BLOCK_STRIDE - BLOCK_UNUSED;

/// Blocks carved out of each slab.
pub const BLOCKS_PER_SLAB: usize = 32;

/// Thread-safe pool of fixed-size blocks.
///
/// Cloning is cheap; every clone leases from the same free list.
#[derive(Clone)]
pub struct MemoryPool {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<PoolState>,
    max_slabs: Option<usize>,
}

struct PoolState {
    free: Vec<FreeBlock>,
    /// Lease generation of every slot ever allocated, indexed by slot.
    generations: Vec<u64>,
    slabs: usize,
    leased: usize,
}

struct FreeBlock {
    slot: usize,
    data: BytesMut,
}

impl MemoryPool {
    /// Create an unbounded pool. Slabs are allocated on demand.
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    /// Create a pool that refuses to grow past `max_slabs` slabs.
    pub fn with_limit(max_slabs: Option<usize>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    generations: Vec::new(),
                    slabs: 0,
                    leased: 0,
                }),
                max_slabs,
            }),
        }
    }

    /// Lease a block, allocating a new slab when the free list is empty.
    pub fn lease(&self) -> Result<Block, PoolError> {
        let mut state = self.shared.state.lock();

        let free = match state.free.pop() {
            Some(free) => free,
            None => self.allocate_slab(&mut state)?,
        };

        state.generations[free.slot] += 1;
        state.leased += 1;

        Ok(Block {
            slot: free.slot,
            generation: state.generations[free.slot],
            data: free.data,
            start: 0,
            pool: Arc::downgrade(&self.shared),
        })
    }

    /// Return a block to the pool. Equivalent to dropping it.
    pub fn return_block(&self, block: Block) {
        debug_assert!(
            block.pool.ptr_eq(&Arc::downgrade(&self.shared)),
            "block returned to a pool it was not leased from"
        );
        drop(block);
    }

    pub fn slab_count(&self) -> usize {
        self.shared.state.lock().slabs
    }

    pub fn free_count(&self) -> usize {
        self.shared.state.lock().free.len()
    }

    pub fn leased_count(&self) -> usize {
        self.shared.state.lock().leased
    }

    /// Carve a fresh slab into blocks, keep one for the caller and push the rest.
    fn allocate_slab(&self, state: &mut PoolState) -> Result<FreeBlock, PoolError> {
        if let Some(limit) = self.shared.max_slabs {
            if state.slabs >= limit {
                return Err(PoolError::Exhausted {
                    slabs: state.slabs,
                    limit,
                });
            }
        }

        let mut slab = BytesMut::zeroed(BLOCK_STRIDE * BLOCKS_PER_SLAB);
        let base = state.generations.len();
        state.generations.resize(base + BLOCKS_PER_SLAB, 0);
        state.slabs += 1;

        tracing::debug!(slabs = state.slabs, "Memory pool slab allocated");

        let mut carved = Vec::with_capacity(BLOCKS_PER_SLAB);
        for index in 0..BLOCKS_PER_SLAB {
            let mut stride = slab.split_to(BLOCK_STRIDE);
            let mut data = stride.split_to(BLOCK_SIZE);
            data.clear();
            carved.push(FreeBlock {
                slot: base + index,
                data,
            });
        }

        // Hand out the lowest slot first.
        carved.reverse();
        let first = carved.pop();
        state.free.extend(carved);

        first.ok_or(PoolError::Exhausted {
            slabs: state.slabs,
            limit: self.shared.max_slabs.unwrap_or(0),
        })
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("MemoryPool")
            .field("slabs", &state.slabs)
            .field("free", &state.free.len())
            .field("leased", &state.leased)
            .finish()
    }
}

impl Shared {
    fn reclaim(&self, slot: usize, generation: u64, mut data: BytesMut) {
        let mut state = self.state.lock();

        if state.generations.get(slot) != Some(&generation) {
            tracing::warn!(slot, generation, "Stale block returned to pool, dropping it");
            return;
        }

        data.clear();
        state.free.push(FreeBlock { slot, data });
        state.leased -= 1;
    }
}

/// A leased block: a fixed-capacity byte region with a read cursor.
///
/// Bytes in `[start, end)` are readable; `[end, capacity)` is writable.
pub struct Block {
    slot: usize,
    generation: u64,
    data: BytesMut,
    start: usize,
    pool: Weak<Shared>,
}

impl Block {
    /// Lease generation; changes every time the slot is handed out again.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Offset of the first readable byte.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Offset one past the last written byte.
    pub fn end(&self) -> usize {
        self.data.len()
    }

    /// Readable byte count.
    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Space left for writing.
    pub fn remaining_mut(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    pub fn readable(&self) -> &[u8] {
        &self.data[self.start..]
    }

    /// Everything written so far, including bytes before the read cursor.
    pub(crate) fn written(&self) -> &[u8] {
        &self.data[..]
    }

    /// Append as much of `src` as fits and return how many bytes were taken.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining_mut());
        self.data.extend_from_slice(&src[..n]);
        n
    }

    /// Move the read cursor forward.
    pub fn advance(&mut self, n: usize) {
        assert!(self.start + n <= self.data.len(), "advance past written data");
        self.start += n;
    }

    /// Drop written bytes past `end`. Readable bytes are never cut.
    pub(crate) fn truncate(&mut self, end: usize) {
        self.data.truncate(end.max(self.start));
    }

    /// Forget every byte so the block can be filled again.
    pub(crate) fn reset(&mut self) {
        self.data.clear();
        self.start = 0;
    }

    /// Writable tail, bounded so reads never grow the block.
    pub(crate) fn spare_mut(&mut self) -> Limit<&mut BytesMut> {
        let remaining = self.remaining_mut();
        (&mut self.data).limit(remaining)
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.reclaim(self.slot, self.generation, std::mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .field("start", &self.start)
            .field("end", &self.end())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_and_return() {
        let pool = MemoryPool::new();

        let b1 = pool.lease().unwrap();
        let b2 = pool.lease().unwrap();
        assert_eq!(pool.slab_count(), 1);
        assert_eq!(pool.leased_count(), 2);
        assert_eq!(pool.free_count(), BLOCKS_PER_SLAB - 2);
        assert_eq!(b1.capacity(), BLOCK_SIZE);

        pool.return_block(b1);
        assert_eq!(pool.leased_count(), 1);
        drop(b2);
        assert_eq!(pool.leased_count(), 0);
        assert_eq!(pool.free_count(), BLOCKS_PER_SLAB);
    }

    #[test]
    fn exhaustion_is_reported() {
        let pool = MemoryPool::with_limit(Some(1));
        let held: Vec<_> = (0..BLOCKS_PER_SLAB).map(|_| pool.lease().unwrap()).collect();

        let err = pool.lease().unwrap_err();
        assert_eq!(err, PoolError::Exhausted { slabs: 1, limit: 1 });

        drop(held);
        assert!(pool.lease().is_ok());
    }

    #[test]
    fn reused_slot_gets_new_generation() {
        let pool = MemoryPool::with_limit(Some(1));
        let first = pool.lease().unwrap();
        let (slot, generation) = (first.slot(), first.generation());
        drop(first);

        let again = pool.lease().unwrap();
        assert_eq!(again.slot(), slot);
        assert!(again.generation() > generation);
    }

    #[test]
    fn returned_block_is_reset() {
        let pool = MemoryPool::with_limit(Some(1));
        let mut block = pool.lease().unwrap();
        block.write(b"hello");
        block.advance(2);
        drop(block);

        let block = pool.lease().unwrap();
        assert_eq!(block.start(), 0);
        assert_eq!(block.end(), 0);
        assert!(block.is_empty());
    }

    #[test]
    fn write_stops_at_capacity() {
        let pool = MemoryPool::new();
        let mut block = pool.lease().unwrap();
        let big = vec![7u8; BLOCK_SIZE + 100];

        assert_eq!(block.write(&big), BLOCK_SIZE);
        assert_eq!(block.remaining_mut(), 0);
        assert_eq!(block.write(b"x"), 0);
        assert_eq!(block.capacity(), BLOCK_SIZE);
    }

    #[test]
    fn concurrent_lease_return() {
        let pool = MemoryPool::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let mut block = pool.lease().unwrap();
                        block.write(b"abc");
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.leased_count(), 0);
    }
}
