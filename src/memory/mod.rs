//! Pooled byte storage.
//!
//! - **`pool`**: slab allocator handing out fixed-size `Block`s
//! - **`chain`**: `BlockChain` streams built from blocks, with `BlockIter`
//!   positions and borrowing `Cursor`s for scanning

pub mod chain;
pub mod pool;

pub use chain::{BlockChain, BlockIter, Cursor};
pub use pool::{Block, MemoryPool, BLOCK_SIZE};
