//! Chains of pooled blocks forming one logical byte stream.
//!
//! Positions are absolute stream offsets (`BlockIter`) rather than pointers
//! into blocks. A position is only resolved while the chain is borrowed, and
//! positions below the release watermark are rejected, so an iterator can
//! never observe a block that went back to the pool.

use std::collections::VecDeque;

use crate::error::PoolError;
use crate::memory::pool::{Block, MemoryPool};

/// A position in a `BlockChain`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockIter {
    pos: u64,
}

impl BlockIter {
    /// Absolute offset from the first byte ever appended to the chain.
    pub fn position(&self) -> u64 {
        self.pos
    }
}

struct Segment {
    /// Absolute position of the block's byte 0.
    base: u64,
    block: Block,
}

impl Segment {
    fn start_pos(&self) -> u64 {
        self.base + self.block.start() as u64
    }

    fn end_pos(&self) -> u64 {
        self.base + self.block.end() as u64
    }
}

/// Singly-ordered list of blocks. Producers append at the tail, consumers
/// release from the head.
pub struct BlockChain {
    pool: MemoryPool,
    segments: VecDeque<Segment>,
    head: u64,
    tail: u64,
}

impl BlockChain {
    pub fn new(pool: MemoryPool) -> Self {
        Self {
            pool,
            segments: VecDeque::new(),
            head: 0,
            tail: 0,
        }
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    /// Position of the first unreleased byte.
    pub fn start(&self) -> BlockIter {
        BlockIter { pos: self.head }
    }

    /// Position one past the last appended byte.
    pub fn end(&self) -> BlockIter {
        BlockIter { pos: self.tail }
    }

    /// Bytes between start and end.
    pub fn len(&self) -> usize {
        (self.tail - self.head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn block_count(&self) -> usize {
        self.segments.len()
    }

    /// Whether `iter` still points into live data (or at the end).
    pub fn contains(&self, iter: BlockIter) -> bool {
        iter.pos >= self.head && iter.pos <= self.tail
    }

    /// Copy `src` onto the tail, leasing blocks as needed.
    pub fn append(&mut self, mut src: &[u8]) -> Result<(), PoolError> {
        while !src.is_empty() {
            let needs_block = self
                .segments
                .back()
                .map(|s| s.block.remaining_mut() == 0)
                .unwrap_or(true);

            if needs_block {
                let block = self.pool.lease()?;
                self.segments.push_back(Segment {
                    base: self.tail,
                    block,
                });
            }

            let Some(segment) = self.segments.back_mut() else {
                break;
            };
            let n = segment.block.write(src);
            self.tail += n as u64;
            src = &src[n..];
        }
        Ok(())
    }

    /// Copy `src` into the tail block only if it fits there whole. Returns
    /// false, leaving the chain untouched, when a new block would be needed.
    pub fn append_to_tail(&mut self, src: &[u8]) -> bool {
        let Some(segment) = self.segments.back_mut() else {
            return false;
        };
        if segment.block.remaining_mut() < src.len() {
            return false;
        }
        let n = segment.block.write(src);
        self.tail += n as u64;
        true
    }

    /// Discard bytes appended after `at`, returning emptied blocks to the
    /// pool. Released positions are left alone.
    pub fn truncate_to(&mut self, at: BlockIter) -> usize {
        let at = at.pos.max(self.head);
        if at >= self.tail {
            return 0;
        }
        let dropped = (self.tail - at) as usize;

        while let Some(back) = self.segments.back_mut() {
            if back.start_pos() >= at {
                self.segments.pop_back();
                continue;
            }
            back.block.truncate((at - back.base) as usize);
            break;
        }

        self.tail = at;
        dropped
    }

    /// Link an already-filled block onto the tail without copying.
    pub fn push_block(&mut self, block: Block) {
        if block.is_empty() {
            return;
        }
        let base = self.tail - block.start() as u64;
        self.tail += block.len() as u64;
        self.segments.push_back(Segment { base, block });
    }

    /// Resolve `at` into a cursor. Returns `None` for released or
    /// out-of-range positions.
    pub fn cursor(&self, at: BlockIter) -> Option<Cursor<'_>> {
        if !self.contains(at) {
            return None;
        }

        for (index, segment) in self.segments.iter().enumerate() {
            if at.pos >= segment.start_pos() && at.pos < segment.end_pos() {
                let mut cursor = Cursor {
                    chain: self,
                    index,
                    offset: (at.pos - segment.base) as usize,
                    pos: at.pos,
                };
                cursor.normalize();
                return Some(cursor);
            }
        }

        // At the very end of the data.
        let index = self.segments.len().saturating_sub(1);
        let offset = self.segments.back().map(|s| s.block.end()).unwrap_or(0);
        Some(Cursor {
            chain: self,
            index,
            offset,
            pos: self.tail,
        })
    }

    /// Cursor at the first unreleased byte.
    pub fn cursor_at_start(&self) -> Cursor<'_> {
        let offset = self
            .segments
            .front()
            .map(|s| (self.head - s.base) as usize)
            .unwrap_or(0);
        let mut cursor = Cursor {
            chain: self,
            index: 0,
            offset,
            pos: self.head,
        };
        cursor.normalize();
        cursor
    }

    /// Number of bytes between two positions.
    pub fn distance(&self, from: BlockIter, to: BlockIter) -> usize {
        debug_assert!(from <= to);
        to.pos.saturating_sub(from.pos) as usize
    }

    /// Copy the bytes in `[from, to)` into `dest`, returning how many were copied.
    pub fn copy_to(&self, from: BlockIter, to: BlockIter, dest: &mut [u8]) -> usize {
        let Some(mut cursor) = self.cursor(from) else {
            return 0;
        };
        let wanted = self.distance(from, to).min(dest.len());
        let mut copied = 0;

        while copied < wanted {
            let slice = cursor.contiguous();
            if slice.is_empty() {
                break;
            }
            let n = slice.len().min(wanted - copied);
            dest[copied..copied + n].copy_from_slice(&slice[..n]);
            copied += n;
            cursor.skip(n);
        }
        copied
    }

    /// Collect `[from, to)` into an owned vector.
    pub fn to_vec(&self, from: BlockIter, to: BlockIter) -> Vec<u8> {
        let mut out = vec![0u8; self.distance(from, to)];
        let n = self.copy_to(from, to, &mut out);
        out.truncate(n);
        out
    }

    /// Release every byte before `to`. Fully consumed blocks go back to the
    /// pool. Returns the number of bytes released.
    pub fn consume_to(&mut self, to: BlockIter) -> usize {
        if to.pos <= self.head {
            return 0;
        }
        let to = to.pos.min(self.tail);
        let released = (to - self.head) as usize;

        while let Some(front) = self.segments.front_mut() {
            if front.end_pos() <= to {
                self.segments.pop_front();
                continue;
            }
            let skip = to.saturating_sub(front.start_pos()) as usize;
            front.block.advance(skip);
            break;
        }

        self.head = to;
        released
    }

    /// Release everything. Returns the number of bytes dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.len();
        self.segments.clear();
        self.head = self.tail;
        dropped
    }

    /// Detach all blocks, leaving the chain empty at the same end position.
    pub fn drain_blocks(&mut self) -> Vec<Block> {
        self.head = self.tail;
        self.segments.drain(..).map(|s| s.block).collect()
    }
}

impl std::fmt::Debug for BlockChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockChain")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("blocks", &self.segments.len())
            .finish()
    }
}

/// A read position bound to a borrowed chain.
#[derive(Clone)]
pub struct Cursor<'a> {
    chain: &'a BlockChain,
    index: usize,
    offset: usize,
    pos: u64,
}

impl<'a> Cursor<'a> {
    pub fn position(&self) -> BlockIter {
        BlockIter { pos: self.pos }
    }

    pub fn is_end(&self) -> bool {
        self.pos >= self.chain.tail
    }

    /// Bytes left before the end of the chain.
    pub fn remaining(&self) -> usize {
        (self.chain.tail - self.pos) as usize
    }

    pub fn peek(&self) -> Option<u8> {
        if self.is_end() {
            return None;
        }
        let segment = &self.chain.segments[self.index];
        segment.block.written().get(self.offset).copied()
    }

    pub fn take(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.offset += 1;
        self.pos += 1;
        self.normalize();
        Some(byte)
    }

    /// Skip up to `n` bytes; returns how many were skipped.
    pub fn skip(&mut self, mut n: usize) -> usize {
        let mut skipped = 0;
        while n > 0 && !self.is_end() {
            let available = self.contiguous().len();
            let step = available.min(n);
            self.offset += step;
            self.pos += step as u64;
            skipped += step;
            n -= step;
            self.normalize();
        }
        skipped
    }

    /// Advance to the next occurrence of `byte` without passing it.
    /// Stops at the end and returns `false` when it is not found.
    pub fn seek(&mut self, byte: u8) -> bool {
        self.seek_any(&[byte]).is_some()
    }

    /// Advance to the first byte contained in `set` and return it.
    pub fn seek_any(&mut self, set: &[u8]) -> Option<u8> {
        loop {
            let slice = self.contiguous();
            if slice.is_empty() {
                return None;
            }
            if let Some(i) = slice.iter().position(|b| set.contains(b)) {
                let found = slice[i];
                self.offset += i;
                self.pos += i as u64;
                return Some(found);
            }
            let len = slice.len();
            self.offset += len;
            self.pos += len as u64;
            self.normalize();
        }
    }

    /// Readable bytes from the cursor to the end of its current block.
    pub fn contiguous(&self) -> &'a [u8] {
        if self.is_end() {
            return &[];
        }
        let block = &self.chain.segments[self.index].block;
        &block.written()[self.offset..block.end()]
    }

    /// Step into the next block once the current one is exhausted.
    fn normalize(&mut self) {
        while self.index + 1 < self.chain.segments.len() {
            let block = &self.chain.segments[self.index].block;
            if self.offset < block.end() {
                break;
            }
            self.index += 1;
            self.offset = self.chain.segments[self.index].block.start();
        }
    }
}
