// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! A bump-style region allocator. All row payloads, variable-length column
//! data, and skip-list nodes allocate from here; the whole arena is released
//! en bloc when it is dropped.

#![allow(clippy::mut_from_ref)]

use std::{cell::RefCell, sync::Arc};

use log::debug;

use crate::collector::{MemoryCollector, Result};

/// Default size of each block the arena grows by. Chosen at the scale of a
/// single tablet's write buffer, large enough to amortize the per-block
/// collector round-trip without dominating the MemTable's own footprint.
pub const DEFAULT_BLOCK_SIZE: usize = 2 * 1024 * 1024;

struct Block {
    // Backed by `u64` rather than `u8` purely so the global allocator hands
    // us 8-byte-aligned storage: row cells and skip-list nodes carved out of
    // this block may contain pointers, which need that alignment on common
    // targets.
    data: Box<[u64]>,
    byte_len: usize,
    used: usize,
}

impl Block {
    fn new(size: usize) -> Self {
        let words = (size + 7) / 8;
        Self {
            data: vec![0u64; words].into_boxed_slice(),
            byte_len: size,
            used: 0,
        }
    }

    fn as_mut_byte_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr() as *mut u8
    }

    fn remaining(&self) -> usize {
        self.byte_len - self.used
    }
}

/// Hands out aligned byte regions that live until the arena itself is
/// dropped. Never returns an address it has already returned.
///
/// Not `Sync`: the MemTable that owns an `Arena` is written by exactly one
/// thread, so interior mutability via `RefCell` is sufficient and no
/// locking is added.
pub struct Arena {
    collector: Arc<MemoryCollector>,
    block_size: usize,
    blocks: RefCell<Vec<Block>>,
    consumed: RefCell<usize>,
}

impl Arena {
    pub fn new(collector: Arc<MemoryCollector>, block_size: usize) -> Self {
        Self {
            collector,
            block_size: block_size.max(1),
            blocks: RefCell::new(Vec::new()),
            consumed: RefCell::new(0),
        }
    }

    pub fn with_default_block_size(collector: Arc<MemoryCollector>) -> Self {
        Self::new(collector, DEFAULT_BLOCK_SIZE)
    }

    /// Total bytes consumed so far, including allocator overhead (whole
    /// blocks, even partially used ones). Monotonically non-decreasing
    /// across calls to `allocate`.
    pub fn consumed(&self) -> usize {
        *self.consumed.borrow()
    }

    /// Allocates `size` contiguous bytes, valid until `self` is dropped.
    ///
    /// # Panics
    /// Panics if `size` is zero; callers never need a zero-length cell.
    pub fn allocate(&self, size: usize) -> Result<&mut [u8]> {
        assert!(size > 0, "arena allocation size must be non-zero");

        // Every allocation is rounded up to a word so that `block.used` is
        // always word-aligned at the start of the next call: skip-list nodes
        // carved out of this arena contain pointers and need that alignment.
        let aligned_size = (size + 7) & !7;
        self.ensure_capacity(aligned_size)?;

        let mut blocks = self.blocks.borrow_mut();
        let block = blocks
            .last_mut()
            .expect("ensure_capacity always leaves a block with enough room");
        let offset = block.used;
        block.used += aligned_size;

        // SAFETY: `offset..offset+size` was just carved out of `block.data`
        // and will never be handed out again (the bump pointer `block.used`
        // has already moved past it). `block.data`'s heap buffer does not
        // move for the lifetime of `self` even though `blocks` (the `Vec`)
        // may reallocate and relocate the `Box` headers themselves; the
        // returned slice borrows `self`, not `blocks`, so it remains valid
        // as long as the arena is alive, satisfying the row-pointer
        // stability the index relies on.
        let ptr = unsafe { block.as_mut_byte_ptr().add(offset) };
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, size) })
    }

    fn ensure_capacity(&self, size: usize) -> Result<()> {
        let needs_new_block = {
            let blocks = self.blocks.borrow();
            blocks.last().map_or(true, |b| b.remaining() < size)
        };

        if needs_new_block {
            let new_block_size = size.max(self.block_size);
            self.collector.consume(new_block_size)?;
            debug!(
                "arena growing by a new block, size:{}, total_consumed:{}",
                new_block_size,
                self.consumed() + new_block_size
            );
            self.blocks.borrow_mut().push(Block::new(new_block_size));
            *self.consumed.borrow_mut() += new_block_size;
        }

        Ok(())
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.collector.release(self.consumed());
    }
}
