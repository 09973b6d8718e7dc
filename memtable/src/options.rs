// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! MemTable configuration. A plain deserializable options struct overridable
//! per table.

use serde::Deserialize;

fn default_arena_block_size() -> usize {
    arena::DEFAULT_BLOCK_SIZE
}

/// Knobs for one MemTable instance. The skiplist's level cap and branching
/// factor (`skiplist::MAX_LEVEL`/`BRANCHING_FACTOR`) are compile-time
/// constants of the underlying component, not runtime knobs, so they are
/// not duplicated here.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemTableOptions {
    /// Size, in bytes, of each block the arena grows by.
    pub arena_block_size: usize,
}

impl Default for MemTableOptions {
    fn default() -> Self {
        Self {
            arena_block_size: default_arena_block_size(),
        }
    }
}
