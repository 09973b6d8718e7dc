// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Arena allocator and memory tracker tree.

mod arena;
mod collector;

pub use arena::{Arena, DEFAULT_BLOCK_SIZE};
pub use collector::{Error, MemoryCollector, Result};
