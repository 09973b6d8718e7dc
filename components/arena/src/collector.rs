// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! A parent/child tree of byte counters that an [`Arena`](crate::Arena)
//! reports its growth to, with an optional hard limit at any node. Stands in
//! for an engine-wide memory tracker that would normally live above the
//! MemTable layer; a concrete tree is still needed so `Arena::allocate` has
//! something real to consult.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use snafu::{Backtrace, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "Memory tracker over budget, requested:{}, limit:{}, already_allocated:{}.\nBacktrace:\n{}",
        requested,
        limit,
        already_allocated,
        backtrace
    ))]
    MemLimitExceeded {
        requested: usize,
        limit: usize,
        already_allocated: usize,
        backtrace: Backtrace,
    },
}

common_util::define_result!(Error);

/// A node in the memory tracker tree. Every [`Arena`](crate::Arena) reports
/// its consumption to exactly one `MemoryCollector`; an engine typically
/// nests one collector per tablet under one per space under one for the
/// whole process.
pub struct MemoryCollector {
    parent: Option<Arc<MemoryCollector>>,
    limit: Option<usize>,
    allocated: AtomicUsize,
}

impl MemoryCollector {
    /// Creates a root collector, typically one per process or per space.
    pub fn new_root(limit: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            parent: None,
            limit,
            allocated: AtomicUsize::new(0),
        })
    }

    /// Creates a collector nested under `parent`, e.g. one per tablet.
    pub fn new_child(parent: &Arc<MemoryCollector>, limit: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(Arc::clone(parent)),
            limit,
            allocated: AtomicUsize::new(0),
        })
    }

    /// Attempts to consume `bytes` more, checking this node's own limit and
    /// then recursively checking every ancestor. On rejection at any level,
    /// nothing is committed at this node or below the rejecting ancestor.
    pub fn consume(&self, bytes: usize) -> Result<()> {
        let new_total = self.allocated.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if let Some(limit) = self.limit {
            if new_total > limit {
                self.allocated.fetch_sub(bytes, Ordering::SeqCst);
                return MemLimitExceeded {
                    requested: bytes,
                    limit,
                    already_allocated: new_total - bytes,
                }
                .fail();
            }
        }

        if let Some(parent) = &self.parent {
            if let Err(e) = parent.consume(bytes) {
                self.allocated.fetch_sub(bytes, Ordering::SeqCst);
                return Err(e);
            }
        }

        Ok(())
    }

    /// Releases `bytes` back, propagating up the tree. Called en bloc when
    /// an [`Arena`](crate::Arena) is destroyed.
    pub fn release(&self, bytes: usize) {
        self.allocated.fetch_sub(bytes, Ordering::SeqCst);
        if let Some(parent) = &self.parent {
            parent.release(bytes);
        }
    }

    /// Bytes currently attributed to this node (not including descendants).
    pub fn total_memory_allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }
}
