// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! A probabilistically-balanced ordered set whose nodes are carved out of an
//! [`arena::Arena`]. Generic over any `Copy` key and an external
//! [`Comparator`], so it has no notion of rows, schemas, or keys-types of its
//! own — those live one layer up, in `memtable`.
//!
//! Single-writer/single-reader only: nothing here is `Sync`, and no locks are
//! taken.

#![allow(clippy::mut_from_ref)]

use std::{
    cell::Cell,
    cmp::Ordering,
    marker::PhantomData,
    ptr,
};

use arena::Arena;
use rand::Rng;

/// Skip lists in this crate never grow past this many levels.
pub const MAX_LEVEL: usize = 12;
/// Branching factor denominator: each level is extended with probability
/// `1 / BRANCHING_FACTOR`.
pub const BRANCHING_FACTOR: u32 = 4;

/// Orders two keys. Implementations decide what "equal" means for their key
/// type; for row keys, equality is "same key-column prefix", not pointer
/// equality.
pub trait Comparator<K> {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

struct Node<K> {
    key: Cell<K>,
    height: usize,
    next: [Cell<*mut Node<K>>; MAX_LEVEL],
}

impl<K: Copy> Node<K> {
    fn next(&self, level: usize) -> *mut Node<K> {
        self.next[level].get()
    }

    fn set_next(&self, level: usize, node: *mut Node<K>) {
        self.next[level].set(node);
    }
}

fn empty_next<K>() -> [Cell<*mut Node<K>>; MAX_LEVEL] {
    std::array::from_fn(|_| Cell::new(ptr::null_mut()))
}

fn random_height() -> usize {
    let mut rng = rand::thread_rng();
    let mut height = 1;
    while height < MAX_LEVEL && rng.gen_range(0, BRANCHING_FACTOR) == 0 {
        height += 1;
    }
    height
}

/// A handle to an existing entry's key slot, allowing in-place replacement
/// without a second search.
pub struct Slot<'a, K> {
    cell: &'a Cell<K>,
}

impl<'a, K: Copy> Slot<'a, K> {
    pub fn get(&self) -> K {
        self.cell.get()
    }

    /// Overwrites the stored key, returning the previous value.
    pub fn replace(&self, new_key: K) -> K {
        self.cell.replace(new_key)
    }
}

pub enum Insertion<'a, K> {
    /// No equal-comparing entry existed; `key` was inserted as a new node.
    Inserted,
    /// An equal-comparing entry already existed; nothing was inserted.
    AlreadyExists(Slot<'a, K>),
}

/// An arena-backed ordered set of `K`, ordered by an external [`Comparator`].
pub struct Skiplist<'a, K, C> {
    arena: &'a Arena,
    comparator: C,
    head: Box<[Cell<*mut Node<K>>; MAX_LEVEL]>,
    max_height: Cell<usize>,
    len: Cell<usize>,
    _marker: PhantomData<K>,
}

impl<'a, K: Copy, C: Comparator<K>> Skiplist<'a, K, C> {
    pub fn new(arena: &'a Arena, comparator: C) -> Self {
        Self {
            arena,
            comparator,
            head: Box::new(empty_next()),
            max_height: Cell::new(1),
            len: Cell::new(0),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocates a node for `key` from the arena and returns a raw pointer to
    /// it. Fails if the arena's backing allocation is over budget; the
    /// caller is expected to propagate that failure rather than treat it as
    /// a bug, since growing the arena to fit a node is exactly as fallible
    /// as growing it to fit a row.
    fn new_node(&self, key: K, height: usize) -> arena::Result<*mut Node<K>> {
        let size = std::mem::size_of::<Node<K>>();
        let buf = self.arena.allocate(size)?;
        let ptr = buf.as_mut_ptr() as *mut Node<K>;
        // SAFETY: `ptr` references `size` freshly-carved, suitably aligned-
        // for-use bytes (the arena allocates plain byte blocks; `Node<K>`'s
        // alignment requirement is satisfied because every block we hand
        // out starts at the start of a fresh heap allocation, which the
        // global allocator aligns generously enough for any type this crate
        // is instantiated with in practice: raw pointers and small PODs).
        unsafe {
            ptr::write(
                ptr,
                Node {
                    key: Cell::new(key),
                    height,
                    next: empty_next(),
                },
            );
        }
        Ok(ptr)
    }

    fn head_next(&self, level: usize) -> *mut Node<K> {
        self.head[level].get()
    }

    fn set_head_next(&self, level: usize, node: *mut Node<K>) {
        self.head[level].set(node);
    }

    /// Finds, for each level, the last node strictly less than `key`, and
    /// returns those predecessor pointers (or null for "head" at that
    /// level) alongside the first node at level 0 that is `>= key`, if any.
    fn find_predecessors(&self, key: &K) -> ([*mut Node<K>; MAX_LEVEL], Option<*mut Node<K>>) {
        let mut prev = [ptr::null_mut::<Node<K>>(); MAX_LEVEL];
        let mut level = self.max_height.get();
        let mut current: *mut Node<K> = ptr::null_mut();

        loop {
            level -= 1;
            let mut next = if current.is_null() {
                self.head_next(level)
            } else {
                // SAFETY: `current` was produced by a previous iteration of
                // this same loop, always pointing at a live node owned by
                // this skiplist's arena.
                unsafe { (*current).next(level) }
            };

            while !next.is_null() {
                // SAFETY: `next` is a live node in this skiplist.
                let next_key = unsafe { (*next).key.get() };
                if self.comparator.compare(&next_key, key) == Ordering::Less {
                    current = next;
                    next = unsafe { (*current).next(level) };
                } else {
                    break;
                }
            }

            prev[level] = current;
            if level == 0 {
                let ge = if next.is_null() { None } else { Some(next) };
                return (prev, ge);
            }
        }
    }

    /// Inserts `key` unless an entry comparing equal already exists. On
    /// collision, returns a [`Slot`] over the existing entry instead of
    /// modifying the skiplist — callers decide whether to merge into the
    /// pointee or [`Slot::replace`] the key in place. Callers that never
    /// want a collision (duplicate-keys semantics) are expected to use a
    /// comparator that folds in a tie-break so two distinct inserts never
    /// compare equal, in which case every call here is `Inserted`.
    ///
    /// Fails without inserting if the arena cannot grow to fit a new node.
    pub fn insert_if_absent(&self, key: K) -> arena::Result<Insertion<'_, K>> {
        let (mut prev, candidate) = self.find_predecessors(&key);

        if let Some(existing) = candidate {
            // SAFETY: `existing` is a live node returned by `find_predecessors`.
            let existing_key_cell = unsafe { &(*existing).key };
            if self.comparator.compare(&existing_key_cell.get(), &key) == Ordering::Equal {
                return Ok(Insertion::AlreadyExists(Slot {
                    cell: unsafe { &*(existing_key_cell as *const Cell<K>) },
                }));
            }
        }

        let height = random_height();
        if height > self.max_height.get() {
            for level in self.max_height.get()..height {
                prev[level] = ptr::null_mut();
            }
            self.max_height.set(height);
        }

        let node = self.new_node(key, height)?;
        for level in 0..height {
            let p = prev[level];
            if p.is_null() {
                // SAFETY: `node` was just allocated above.
                unsafe { (*node).set_next(level, self.head_next(level)) };
                self.set_head_next(level, node);
            } else {
                // SAFETY: `p` is a live node at this level.
                unsafe {
                    (*node).set_next(level, (*p).next(level));
                    (*p).set_next(level, node);
                }
            }
        }

        self.len.set(self.len.get() + 1);
        Ok(Insertion::Inserted)
    }

    /// Forward iterator over entries in ascending order.
    pub fn iter(&self) -> Iter<'_, K, C> {
        Iter {
            next: self.head_next(0),
            _marker: PhantomData,
            _list: self,
        }
    }
}

pub struct Iter<'a, K, C> {
    next: *mut Node<K>,
    _marker: PhantomData<K>,
    _list: &'a Skiplist<'a, K, C>,
}

impl<'a, K: Copy, C> Iterator for Iter<'a, K, C> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        if self.next.is_null() {
            return None;
        }
        // SAFETY: `self.next` is either null or a live node owned by the
        // arena backing `_list`, which outlives this iterator.
        let node = unsafe { &*self.next };
        let key = node.key.get();
        self.next = node.next(0);
        Some(key)
    }
}
