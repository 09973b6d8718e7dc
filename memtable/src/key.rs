// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! The key comparator and the `DUP_KEYS` tie-break it falls back to, used
//! to order otherwise-equal rows by arrival order.

use std::{cell::Cell, cmp::Ordering};

use common_types::schema::{KeysType, Schema};
use skiplist::Comparator;

use crate::layout::{self, RowLayout};

/// Monotonic counter handed out once per inserted row. Only consulted by the
/// comparator under `DUP_KEYS`, where it keeps every insert distinct so the
/// skiplist never reports a collision: a later insert with an equal key is
/// ordered after the earlier one.
pub struct KeySequence(Cell<u64>);

impl KeySequence {
    pub fn new() -> Self {
        Self(Cell::new(0))
    }

    pub fn next(&self) -> u64 {
        let seq = self.0.get();
        self.0.set(seq + 1);
        seq
    }
}

impl Default for KeySequence {
    fn default() -> Self {
        Self::new()
    }
}

/// A `Copy` pointer to a row buffer living in the MemTable's arena. This is
/// the skiplist's element type: the index stores pointers to row buffers in
/// the arena, not the buffers themselves.
#[derive(Clone, Copy)]
pub struct RowHandle(pub(crate) *const u8);

impl RowHandle {
    /// # Safety
    /// The caller must ensure `ptr` references `row_size` live, readable
    /// bytes for as long as the returned handle is used.
    pub(crate) unsafe fn new(ptr: *const u8) -> Self {
        Self(ptr)
    }

    /// # Safety
    /// `row_size` must match the row size the pointee was allocated with.
    pub(crate) unsafe fn as_bytes<'a>(&self, row_size: usize) -> &'a [u8] {
        std::slice::from_raw_parts(self.0, row_size)
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.0
    }
}

/// Compares two row buffers by their first `K` key columns, falling back to
/// insertion order under `DUP_KEYS`.
pub struct RowComparator {
    schema: Schema,
    layout: RowLayout,
    row_size: usize,
    keys_type: KeysType,
}

impl RowComparator {
    pub fn new(schema: Schema, layout: RowLayout, keys_type: KeysType) -> Self {
        let row_size = layout.row_size();
        Self {
            schema,
            layout,
            row_size,
            keys_type,
        }
    }
}

impl Comparator<RowHandle> for RowComparator {
    fn compare(&self, a: &RowHandle, b: &RowHandle) -> Ordering {
        // SAFETY: every `RowHandle` the skiplist compares was allocated by
        // this MemTable's arena with exactly `self.row_size` bytes.
        let a_buf = unsafe { a.as_bytes::<'_>(self.row_size) };
        let b_buf = unsafe { b.as_bytes::<'_>(self.row_size) };

        for i in 0..self.schema.num_key_columns() {
            let column = self.schema.column(i);
            let ca = layout::decode_cell(column, self.layout.cell_bytes(a_buf, i));
            let cb = layout::decode_cell(column, self.layout.cell_bytes(b_buf, i));
            let ord = ca.cmp_total(&cb);
            if ord != Ordering::Equal {
                return ord;
            }
        }

        if self.keys_type == KeysType::Dup {
            return self
                .layout
                .read_sequence(a_buf)
                .cmp(&self.layout.read_sequence(b_buf));
        }

        Ordering::Equal
    }
}
