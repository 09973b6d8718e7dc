// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! An in-memory [`RowsetWriter`] test double. Exercises the downstream
//! contract without an actual on-disk segment writer, which is out of scope
//! for this crate. Exposed unconditionally (not gated behind
//! `#[cfg(test)]`) so both unit tests and `benches/insert.rs` can use it.

use common_util::error::GenericResult;

use crate::writer::{FinalizedCell, FinalizedRow, RowsetWriter};

/// One already-copied-out row, safe to keep past the `add_row` call that
/// produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum OwnedCell {
    Null,
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Boolean(bool),
    Timestamp(i64),
    Decimal(i128),
    Bytes(Vec<u8>),
}

impl From<FinalizedCell<'_>> for OwnedCell {
    fn from(cell: FinalizedCell<'_>) -> Self {
        match cell {
            FinalizedCell::Null => OwnedCell::Null,
            FinalizedCell::Int64(v) => OwnedCell::Int64(v),
            FinalizedCell::UInt64(v) => OwnedCell::UInt64(v),
            FinalizedCell::Double(v) => OwnedCell::Double(v),
            FinalizedCell::Boolean(v) => OwnedCell::Boolean(v),
            FinalizedCell::Timestamp(v) => OwnedCell::Timestamp(v),
            FinalizedCell::Decimal(v) => OwnedCell::Decimal(v),
            FinalizedCell::Bytes(b) => OwnedCell::Bytes(b.to_vec()),
        }
    }
}

/// Collects every row offered to it, in the order `add_row` was called —
/// the MemTable's ascending-key flush order.
#[derive(Default)]
pub struct InMemoryRowsetWriter {
    pub rows: Vec<Vec<OwnedCell>>,
    pub flushed: bool,
}

impl InMemoryRowsetWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RowsetWriter for InMemoryRowsetWriter {
    fn add_row(&mut self, row: FinalizedRow<'_>) -> GenericResult<()> {
        self.rows
            .push(row.cells().iter().copied().map(OwnedCell::from).collect());
        Ok(())
    }

    fn flush(&mut self) -> GenericResult<()> {
        self.flushed = true;
        Ok(())
    }
}

/// A [`RowsetWriter`] that fails on the `fail_at`-th `add_row` call, for
/// exercising the "flush aborts at the first failing row" path.
pub struct FailingRowsetWriter {
    pub fail_at: usize,
    calls: usize,
}

impl FailingRowsetWriter {
    pub fn new(fail_at: usize) -> Self {
        Self { fail_at, calls: 0 }
    }
}

impl RowsetWriter for FailingRowsetWriter {
    fn add_row(&mut self, _row: FinalizedRow<'_>) -> GenericResult<()> {
        self.calls += 1;
        if self.calls == self.fail_at {
            return Err("simulated rowset writer failure".into());
        }
        Ok(())
    }

    fn flush(&mut self) -> GenericResult<()> {
        Ok(())
    }
}
