// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! The MemTable: an ordered, aggregating write buffer keyed by a table's key
//! columns. Rows are ingested one at a time, kept sorted and (for
//! `UNIQUE_KEYS`/`AGG_KEYS`) deduplicated in an arena-backed skiplist, and
//! drained in ascending key order into a [`RowsetWriter`] on flush.
//!
//! Single producer, single consumer, both the same thread: no internal
//! synchronization is used or needed.

mod aggregator;
mod key;
mod layout;
pub mod metrics;
pub mod options;
pub mod testutil;
mod writer;

use std::{cell::{Cell, RefCell}, sync::Arc, time::Instant};

use arena::{Arena, MemoryCollector};
use common_types::{
    datum::Datum,
    row::Row,
    schema::{KeysType, Schema},
};
use common_util::error::GenericError;
use log::{debug, warn};
use skiplist::{Insertion, Skiplist};
use snafu::{Backtrace, ResultExt, Snafu};

use crate::{
    aggregator::AggregatePool,
    key::{KeySequence, RowComparator, RowHandle},
    layout::RowLayout,
};

pub use crate::{
    options::MemTableOptions,
    writer::{FinalizedCell, FinalizedRow, RowsetWriter},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "Memory limit exceeded while writing to memtable, tablet_id:{}, err:{}",
        tablet_id,
        source
    ))]
    MemLimitExceeded {
        tablet_id: u64,
        source: arena::Error,
    },

    #[snafu(display(
        "Rowset writer failed while flushing memtable, tablet_id:{}, err:{}",
        tablet_id,
        source
    ))]
    WriterFailed {
        tablet_id: u64,
        source: GenericError,
    },

    #[snafu(display(
        "MemTable invariant violated, tablet_id:{}: {}.\nBacktrace:\n{}",
        tablet_id,
        msg,
        backtrace
    ))]
    Internal {
        tablet_id: u64,
        msg: String,
        backtrace: Backtrace,
    },
}

common_util::define_result!(Error);

/// A MemTable accepts inserts only while `Open`; `flush` moves it through
/// `Flushing` and leaves it `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Flushing,
    Closed,
}

/// The in-memory write buffer for one tablet.
///
/// Owns an [`Arena`], a side object pool for complex aggregate state, an
/// arena-backed skiplist index, and a single scratch row buffer. All four
/// share the MemTable's own lifetime and are torn down together.
pub struct MemTable {
    tablet_id: u64,
    schema: Arc<Schema>,
    keys_type: KeysType,
    layout: RowLayout,
    sequence: KeySequence,

    // `arena` is heap-allocated via `Box` and never moves for the lifetime
    // of this `MemTable`, even if the `MemTable` itself is moved (moving a
    // `Box<T>` moves the pointer, not the heap allocation it points to).
    // `index` borrows `arena` for a lifetime cast to `'static` in `new`
    // below; that cast is sound exactly because of the non-movement
    // guarantee, and because `index` is dropped (as a field of this same
    // struct) no later than `arena` is, so the borrow never outlives its
    // referent. See the `SAFETY` comment in `new`.
    arena: Box<Arena>,
    index: Skiplist<'static, RowHandle, RowComparator>,
    pool: RefCell<AggregatePool>,
    /// Null means "no buffer currently reserved for the next row" — either
    /// at construction before the first call to `ensure_scratch`, or after a
    /// row was just committed to the index and its replacement allocation
    /// has not yet succeeded. `ensure_scratch` is the only place that turns
    /// null back into a valid pointer.
    scratch: Cell<*mut u8>,

    rowset_writer: RefCell<Box<dyn RowsetWriter>>,
    state: Cell<State>,
}

impl MemTable {
    /// Constructs a MemTable bound to one tablet, schema, keys-type, and
    /// rowset writer. WAL replay and orchestration with the rest of the
    /// storage engine are handled by the caller, not this core.
    pub fn new(
        tablet_id: u64,
        schema: Arc<Schema>,
        keys_type: KeysType,
        options: MemTableOptions,
        collector: Arc<MemoryCollector>,
        rowset_writer: Box<dyn RowsetWriter>,
    ) -> Result<Self> {
        let arena = Box::new(Arena::new(collector, options.arena_block_size));
        let layout = RowLayout::new(&schema);
        let comparator = RowComparator::new((*schema).clone(), layout.clone(), keys_type);

        // SAFETY: `arena` is a `Box` field of the `MemTable` we are about to
        // return; its heap allocation does not move for as long as that
        // `MemTable` (and therefore this reference) is alive, and `index`
        // (which stores this reference) is a sibling field dropped no later
        // than `arena`. Casting the borrow's lifetime to `'static` is sound
        // under those two facts, the standard technique for a self-owned
        // arena + arena-backed index pair with no external crate.
        let arena_ref: &'static Arena = unsafe { &*(arena.as_ref() as *const Arena) };
        let index = Skiplist::new(arena_ref, comparator);

        let memtable = Self {
            tablet_id,
            schema,
            keys_type,
            layout,
            sequence: KeySequence::new(),
            arena,
            index,
            pool: RefCell::new(AggregatePool::new()),
            scratch: Cell::new(std::ptr::null_mut()),
            rowset_writer: RefCell::new(rowset_writer),
            state: Cell::new(State::Open),
        };
        memtable.allocate_new_scratch()?;
        Ok(memtable)
    }

    pub fn tablet_id(&self) -> u64 {
        self.tablet_id
    }

    /// Current arena consumption. Monotonically non-decreasing between
    /// insertions; only drops when the MemTable itself is dropped.
    pub fn memory_usage(&self) -> usize {
        self.arena.consumed()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    fn allocate_new_scratch(&self) -> Result<()> {
        let row_size = self.layout.row_size();
        let buf = self
            .arena
            .allocate(row_size)
            .context(MemLimitExceeded {
                tablet_id: self.tablet_id,
            })?;
        self.scratch.set(buf.as_mut_ptr());
        Ok(())
    }

    /// Makes sure `self.scratch` points at a buffer this call owns
    /// exclusively, allocating one if the previous buffer was already
    /// handed off to the index and no replacement was carved out yet (a
    /// prior `insert` may have committed its row and then failed to
    /// pre-allocate the next scratch buffer against the memory budget).
    /// Must be called, and must succeed, before `encode_scratch` writes
    /// through `self.scratch`.
    fn ensure_scratch(&self) -> Result<()> {
        if self.scratch.get().is_null() {
            self.allocate_new_scratch()?;
        }
        Ok(())
    }

    /// # Safety
    /// `self.scratch` must point at `row_size` live bytes owned solely by
    /// the caller for the duration of the returned borrow (true whenever
    /// the scratch buffer has not yet been handed to the index).
    fn scratch_bytes_mut(&self) -> &mut [u8] {
        let row_size = self.layout.row_size();
        // SAFETY: the scratch buffer is exclusively owned by the single
        // producer thread until it is accepted by `index.insert_if_absent`;
        // nothing else reads or writes it concurrently.
        unsafe { std::slice::from_raw_parts_mut(self.scratch.get(), row_size) }
    }

    /// Encodes `row` into the scratch buffer via each column's `consume`.
    fn encode_scratch(&self, row: &Row) -> Result<()> {
        debug_assert_eq!(
            row.num_columns(),
            self.schema.num_columns(),
            "row/schema column count mismatch is a programmer error"
        );

        let row_size = self.layout.row_size();
        let scratch = self.scratch_bytes_mut();
        let mut pool = self.pool.borrow_mut();
        for (index, column) in self.schema.columns().iter().enumerate() {
            let value: &Datum = row.datum(index);
            let cell = self.layout.cell_bytes_mut(scratch, index);
            aggregator::consume(column, value, cell, &self.arena, &mut pool).context(
                MemLimitExceeded {
                    tablet_id: self.tablet_id,
                },
            )?;
        }
        debug_assert_eq!(scratch.len(), row_size);
        self.layout.write_sequence(scratch, self.sequence.next());
        Ok(())
    }

    /// Merges the just-encoded scratch row into `existing` under
    /// `AGG_KEYS`. Key columns are left untouched: they are equal to
    /// `existing`'s by definition of the collision.
    fn merge_into(&self, existing: RowHandle, incoming: RowHandle) {
        let row_size = self.layout.row_size();
        // SAFETY: `existing` is a live row buffer previously accepted into
        // the index, allocated with `row_size` bytes by this arena; no
        // other reference to it is held while this function runs — nothing
        // else touches entries already in the index except this method,
        // and only one insert runs at a time.
        let existing_buf =
            unsafe { std::slice::from_raw_parts_mut(existing.as_ptr() as *mut u8, row_size) };
        // SAFETY: `incoming` is the scratch buffer just populated by
        // `encode_scratch`, read-only for the duration of this call.
        let incoming_buf = unsafe { incoming.as_bytes::<'_>(row_size) };

        let mut pool = self.pool.borrow_mut();
        for index in self.schema.num_key_columns()..self.schema.num_columns() {
            let column = self.schema.column(index);
            let existing_cell = self.layout.cell_bytes_mut(existing_buf, index);
            let incoming_cell = self.layout.cell_bytes(incoming_buf, index);
            aggregator::agg_update(column, existing_cell, incoming_cell, &mut pool);
        }
    }

    /// Ingests one row.
    pub fn insert(&self, row: &Row) -> Result<()> {
        assert_eq!(
            self.state.get(),
            State::Open,
            "insert is only valid while the memtable is OPEN"
        );

        self.ensure_scratch()?;
        self.encode_scratch(row)?;

        // SAFETY: the just-encoded scratch buffer is `row_size` live bytes
        // owned by this arena.
        let handle = unsafe { RowHandle::new(self.scratch.get()) };

        let insertion = self.index.insert_if_absent(handle).context(MemLimitExceeded {
            tablet_id: self.tablet_id,
        })?;
        match insertion {
            Insertion::Inserted => {
                // The scratch buffer is now permanently owned by the index.
                // Clear our handle to it *before* trying to carve out a
                // fresh one: if that allocation fails, `self.scratch` must
                // stay null rather than keep pointing at a buffer the index
                // already owns, or the next `insert` would silently
                // overwrite an already-committed row through
                // `encode_scratch`. `ensure_scratch` on that next call
                // retries the allocation before anything is written.
                self.scratch.set(std::ptr::null_mut());
                self.allocate_new_scratch()?;
            }
            Insertion::AlreadyExists(slot) => match self.keys_type {
                KeysType::Unique => {
                    // New row replaces the prior one; the old buffer is now
                    // unreachable but stays arena-owned until teardown.
                    slot.replace(handle);
                    // Same reasoning as the `Inserted` arm above.
                    self.scratch.set(std::ptr::null_mut());
                    self.allocate_new_scratch()?;
                }
                KeysType::Agg => {
                    let existing = slot.get();
                    self.merge_into(existing, handle);
                    // Scratch bytes were never handed to the index; reuse
                    // them verbatim for the next row.
                }
                KeysType::Dup => {
                    // The DUP_KEYS comparator folds in an insertion sequence
                    // tie-break, so two distinct inserts never compare
                    // equal; reaching this arm is a comparator bug.
                    debug_assert!(
                        false,
                        "DUP_KEYS comparator reported a collision, which should be unreachable"
                    );
                    return Internal {
                        tablet_id: self.tablet_id,
                        msg: "dup_keys comparator reported a key collision".to_string(),
                    }
                    .fail();
                }
            },
        }
        Ok(())
    }

    /// Folds [`insert`](Self::insert) over a batch, stopping and returning
    /// the count absorbed so far on the first `MEM_LIMIT_EXCEEDED` (any
    /// other error propagates).
    pub fn insert_batch(&self, rows: impl IntoIterator<Item = Row>) -> Result<usize> {
        let mut absorbed = 0;
        for row in rows {
            match self.insert(&row) {
                Ok(()) => absorbed += 1,
                Err(Error::MemLimitExceeded { .. }) => {
                    warn!(
                        "memtable insert_batch stopped on memory limit, tablet_id:{}, absorbed:{}",
                        self.tablet_id, absorbed
                    );
                    return Ok(absorbed);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(absorbed)
    }

    /// Drains the index in ascending key order into the rowset writer.
    /// Transitions `OPEN -> FLUSHING -> CLOSED` regardless of outcome;
    /// re-entrant after `CLOSED` is a no-op returning `Ok`.
    pub fn flush(&self) -> Result<()> {
        if self.state.get() == State::Closed {
            return Ok(());
        }
        self.state.set(State::Flushing);

        let start = Instant::now();
        let result = self.flush_inner();
        self.state.set(State::Closed);

        match &result {
            Ok(()) => {
                metrics::MEMTABLE_FLUSH_TOTAL.inc();
                metrics::MEMTABLE_FLUSH_DURATION_US.inc_by(start.elapsed().as_micros() as u64);
                debug!(
                    "memtable flush succeeded, tablet_id:{}, rows:{}, took:{:?}",
                    self.tablet_id,
                    self.len(),
                    start.elapsed()
                );
            }
            Err(e) => warn!(
                "memtable flush failed, tablet_id:{}, err:{}",
                self.tablet_id, e
            ),
        }
        result
    }

    fn flush_inner(&self) -> Result<()> {
        let row_size = self.layout.row_size();
        let mut writer = self.rowset_writer.borrow_mut();
        let pool = self.pool.borrow();
        let mut cell_scratch: Vec<Vec<u8>> = vec![Vec::new(); self.schema.num_columns()];

        for handle in self.index.iter() {
            // SAFETY: every handle yielded by `index.iter()` was previously
            // accepted by `index.insert_if_absent`, so it references a live
            // `row_size`-byte buffer in this arena.
            let row_buf = unsafe { handle.as_bytes::<'_>(row_size) };

            let mut cells = Vec::with_capacity(self.schema.num_columns());
            for (index, buf) in cell_scratch.iter_mut().enumerate() {
                let column = self.schema.column(index);
                let cell_bytes = self.layout.cell_bytes(row_buf, index);
                buf.clear();
                cells.push(aggregator::finalize(column, cell_bytes, &pool, buf));
            }

            writer
                .add_row(FinalizedRow::new(cells))
                .context(WriterFailed {
                    tablet_id: self.tablet_id,
                })?;
        }

        writer.flush().context(WriterFailed {
            tablet_id: self.tablet_id,
        })
    }

    /// `close()` is just `flush()`.
    pub fn close(&self) -> Result<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use arena::{Arena, MemoryCollector};
    use common_types::{
        datum::DatumKind,
        schema::{AggregateFunction, Builder, ColumnSchemaBuilder},
    };

    use super::*;
    use crate::testutil::{FailingRowsetWriter, InMemoryRowsetWriter, OwnedCell};

    fn kv_schema() -> Arc<Schema> {
        Arc::new(
            Builder::new()
                .add_key_column(
                    ColumnSchemaBuilder::new("k".to_string(), DatumKind::Int64)
                        .is_nullable(true)
                        .build()
                        .unwrap(),
                )
                .unwrap()
                .add_normal_column(
                    ColumnSchemaBuilder::new("v".to_string(), DatumKind::Int64)
                        .build()
                        .unwrap(),
                )
                .unwrap()
                .build()
                .unwrap(),
        )
    }

    fn kv_schema_with_agg(agg: AggregateFunction) -> Arc<Schema> {
        Arc::new(
            Builder::new()
                .add_key_column(
                    ColumnSchemaBuilder::new("k".to_string(), DatumKind::Int64)
                        .build()
                        .unwrap(),
                )
                .unwrap()
                .add_normal_column(
                    ColumnSchemaBuilder::new("v".to_string(), DatumKind::Int64)
                        .aggregate_fn(agg)
                        .build()
                        .unwrap(),
                )
                .unwrap()
                .build()
                .unwrap(),
        )
    }

    fn row(k: i64, v: i64) -> Row {
        Row::from_datums(vec![Datum::Int64(k), Datum::Int64(v)])
    }

    fn new_memtable(schema: Arc<Schema>, keys_type: KeysType) -> (MemTable, ()) {
        let memtable = MemTable::new(
            1,
            schema,
            keys_type,
            MemTableOptions::default(),
            MemoryCollector::new_root(None),
            Box::new(InMemoryRowsetWriter::new()),
        )
        .unwrap();
        (memtable, ())
    }

    /// Builds a memtable with a writer we can inspect after flush.
    fn flush_and_collect(
        schema: Arc<Schema>,
        keys_type: KeysType,
        rows: Vec<Row>,
    ) -> Vec<Vec<OwnedCell>> {
        let writer = Box::new(InMemoryRowsetWriter::new());
        // Keep a raw pointer to peek at the writer's rows after flush,
        // since `MemTable` takes ownership of the trait object. This is a
        // test-only convenience, not something production code would do.
        let writer_ptr: *const InMemoryRowsetWriter = &*writer;
        let memtable = MemTable::new(
            1,
            schema,
            keys_type,
            MemTableOptions::default(),
            MemoryCollector::new_root(None),
            writer,
        )
        .unwrap();
        for r in rows {
            memtable.insert(&r).unwrap();
        }
        memtable.flush().unwrap();
        // SAFETY: `memtable` (and the boxed writer it owns) is still alive;
        // we are only reading through the pointer, never writing, and no
        // other reference to the writer exists at this point.
        unsafe { (*writer_ptr).rows.clone() }
    }

    #[test]
    fn dup_keys_sorts_by_key_and_keeps_all_rows() {
        let rows = flush_and_collect(
            kv_schema(),
            KeysType::Dup,
            vec![row(3, 10), row(1, 20), row(2, 30)],
        );
        let keys: Vec<_> = rows
            .iter()
            .map(|r| match r[0] {
                OwnedCell::Int64(k) => k,
                _ => panic!(),
            })
            .collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn unique_keys_later_insert_wins() {
        let rows = flush_and_collect(
            kv_schema(),
            KeysType::Unique,
            vec![row(1, 100), row(1, 200), row(2, 5), row(1, 300)],
        );
        let pairs: Vec<(i64, i64)> = rows
            .iter()
            .map(|r| {
                let k = match r[0] {
                    OwnedCell::Int64(k) => k,
                    _ => panic!(),
                };
                let v = match r[1] {
                    OwnedCell::Int64(v) => v,
                    _ => panic!(),
                };
                (k, v)
            })
            .collect();
        assert_eq!(pairs, vec![(1, 300), (2, 5)]);
    }

    #[test]
    fn agg_keys_sum_folds_colliding_rows() {
        let rows = flush_and_collect(
            kv_schema_with_agg(AggregateFunction::Sum),
            KeysType::Agg,
            vec![row(5, 1), row(5, 2), row(5, 4), row(6, 10)],
        );
        let pairs: Vec<(i64, i64)> = rows
            .iter()
            .map(|r| {
                let k = match r[0] {
                    OwnedCell::Int64(k) => k,
                    _ => panic!(),
                };
                let v = match r[1] {
                    OwnedCell::Int64(v) => v,
                    _ => panic!(),
                };
                (k, v)
            })
            .collect();
        assert_eq!(pairs, vec![(5, 7), (6, 10)]);
    }

    #[test]
    fn agg_keys_sum_folds_decimal_columns_as_scaled_integers() {
        let schema = Arc::new(
            Builder::new()
                .add_key_column(
                    ColumnSchemaBuilder::new("k".to_string(), DatumKind::Int64)
                        .build()
                        .unwrap(),
                )
                .unwrap()
                .add_normal_column(
                    ColumnSchemaBuilder::new("v".to_string(), DatumKind::Decimal)
                        .aggregate_fn(AggregateFunction::Sum)
                        .build()
                        .unwrap(),
                )
                .unwrap()
                .build()
                .unwrap(),
        );
        let rows = flush_and_collect(
            schema,
            KeysType::Agg,
            vec![
                Row::from_datums(vec![Datum::Int64(1), Datum::Decimal(100)]),
                Row::from_datums(vec![Datum::Int64(1), Datum::Decimal(230)]),
                Row::from_datums(vec![Datum::Int64(2), Datum::Decimal(50)]),
            ],
        );
        let pairs: Vec<(i64, i128)> = rows
            .iter()
            .map(|r| {
                let k = match r[0] {
                    OwnedCell::Int64(k) => k,
                    _ => panic!(),
                };
                let v = match r[1] {
                    OwnedCell::Decimal(v) => v,
                    _ => panic!(),
                };
                (k, v)
            })
            .collect();
        assert_eq!(pairs, vec![(1, 330), (2, 50)]);
    }

    #[test]
    fn agg_keys_replace_keeps_last_value() {
        let rows = flush_and_collect(
            kv_schema_with_agg(AggregateFunction::Replace),
            KeysType::Agg,
            vec![row(5, 1), row(5, 2), row(5, 4)],
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1], OwnedCell::Int64(4));
    }

    #[test]
    fn null_keys_sort_first() {
        let schema = Arc::new(
            Builder::new()
                .add_key_column(
                    ColumnSchemaBuilder::new("k".to_string(), DatumKind::Int64)
                        .is_nullable(true)
                        .build()
                        .unwrap(),
                )
                .unwrap()
                .add_normal_column(
                    ColumnSchemaBuilder::new("v".to_string(), DatumKind::Int64)
                        .build()
                        .unwrap(),
                )
                .unwrap()
                .build()
                .unwrap(),
        );
        let rows = flush_and_collect(
            schema,
            KeysType::Dup,
            vec![
                Row::from_datums(vec![Datum::Null, Datum::Int64(1)]),
                Row::from_datums(vec![Datum::Int64(2), Datum::Int64(2)]),
                Row::from_datums(vec![Datum::Null, Datum::Int64(3)]),
            ],
        );
        let keys: Vec<bool> = rows
            .iter()
            .map(|r| matches!(r[0], OwnedCell::Null))
            .collect();
        assert_eq!(keys, vec![true, true, false]);
        let values: Vec<i64> = rows
            .iter()
            .map(|r| match r[1] {
                OwnedCell::Int64(v) => v,
                _ => panic!(),
            })
            .collect();
        assert_eq!(values, vec![1, 3, 2]);
    }

    #[test]
    fn memory_usage_grows_monotonically_and_releases_on_drop() {
        let collector = MemoryCollector::new_root(None);
        {
            let memtable = MemTable::new(
                1,
                kv_schema(),
                KeysType::Dup,
                MemTableOptions::default(),
                Arc::clone(&collector),
                Box::new(InMemoryRowsetWriter::new()),
            )
            .unwrap();
            let before = memtable.memory_usage();
            memtable.insert(&row(1, 1)).unwrap();
            assert!(memtable.memory_usage() >= before);
            memtable.insert(&row(2, 2)).unwrap();
            assert!(memtable.memory_usage() >= before);
            assert!(collector.total_memory_allocated() > 0);
        }
        assert_eq!(collector.total_memory_allocated(), 0);
    }

    #[test]
    fn flush_on_empty_memtable_still_increments_counter() {
        let before = metrics::MEMTABLE_FLUSH_TOTAL.get();
        let (memtable, _) = new_memtable(kv_schema(), KeysType::Dup);
        memtable.flush().unwrap();
        assert_eq!(metrics::MEMTABLE_FLUSH_TOTAL.get(), before + 1);
    }

    #[test]
    fn close_after_close_is_a_no_op() {
        let (memtable, _) = new_memtable(kv_schema(), KeysType::Dup);
        memtable.close().unwrap();
        memtable.close().unwrap();
    }

    #[test]
    fn insert_after_memory_limit_is_rejected_but_prior_rows_still_flush() {
        let collector = MemoryCollector::new_root(Some(256));
        let writer = Box::new(InMemoryRowsetWriter::new());
        let writer_ptr: *const InMemoryRowsetWriter = &*writer;
        let memtable = MemTable::new(
            1,
            kv_schema(),
            KeysType::Dup,
            MemTableOptions {
                arena_block_size: 64,
            },
            collector,
            writer,
        )
        .unwrap();

        let mut inserted = 0;
        for k in 0..64 {
            match memtable.insert(&row(k, k)) {
                Ok(()) => inserted += 1,
                Err(Error::MemLimitExceeded { .. }) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(inserted > 0, "expected at least one row to fit in budget");

        memtable.flush().unwrap();
        // SAFETY: same justification as `flush_and_collect`.
        let rows = unsafe { (*writer_ptr).rows.clone() };
        assert_eq!(rows.len(), inserted);
    }

    #[test]
    fn retrying_insert_after_a_failed_scratch_reallocation_does_not_corrupt_prior_rows() {
        // Learn the exact byte cost of one committed row (a skiplist node
        // plus its replacement scratch buffer) and of the scratch buffer
        // alone, by watching `memory_usage()` on a throwaway memtable with
        // no budget limit. `arena_block_size: 1` makes every allocation grow
        // the arena by exactly its own aligned size, so these numbers are
        // exact rather than rounded up to some larger block.
        let probe_collector = MemoryCollector::new_root(None);
        let probe = MemTable::new(
            1,
            kv_schema(),
            KeysType::Dup,
            MemTableOptions {
                arena_block_size: 1,
            },
            Arc::clone(&probe_collector),
            Box::new(InMemoryRowsetWriter::new()),
        )
        .unwrap();
        let scratch_size = probe.memory_usage();
        probe.insert(&row(1, 1)).unwrap();
        let node_size = probe.memory_usage() - 2 * scratch_size;
        drop(probe);

        // `root_limit` is exactly enough for the real memtable's own
        // construction (one scratch buffer) plus three fully successful
        // inserts (one node and one replacement scratch each). A sibling
        // allocation against the same collector eats into that budget just
        // enough that the second insert's row still commits (its node
        // fits) but the replacement scratch allocation right after does
        // not — the exact failure this test regresses. Freeing the
        // sibling's allocation afterwards frees enough room for a third
        // insert to land in a fresh buffer rather than overwrite the
        // second row.
        let root_limit = 4 * scratch_size + 3 * node_size;
        let sibling_use = scratch_size + node_size + 8;
        let root = MemoryCollector::new_root(Some(root_limit));

        let sibling_arena = Arena::new(Arc::clone(&root), 1);
        sibling_arena.allocate(sibling_use).unwrap();

        let writer = Box::new(InMemoryRowsetWriter::new());
        let writer_ptr: *const InMemoryRowsetWriter = &*writer;
        let memtable = MemTable::new(
            1,
            kv_schema(),
            KeysType::Dup,
            MemTableOptions {
                arena_block_size: 1,
            },
            Arc::clone(&root),
            writer,
        )
        .unwrap();

        memtable.insert(&row(1, 100)).unwrap();
        let second = memtable.insert(&row(2, 200));
        assert!(
            matches!(second, Err(Error::MemLimitExceeded { .. })),
            "expected row 2's replacement scratch allocation to fail, got {:?}",
            second
        );

        // Simulate the shared memory tracker freeing up room later.
        drop(sibling_arena);
        memtable.insert(&row(3, 300)).unwrap();

        memtable.flush().unwrap();
        // SAFETY: same justification as `flush_and_collect`.
        let rows = unsafe { (*writer_ptr).rows.clone() };
        let pairs: Vec<(i64, i64)> = rows
            .iter()
            .map(|r| {
                let k = match r[0] {
                    OwnedCell::Int64(k) => k,
                    _ => panic!(),
                };
                let v = match r[1] {
                    OwnedCell::Int64(v) => v,
                    _ => panic!(),
                };
                (k, v)
            })
            .collect();
        // Row 2 committed to the index despite its own replacement scratch
        // allocation failing; the retried insert must not have overwritten
        // it through a stale `self.scratch` pointer.
        assert_eq!(pairs, vec![(1, 100), (2, 200), (3, 300)]);
    }

    #[test]
    fn writer_failure_aborts_flush_and_closes_memtable() {
        let memtable = MemTable::new(
            1,
            kv_schema(),
            KeysType::Dup,
            MemTableOptions::default(),
            MemoryCollector::new_root(None),
            Box::new(FailingRowsetWriter::new(2)),
        )
        .unwrap();
        memtable.insert(&row(1, 1)).unwrap();
        memtable.insert(&row(2, 2)).unwrap();
        memtable.insert(&row(3, 3)).unwrap();

        let result = memtable.flush();
        assert!(matches!(result, Err(Error::WriterFailed { .. })));
        // Re-entrant close after a failed flush is still a no-op success:
        // CLOSED is entered regardless of flush outcome.
        assert!(memtable.close().is_ok());
    }
}
