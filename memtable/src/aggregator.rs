// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Per-column aggregator dispatch: `consume` initializes a cell from an
//! incoming value, `agg_update` merges a colliding insert into an existing
//! cell under `AGG_KEYS`, and `finalize` converts any in-memory aggregate
//! object into its on-disk serialized form ahead of flush.
//!
//! Dispatch is a closed match over `AggregateFunction` rather than an
//! open-ended trait-object hierarchy: the set of supported functions is
//! known at schema-load time and doesn't need runtime extensibility.

use std::hash::{Hash, Hasher};

use ahash::AHasher;
use arena::Arena;
use common_types::{datum::Datum, schema::{AggregateFunction, ColumnSchema}};
use roaring::RoaringBitmap;

use crate::{layout::{self, CellView}, writer::FinalizedCell};

/// Number of dense HLL registers: 2^6, a modest precision appropriate for a
/// write-buffer's in-flight cardinality estimate rather than a final stored
/// sketch.
pub const HLL_REGISTERS: usize = 64;
const HLL_REGISTER_MASK: u64 = (HLL_REGISTERS - 1) as u64;

/// A dense-register HyperLogLog sketch.
#[derive(Clone)]
pub struct HllSketch {
    registers: [u8; HLL_REGISTERS],
}

impl HllSketch {
    pub fn new() -> Self {
        Self {
            registers: [0; HLL_REGISTERS],
        }
    }

    pub fn insert_hash(&mut self, hash: u64) {
        let bucket = (hash & HLL_REGISTER_MASK) as usize;
        let rest = hash >> HLL_REGISTERS.trailing_zeros();
        let rank = (rest.trailing_zeros() + 1) as u8;
        if rank > self.registers[bucket] {
            self.registers[bucket] = rank;
        }
    }

    pub fn merge(&mut self, other: &HllSketch) {
        for i in 0..HLL_REGISTERS {
            self.registers[i] = self.registers[i].max(other.registers[i]);
        }
    }

    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.registers);
    }
}

impl Default for HllSketch {
    fn default() -> Self {
        Self::new()
    }
}

/// One cell's worth of non-inline aggregate state: a dense HLL sketch or a
/// roaring bitmap. Lives in the MemTable's side object pool, not the arena,
/// whose lifetime matches the MemTable itself.
pub enum AggState {
    Hll(HllSketch),
    Bitmap(RoaringBitmap),
}

/// The side object pool for complex aggregate state. Entries are never
/// freed individually — only en bloc when the pool itself is dropped with
/// the MemTable, mirroring the arena's own mass-release semantics.
#[derive(Default)]
pub struct AggregatePool {
    slots: Vec<AggState>,
}

impl AggregatePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, state: AggState) -> usize {
        self.slots.push(state);
        self.slots.len() - 1
    }

    pub fn get(&self, index: usize) -> &AggState {
        &self.slots[index]
    }

    /// Mutable access to two distinct slots at once, needed to merge one
    /// row's freshly-consumed sketch into another's existing one without an
    /// intermediate clone.
    ///
    /// # Panics
    /// If `a == b`.
    pub fn two_mut(&mut self, a: usize, b: usize) -> (&mut AggState, &mut AggState) {
        assert_ne!(a, b, "cannot borrow the same pool slot twice");
        if a < b {
            let (left, right) = self.slots.split_at_mut(b);
            (&mut left[a], &mut right[0])
        } else {
            let (left, right) = self.slots.split_at_mut(a);
            (&mut right[0], &mut left[b])
        }
    }
}

fn hash_datum(value: &Datum) -> u64 {
    let mut hasher = AHasher::default();
    match value {
        Datum::Varchar(s) => s.as_bytes().hash(&mut hasher),
        Datum::Varbinary(b) => b.hash(&mut hasher),
        Datum::Int64(v) => hasher.write_i64(*v),
        Datum::UInt64(v) => hasher.write_u64(*v),
        Datum::Double(v) => hasher.write_u64(v.to_bits()),
        Datum::Boolean(v) => hasher.write_u8(*v as u8),
        Datum::Timestamp(v) => hasher.write_i64(*v),
        Datum::Decimal(v) => hasher.write_i128(*v),
        Datum::Null => unreachable!("null values are dispatched before hashing"),
    }
    hasher.finish()
}

fn datum_as_bitmap_element(value: &Datum) -> u32 {
    match value {
        Datum::UInt64(v) => *v as u32,
        Datum::Int64(v) => *v as u32,
        other => panic!(
            "bitmap_union column received a non-integer value ({:?}); this is a schema/tuple mismatch",
            other.kind()
        ),
    }
}

/// Initializes `cell` from an incoming typed value. Called once per row, on
/// first insertion of that row into the scratch buffer.
pub fn consume(
    column: &ColumnSchema,
    value: &Datum,
    cell: &mut [u8],
    arena: &Arena,
    pool: &mut AggregatePool,
) -> arena::Result<()> {
    if value.is_null() {
        layout::write_null(cell);
        return Ok(());
    }

    match column.default_aggregate {
        Some(AggregateFunction::HllUnion) => {
            let mut sketch = HllSketch::new();
            sketch.insert_hash(hash_datum(value));
            let idx = pool.push(AggState::Hll(sketch));
            layout::write_agg_slot(cell, idx);
        }
        Some(AggregateFunction::BitmapUnion) => {
            let mut bitmap = RoaringBitmap::new();
            bitmap.insert(datum_as_bitmap_element(value));
            let idx = pool.push(AggState::Bitmap(bitmap));
            layout::write_agg_slot(cell, idx);
        }
        _ => match value {
            Datum::Int64(v) => layout::write_int64(cell, *v),
            Datum::UInt64(v) => layout::write_uint64(cell, *v),
            Datum::Double(v) => layout::write_double(cell, *v),
            Datum::Boolean(v) => layout::write_boolean(cell, *v),
            Datum::Timestamp(v) => layout::write_timestamp(cell, *v),
            Datum::Decimal(v) => layout::write_decimal(cell, *v),
            Datum::Varchar(s) => write_bytes(cell, s.as_bytes(), arena)?,
            Datum::Varbinary(b) => write_bytes(cell, b, arena)?,
            Datum::Null => unreachable!("handled above"),
        },
    }
    Ok(())
}

fn write_bytes(cell: &mut [u8], bytes: &[u8], arena: &Arena) -> arena::Result<()> {
    if bytes.is_empty() {
        // No arena traffic for an empty value; any non-null, well-aligned
        // pointer is fine since the decoded slice will have length zero.
        layout::write_bytes_descriptor(cell, std::ptr::NonNull::<u8>::dangling().as_ptr(), 0);
        return Ok(());
    }
    let slot = arena.allocate(bytes.len())?;
    slot.copy_from_slice(bytes);
    layout::write_bytes_descriptor(cell, slot.as_ptr(), bytes.len());
    Ok(())
}

/// Merges `incoming`'s cell into `existing`'s, under `AGG_KEYS`. Key columns
/// are the identity and are never passed here.
pub fn agg_update(
    column: &ColumnSchema,
    existing: &mut [u8],
    incoming: &[u8],
    pool: &mut AggregatePool,
) {
    debug_assert!(!column.is_key, "key columns must not be passed to agg_update");
    let agg = column
        .default_aggregate
        .expect("non-key columns in an AGG_KEYS table must carry an aggregation function");

    match agg {
        AggregateFunction::Replace => existing.copy_from_slice(incoming),
        AggregateFunction::Sum => {
            let cur = layout::decode_cell(column, existing);
            let inc = layout::decode_cell(column, incoming);
            match (cur, inc) {
                (CellView::Null, CellView::Null) => {}
                (CellView::Null, _) => existing.copy_from_slice(incoming),
                (_, CellView::Null) => {}
                (CellView::Int64(a), CellView::Int64(b)) => {
                    layout::write_int64(existing, a.wrapping_add(b))
                }
                (CellView::UInt64(a), CellView::UInt64(b)) => {
                    layout::write_uint64(existing, a.wrapping_add(b))
                }
                (CellView::Double(a), CellView::Double(b)) => layout::write_double(existing, a + b),
                (CellView::Decimal(a), CellView::Decimal(b)) => {
                    layout::write_decimal(existing, a.wrapping_add(b))
                }
                (a, b) => panic!("sum aggregation on non-numeric cells ({:?}, {:?})", a, b),
            }
        }
        AggregateFunction::Min | AggregateFunction::Max => {
            let cur = layout::decode_cell(column, existing);
            let inc = layout::decode_cell(column, incoming);
            let incoming_wins = match (&cur, &inc) {
                (CellView::Null, CellView::Null) => false,
                (CellView::Null, _) => true,
                (_, CellView::Null) => false,
                (a, b) => {
                    let ord = b.cmp_total(a);
                    if agg == AggregateFunction::Min {
                        ord == std::cmp::Ordering::Less
                    } else {
                        ord == std::cmp::Ordering::Greater
                    }
                }
            };
            if incoming_wins {
                existing.copy_from_slice(incoming);
            }
        }
        AggregateFunction::HllUnion => {
            let existing_idx = match layout::decode_cell(column, existing) {
                CellView::AggSlot(idx) => idx,
                CellView::Null => {
                    existing.copy_from_slice(incoming);
                    return;
                }
                other => panic!("hll_union cell decoded as {:?}", other),
            };
            let incoming_idx = match layout::decode_cell(column, incoming) {
                CellView::AggSlot(idx) => idx,
                CellView::Null => return,
                other => panic!("hll_union cell decoded as {:?}", other),
            };
            let (existing_state, incoming_state) = pool.two_mut(existing_idx, incoming_idx);
            if let (AggState::Hll(existing_sketch), AggState::Hll(incoming_sketch)) =
                (existing_state, incoming_state)
            {
                existing_sketch.merge(incoming_sketch);
            } else {
                unreachable!("hll_union pool slots must hold Hll state");
            }
        }
        AggregateFunction::BitmapUnion => {
            let existing_idx = match layout::decode_cell(column, existing) {
                CellView::AggSlot(idx) => idx,
                CellView::Null => {
                    existing.copy_from_slice(incoming);
                    return;
                }
                other => panic!("bitmap_union cell decoded as {:?}", other),
            };
            let incoming_idx = match layout::decode_cell(column, incoming) {
                CellView::AggSlot(idx) => idx,
                CellView::Null => return,
                other => panic!("bitmap_union cell decoded as {:?}", other),
            };
            let (existing_state, incoming_state) = pool.two_mut(existing_idx, incoming_idx);
            if let (AggState::Bitmap(existing_bitmap), AggState::Bitmap(incoming_bitmap)) =
                (existing_state, incoming_state)
            {
                *existing_bitmap |= incoming_bitmap.clone();
            } else {
                unreachable!("bitmap_union pool slots must hold Bitmap state");
            }
        }
    }
}

/// Converts one cell's internal state into its finalized, on-disk-ready
/// form ahead of flush. `scratch` backs any bytes
/// that must be freshly serialized (HLL registers, a roaring bitmap);
/// plain variable-length cells are returned borrowing straight from the
/// row/arena instead of being copied.
pub fn finalize<'a>(
    column: &ColumnSchema,
    cell: &'a [u8],
    pool: &AggregatePool,
    scratch: &'a mut Vec<u8>,
) -> FinalizedCell<'a> {
    match layout::decode_cell(column, cell) {
        CellView::Null => FinalizedCell::Null,
        CellView::Int64(v) => FinalizedCell::Int64(v),
        CellView::UInt64(v) => FinalizedCell::UInt64(v),
        CellView::Double(v) => FinalizedCell::Double(v),
        CellView::Boolean(v) => FinalizedCell::Boolean(v),
        CellView::Timestamp(v) => FinalizedCell::Timestamp(v),
        CellView::Decimal(v) => FinalizedCell::Decimal(v),
        CellView::Bytes(bytes) => FinalizedCell::Bytes(bytes),
        CellView::AggSlot(idx) => {
            scratch.clear();
            match pool.get(idx) {
                AggState::Hll(sketch) => sketch.serialize_into(scratch),
                AggState::Bitmap(bitmap) => {
                    bitmap
                        .serialize_into(scratch)
                        .expect("serializing into an in-memory Vec<u8> cannot fail");
                }
            }
            FinalizedCell::Bytes(scratch.as_slice())
        }
    }
}
