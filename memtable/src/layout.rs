// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Row buffer layout: projects a `Schema` onto byte offsets within a
//! contiguous row buffer, and decodes individual cells back into typed
//! views.
//!
//! A row buffer is `[cell_0][cell_1]...[cell_n-1][sequence: u64]`. The
//! trailing 8 bytes are not part of the schema; they hold the
//! [`crate::key::KeySequence`] tie-break used under `DUP_KEYS` to keep a
//! later insert ordered after an earlier one with an equal key.
//!
//! Each cell is `[null_flag: u8][payload]`, where `payload` is:
//! - the fixed-width value itself, for fixed-width types;
//! - an 8-byte pointer + 8-byte length descriptor into the arena, for
//!   variable-length types without an aggregation function;
//! - an 8-byte index into the MemTable's aggregate-object pool, for columns
//!   whose aggregation function is `HllUnion`/`BitmapUnion`.

use std::cmp::Ordering;

use common_types::{
    datum::DatumKind,
    schema::{AggregateFunction, ColumnSchema, Schema},
};

/// Bytes reserved for the `DUP_KEYS` insertion-sequence tie-break, appended
/// after the last schema column in every row buffer.
pub const SEQUENCE_WIDTH: usize = 8;

fn cell_width(column: &ColumnSchema) -> usize {
    let payload = match column.default_aggregate {
        Some(AggregateFunction::HllUnion) | Some(AggregateFunction::BitmapUnion) => 8,
        _ if column.data_type.is_variable_length() => 16,
        _ => column
            .data_type
            .fixed_width()
            .expect("variable-length case handled above"),
    };
    1 + payload
}

/// A decoded view over one cell's bytes. Borrows from whatever buffer it was
/// decoded out of (the row buffer itself for fixed-width cells, or the arena
/// for variable-length ones).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CellView<'a> {
    Null,
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Boolean(bool),
    Timestamp(i64),
    Bytes(&'a [u8]),
    /// Scaled integer representation of a `Decimal` value.
    Decimal(i128),
    /// Index into the aggregate-object pool.
    AggSlot(usize),
}

impl<'a> CellView<'a> {
    /// Total ordering used by the key comparator: nulls sort before
    /// non-nulls, numeric types use natural order (`f64::total_cmp` for
    /// floats), byte-lexicographic for variable-length cells.
    ///
    /// # Panics
    /// If the two cells are of incompatible kinds — a schema/tuple
    /// mismatch, which is a programmer error rather than a runtime
    /// condition this type needs to handle gracefully.
    pub fn cmp_total(&self, other: &CellView<'a>) -> Ordering {
        match (self, other) {
            (CellView::Null, CellView::Null) => Ordering::Equal,
            (CellView::Null, _) => Ordering::Less,
            (_, CellView::Null) => Ordering::Greater,
            (CellView::Int64(a), CellView::Int64(b)) => a.cmp(b),
            (CellView::UInt64(a), CellView::UInt64(b)) => a.cmp(b),
            (CellView::Double(a), CellView::Double(b)) => a.total_cmp(b),
            (CellView::Boolean(a), CellView::Boolean(b)) => a.cmp(b),
            (CellView::Timestamp(a), CellView::Timestamp(b)) => a.cmp(b),
            (CellView::Bytes(a), CellView::Bytes(b)) => a.cmp(b),
            (CellView::Decimal(a), CellView::Decimal(b)) => a.cmp(b),
            (a, b) => panic!(
                "comparing mismatched cell kinds ({:?} vs {:?}) is a schema/tuple mismatch",
                a, b
            ),
        }
    }
}

pub fn write_null(cell: &mut [u8]) {
    cell[0] = 1;
    for b in &mut cell[1..] {
        *b = 0;
    }
}

pub fn write_int64(cell: &mut [u8], v: i64) {
    cell[0] = 0;
    cell[1..9].copy_from_slice(&v.to_ne_bytes());
}

pub fn write_uint64(cell: &mut [u8], v: u64) {
    cell[0] = 0;
    cell[1..9].copy_from_slice(&v.to_ne_bytes());
}

pub fn write_double(cell: &mut [u8], v: f64) {
    cell[0] = 0;
    cell[1..9].copy_from_slice(&v.to_ne_bytes());
}

pub fn write_boolean(cell: &mut [u8], v: bool) {
    cell[0] = 0;
    cell[1] = v as u8;
}

pub fn write_timestamp(cell: &mut [u8], v: i64) {
    cell[0] = 0;
    cell[1..9].copy_from_slice(&v.to_ne_bytes());
}

pub fn write_decimal(cell: &mut [u8], v: i128) {
    cell[0] = 0;
    cell[1..17].copy_from_slice(&v.to_ne_bytes());
}

/// Encodes a pointer/length descriptor referring to out-of-line bytes the
/// caller has already copied into the arena.
pub fn write_bytes_descriptor(cell: &mut [u8], ptr: *const u8, len: usize) {
    cell[0] = 0;
    cell[1..9].copy_from_slice(&(ptr as usize).to_ne_bytes());
    cell[9..17].copy_from_slice(&len.to_ne_bytes());
}

/// Encodes an index into the aggregate-object pool.
pub fn write_agg_slot(cell: &mut [u8], index: usize) {
    cell[0] = 0;
    cell[1..9].copy_from_slice(&(index as u64).to_ne_bytes());
}

/// Decodes a cell's bytes according to its column's type and aggregation
/// function. `bytes` must be exactly this column's cell width.
pub fn decode_cell(column: &ColumnSchema, bytes: &[u8]) -> CellView<'_> {
    if bytes[0] != 0 {
        return CellView::Null;
    }
    let payload = &bytes[1..];
    match column.default_aggregate {
        Some(AggregateFunction::HllUnion) | Some(AggregateFunction::BitmapUnion) => {
            let idx = u64::from_ne_bytes(payload[0..8].try_into().unwrap()) as usize;
            CellView::AggSlot(idx)
        }
        _ => match column.data_type {
            DatumKind::Int64 => CellView::Int64(i64::from_ne_bytes(payload.try_into().unwrap())),
            DatumKind::UInt64 => {
                CellView::UInt64(u64::from_ne_bytes(payload.try_into().unwrap()))
            }
            DatumKind::Double => {
                CellView::Double(f64::from_ne_bytes(payload.try_into().unwrap()))
            }
            DatumKind::Boolean => CellView::Boolean(payload[0] != 0),
            DatumKind::Timestamp => {
                CellView::Timestamp(i64::from_ne_bytes(payload.try_into().unwrap()))
            }
            DatumKind::Decimal => {
                CellView::Decimal(i128::from_ne_bytes(payload.try_into().unwrap()))
            }
            DatumKind::Varchar | DatumKind::Varbinary => {
                let ptr = usize::from_ne_bytes(payload[0..8].try_into().unwrap()) as *const u8;
                let len = usize::from_ne_bytes(payload[8..16].try_into().unwrap());
                // SAFETY: `ptr`/`len` were written by `write_bytes_descriptor`
                // from a slice the arena handed out; the arena outlives every
                // row buffer referencing it.
                CellView::Bytes(unsafe { std::slice::from_raw_parts(ptr, len) })
            }
        },
    }
}

/// The byte-offset plan for one `Schema`: where each column's cell starts
/// and how wide it is, plus the trailing sequence field.
#[derive(Debug, Clone)]
pub struct RowLayout {
    offsets: Vec<usize>,
    widths: Vec<usize>,
    row_size: usize,
}

impl RowLayout {
    pub fn new(schema: &Schema) -> Self {
        let mut offsets = Vec::with_capacity(schema.num_columns());
        let mut widths = Vec::with_capacity(schema.num_columns());
        let mut offset = 0;
        for column in schema.columns() {
            let width = cell_width(column);
            offsets.push(offset);
            widths.push(width);
            offset += width;
        }
        Self {
            offsets,
            widths,
            row_size: offset + SEQUENCE_WIDTH,
        }
    }

    /// Total size of one row buffer, including the trailing sequence field.
    pub fn row_size(&self) -> usize {
        self.row_size
    }

    pub fn cell_offset(&self, index: usize) -> usize {
        self.offsets[index]
    }

    pub fn cell_width(&self, index: usize) -> usize {
        self.widths[index]
    }

    pub fn cell_bytes<'a>(&self, row: &'a [u8], index: usize) -> &'a [u8] {
        let off = self.offsets[index];
        &row[off..off + self.widths[index]]
    }

    pub fn cell_bytes_mut<'a>(&self, row: &'a mut [u8], index: usize) -> &'a mut [u8] {
        let off = self.offsets[index];
        &mut row[off..off + self.widths[index]]
    }

    fn sequence_offset(&self) -> usize {
        self.row_size - SEQUENCE_WIDTH
    }

    pub fn write_sequence(&self, row: &mut [u8], seq: u64) {
        let off = self.sequence_offset();
        row[off..off + SEQUENCE_WIDTH].copy_from_slice(&seq.to_ne_bytes());
    }

    pub fn read_sequence(&self, row: &[u8]) -> u64 {
        let off = self.sequence_offset();
        u64::from_ne_bytes(row[off..off + SEQUENCE_WIDTH].try_into().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use common_types::schema::{Builder, ColumnSchemaBuilder};

    use super::*;

    fn schema() -> Schema {
        Builder::new()
            .add_key_column(
                ColumnSchemaBuilder::new("k".to_string(), DatumKind::Int64)
                    .build()
                    .unwrap(),
            )
            .unwrap()
            .add_normal_column(
                ColumnSchemaBuilder::new("v".to_string(), DatumKind::Varchar)
                    .is_nullable(true)
                    .build()
                    .unwrap(),
            )
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn fixed_width_cell_round_trips() {
        let schema = schema();
        let layout = RowLayout::new(&schema);
        let mut row = vec![0u8; layout.row_size()];
        write_int64(layout.cell_bytes_mut(&mut row, 0), 42);
        let view = decode_cell(schema.column(0), layout.cell_bytes(&row, 0));
        assert_eq!(view, CellView::Int64(42));
    }

    #[test]
    fn null_cell_round_trips() {
        let schema = schema();
        let layout = RowLayout::new(&schema);
        let mut row = vec![0xffu8; layout.row_size()];
        write_null(layout.cell_bytes_mut(&mut row, 1));
        let view = decode_cell(schema.column(1), layout.cell_bytes(&row, 1));
        assert_eq!(view, CellView::Null);
    }

    #[test]
    fn sequence_round_trips() {
        let schema = schema();
        let layout = RowLayout::new(&schema);
        let mut row = vec![0u8; layout.row_size()];
        layout.write_sequence(&mut row, 7);
        assert_eq!(layout.read_sequence(&row), 7);
    }

    #[test]
    fn decimal_cell_round_trips() {
        let schema = Builder::new()
            .add_key_column(
                ColumnSchemaBuilder::new("k".to_string(), DatumKind::Decimal)
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
            .unwrap();
        let layout = RowLayout::new(&schema);
        let mut row = vec![0u8; layout.row_size()];
        write_decimal(layout.cell_bytes_mut(&mut row, 0), -12345);
        let view = decode_cell(schema.column(0), layout.cell_bytes(&row, 0));
        assert_eq!(view, CellView::Decimal(-12345));
    }

    #[test]
    fn bytes_descriptor_round_trips() {
        let schema = schema();
        let layout = RowLayout::new(&schema);
        let mut row = vec![0u8; layout.row_size()];
        let backing = b"hello".to_vec();
        write_bytes_descriptor(layout.cell_bytes_mut(&mut row, 1), backing.as_ptr(), 5);
        let view = decode_cell(schema.column(1), layout.cell_bytes(&row, 1));
        assert_eq!(view, CellView::Bytes(b"hello"));
    }
}
