// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Typed values. A [`Datum`] folds nullability into the value itself
//! (`Datum::Null`) rather than carrying a separate null-indicator bit next
//! to an opaque payload pointer, so callers never need to check a flag
//! before matching on the value.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// The logical type of a column, independent of any particular value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatumKind {
    Int64,
    UInt64,
    Double,
    Boolean,
    Timestamp,
    Varchar,
    Varbinary,
    /// A fixed-point value stored as its scaled integer representation
    /// (value = `raw / 10^scale`). Ordering and `sum` both operate directly
    /// on `raw`, which is exact and scale-agnostic for columns that share a
    /// single declared scale, the way a columnar OLAP engine stores `DECIMAL`
    /// on disk rather than pulling in an arbitrary-precision decimal type.
    Decimal,
}

impl DatumKind {
    /// `Some(width)` for fixed-width types that live entirely inline in a
    /// row buffer; `None` for variable-length types, which reserve a
    /// pointer/length descriptor inline and store their bytes elsewhere in
    /// the arena.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            DatumKind::Int64 | DatumKind::UInt64 | DatumKind::Double | DatumKind::Timestamp => {
                Some(8)
            }
            DatumKind::Boolean => Some(1),
            DatumKind::Decimal => Some(16),
            DatumKind::Varchar | DatumKind::Varbinary => None,
        }
    }

    pub fn is_variable_length(self) -> bool {
        self.fixed_width().is_none()
    }
}

/// A single typed value, as delivered by the upstream tuple source.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Boolean(bool),
    Timestamp(i64),
    Varchar(String),
    Varbinary(Vec<u8>),
    /// Scaled integer representation of a fixed-point value, see
    /// [`DatumKind::Decimal`].
    Decimal(i128),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn kind(&self) -> Option<DatumKind> {
        match self {
            Datum::Null => None,
            Datum::Int64(_) => Some(DatumKind::Int64),
            Datum::UInt64(_) => Some(DatumKind::UInt64),
            Datum::Double(_) => Some(DatumKind::Double),
            Datum::Boolean(_) => Some(DatumKind::Boolean),
            Datum::Timestamp(_) => Some(DatumKind::Timestamp),
            Datum::Varchar(_) => Some(DatumKind::Varchar),
            Datum::Varbinary(_) => Some(DatumKind::Varbinary),
            Datum::Decimal(_) => Some(DatumKind::Decimal),
        }
    }

    /// Total ordering used by the key comparator: nulls sort before
    /// non-nulls, numeric types use natural order (NaN handled via
    /// `f64::total_cmp`, which is total but otherwise unspecified beyond
    /// that), strings/bytes compare lexicographically.
    pub fn cmp_total(&self, other: &Datum) -> Ordering {
        match (self, other) {
            (Datum::Null, Datum::Null) => Ordering::Equal,
            (Datum::Null, _) => Ordering::Less,
            (_, Datum::Null) => Ordering::Greater,
            (Datum::Int64(a), Datum::Int64(b)) => a.cmp(b),
            (Datum::UInt64(a), Datum::UInt64(b)) => a.cmp(b),
            (Datum::Double(a), Datum::Double(b)) => a.total_cmp(b),
            (Datum::Boolean(a), Datum::Boolean(b)) => a.cmp(b),
            (Datum::Timestamp(a), Datum::Timestamp(b)) => a.cmp(b),
            (Datum::Varchar(a), Datum::Varchar(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Datum::Varbinary(a), Datum::Varbinary(b)) => a.cmp(b),
            (Datum::Decimal(a), Datum::Decimal(b)) => a.cmp(b),
            (a, b) => panic!(
                "comparing datums of mismatched kinds ({:?} vs {:?}) is a schema/tuple mismatch",
                a.kind(),
                b.kind()
            ),
        }
    }
}
