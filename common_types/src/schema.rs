// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! The schema catalog contract: column descriptors, key column count,
//! per-column aggregation functions.

use snafu::{Backtrace, Snafu};

use crate::datum::DatumKind;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Schema must have at least one column.\nBacktrace:\n{}", backtrace))]
    NoColumns { backtrace: Backtrace },

    #[snafu(display(
        "Schema must have at least one key column.\nBacktrace:\n{}",
        backtrace
    ))]
    NoKeyColumns { backtrace: Backtrace },

    #[snafu(display(
        "Key columns must precede all normal columns, column:{}.\nBacktrace:\n{}",
        name,
        backtrace
    ))]
    KeyColumnAfterNormal { name: String, backtrace: Backtrace },

    #[snafu(display(
        "Aggregation function is only meaningful on normal columns, column:{}.\nBacktrace:\n{}",
        name,
        backtrace
    ))]
    AggregateOnKeyColumn { name: String, backtrace: Backtrace },

}

common_util::define_result!(Error);

/// The table's duplicate-handling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeysType {
    /// Duplicate keys permitted, no merging.
    Dup,
    /// A new row replaces the prior row with an equal key.
    Unique,
    /// A new row is merged column-by-column into the prior row.
    Agg,
}

/// The aggregation functions available to non-key columns of an `Agg`-keyed
/// table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Sum,
    Min,
    Max,
    Replace,
    HllUnion,
    BitmapUnion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub id: usize,
    pub name: String,
    pub data_type: DatumKind,
    pub is_key: bool,
    pub is_nullable: bool,
    pub default_aggregate: Option<AggregateFunction>,
}

/// Builds a [`ColumnSchema`] via `ColumnSchemaBuilder::new(name,
/// datum_kind).build()`.
pub struct ColumnSchemaBuilder {
    id: usize,
    name: String,
    data_type: DatumKind,
    is_key: bool,
    is_nullable: bool,
    default_aggregate: Option<AggregateFunction>,
}

impl ColumnSchemaBuilder {
    pub fn new(name: String, data_type: DatumKind) -> Self {
        Self {
            id: 0,
            name,
            data_type,
            is_key: false,
            is_nullable: false,
            default_aggregate: None,
        }
    }

    pub fn id(mut self, id: usize) -> Self {
        self.id = id;
        self
    }

    pub fn is_key(mut self, is_key: bool) -> Self {
        self.is_key = is_key;
        self
    }

    pub fn is_nullable(mut self, is_nullable: bool) -> Self {
        self.is_nullable = is_nullable;
        self
    }

    pub fn aggregate_fn(mut self, f: AggregateFunction) -> Self {
        self.default_aggregate = Some(f);
        self
    }

    pub fn build(self) -> Result<ColumnSchema> {
        if self.is_key && self.default_aggregate.is_some() {
            return AggregateOnKeyColumn { name: self.name }.fail();
        }
        Ok(ColumnSchema {
            id: self.id,
            name: self.name,
            data_type: self.data_type,
            is_key: self.is_key,
            is_nullable: self.is_nullable,
            default_aggregate: self.default_aggregate,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    columns: Vec<ColumnSchema>,
    num_key_columns: usize,
}

impl Schema {
    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_key_columns(&self) -> usize {
        self.num_key_columns
    }

    pub fn key_columns(&self) -> &[ColumnSchema] {
        &self.columns[..self.num_key_columns]
    }

    pub fn column(&self, index: usize) -> &ColumnSchema {
        &self.columns[index]
    }

    pub fn is_key_column(&self, index: usize) -> bool {
        index < self.num_key_columns
    }
}

/// Builds a [`Schema`] via `Builder::new().add_key_column(...).build()`.
pub struct Builder {
    columns: Vec<ColumnSchema>,
    num_key_columns: usize,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
            num_key_columns: 0,
        }
    }

    pub fn add_key_column(mut self, mut column: ColumnSchema) -> Result<Self> {
        if self.columns.len() != self.num_key_columns {
            return KeyColumnAfterNormal { name: column.name }.fail();
        }
        column.is_key = true;
        self.columns.push(column);
        self.num_key_columns += 1;
        Ok(self)
    }

    pub fn add_normal_column(mut self, mut column: ColumnSchema) -> Result<Self> {
        column.is_key = false;
        self.columns.push(column);
        Ok(self)
    }

    pub fn build(self) -> Result<Schema> {
        if self.columns.is_empty() {
            return NoColumns {}.fail();
        }
        if self.num_key_columns == 0 {
            return NoKeyColumns {}.fail();
        }
        Ok(Schema {
            columns: self.columns,
            num_key_columns: self.num_key_columns,
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
