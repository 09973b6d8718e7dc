// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Schema, row and datum types shared by the storage layer: the
//! schema-catalog and tuple-source contracts the MemTable consumes.

pub mod datum;
pub mod row;
pub mod schema;
