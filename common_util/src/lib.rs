// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Small pieces of infrastructure shared by every crate in the workspace.

pub mod error;
