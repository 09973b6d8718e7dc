// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Process-global flush metrics, registered once via `lazy_static!`: a sink
//! every MemTable instance shares, not part of any single instance's own
//! state.

use lazy_static::lazy_static;
use prometheus::{register_int_counter, IntCounter};

lazy_static! {
    /// Incremented by 1 per successful `MemTable::flush()`.
    pub static ref MEMTABLE_FLUSH_TOTAL: IntCounter = register_int_counter!(
        "memtable_flush_total",
        "Number of successful memtable flushes"
    )
    .unwrap();
    /// Incremented by the elapsed flush duration, in microseconds, once per
    /// successful `MemTable::flush()`. A plain counter rather than a
    /// histogram: the name is fixed for compatibility and a histogram would
    /// split it into `_bucket`/`_sum`/`_count` series instead.
    pub static ref MEMTABLE_FLUSH_DURATION_US: IntCounter = register_int_counter!(
        "memtable_flush_duration_us",
        "Cumulative wall-clock duration of memtable flushes, in microseconds"
    )
    .unwrap();
}
