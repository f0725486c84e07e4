use crate::*;
use config::StoreOptions;
use std::sync::Arc;
use std::time::{Duration, Instant};

mod index_tests;
mod manifest_tests;
mod read_tests;
mod write_tests;

/// Options sized so tests exercise rotation, multi-block tables, and
/// compaction with small data sets.
pub fn small_opts() -> StoreOptions {
    StoreOptions {
        max_memtable_size: 512,
        block_size: 4096,
        max_key_size: 256,
        max_small_value_size: 1024,
        max_sorted_block_table_size: 16 * 1024,
        journal_sync: false,
        compaction_tick: Duration::from_millis(20),
        ..StoreOptions::default()
    }
}

/// Same, but with compaction effectively disabled so level 0 accumulates.
pub fn no_compaction_opts() -> StoreOptions {
    StoreOptions { level_zero_page_limit: 1000, ..small_opts() }
}

pub fn wait_until(what: &str, timeout: Duration, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {}", what);
}

pub fn collect_keys(store: &Store) -> Vec<Vec<u8>> {
    store
        .enumerate()
        .unwrap()
        .map(|e| e.unwrap().0.to_vec())
        .collect()
}
