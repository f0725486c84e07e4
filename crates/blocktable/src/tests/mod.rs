use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::Cache;
use crate::format::PageId;
use crate::lock::PageLocks;
use crate::reader::SortedBlockTableReader;
use crate::writer::{ClosedTable, SortedBlockTableWriter};
use types::{Key, Value};

mod cache_tests;

pub fn test_cache(block_size: usize) -> Arc<Cache> {
    Arc::new(Cache::new(64 * block_size, block_size, 16))
}

pub fn test_locks() -> Arc<PageLocks> {
    Arc::new(PageLocks::new(Duration::from_secs(5), Duration::from_secs(8)))
}

/// Writes a table from pre-sorted entries.
pub fn write_table(
    dir: &Path,
    id: PageId,
    block_size: usize,
    entries: &[(Key, Value)],
    locks: &PageLocks,
) -> ClosedTable {
    let mut w = SortedBlockTableWriter::create(dir, id, block_size, locks).unwrap();
    for (k, v) in entries {
        w.add(k, v).unwrap();
    }
    w.close().unwrap()
}

pub fn open_reader(
    dir: &Path,
    id: PageId,
    block_size: usize,
    cache: Arc<Cache>,
    locks: Arc<PageLocks>,
) -> Arc<SortedBlockTableReader> {
    Arc::new(SortedBlockTableReader::open(dir, id, block_size, cache, locks).unwrap())
}

/// `n` pre-sorted `(key{i:04}, value-of-i)` entries.
pub fn numbered_entries(n: usize) -> Vec<(Key, Value)> {
    (0..n)
        .map(|i| {
            (
                Key::primary(format!("key{:04}", i).as_bytes()),
                Value::small(format!("value-{}", i).as_bytes()),
            )
        })
        .collect()
}
