//! Store configuration.
//!
//! Every tunable lives in [`StoreOptions`] and is threaded through
//! constructors explicitly; there is no process-wide configuration state.

use std::time::Duration;

/// Upper bound on large-value chunk count: the sequence byte reserves 0 for
/// the descriptor, leaving 1..=255 for chunks.
pub const MAX_LARGE_VALUE_CHUNKS: usize = 255;

/// All engine tunables, with production defaults.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Memtable byte-size threshold (`Σ key + value` including tombstones)
    /// past which the memtable reports full and a rotation is triggered.
    pub max_memtable_size: usize,

    /// Fixed size of every block in a sorted block table file. Writer and
    /// reader must agree on this value; it is not recorded in the file.
    pub block_size: usize,

    /// Soft ceiling on the size of a single sorted block table produced by
    /// compaction; merge output rolls over to a new page past this.
    pub max_sorted_block_table_size: u64,

    /// Number of level-0 pages that triggers a merge into level 1.
    pub level_zero_page_limit: usize,

    /// Manifest snapshots appended before the manifest file is rewritten
    /// compactly.
    pub manifest_version_count: usize,

    /// Maximum user key size accepted by the write path.
    pub max_key_size: usize,

    /// Values up to this size are stored as a single record; larger values
    /// are split into a descriptor plus numbered chunks of this size.
    pub max_small_value_size: usize,

    /// Block cache capacity in bytes.
    pub block_cache_capacity: usize,

    /// Page-index cache capacity in entries (one entry per open page).
    pub index_cache_capacity: usize,

    /// Every journal append is followed by fsync when set.
    pub journal_sync: bool,

    /// Bound on acquiring a page read lock; exceeding it is a fatal error.
    pub read_lock_timeout: Duration,

    /// Bound on acquiring a page write lock; exceeding it is a fatal error.
    pub write_lock_timeout: Duration,

    /// Bound on waiting for an in-flight rotation (close and rotation
    /// handoff); exceeding it is a fatal error.
    pub rotation_wait_timeout: Duration,

    /// Fallback wake interval for the compaction thread when no flush has
    /// signalled it.
    pub compaction_tick: Duration,

    /// Bounded internal retries of the add/rotation race before surfacing
    /// an operational error.
    pub write_retry_limit: usize,
}

impl StoreOptions {
    /// Page-count ceiling per level: fixed at level 0, then growing
    /// exponentially (10^level) to give the levelled fan-out shape.
    pub fn max_pages_on_level(&self, level: u32) -> usize {
        if level == 0 {
            self.level_zero_page_limit
        } else {
            10usize.saturating_pow(level)
        }
    }

    /// Largest value accepted by the write path: one full-size chunk per
    /// available sequence number.
    pub fn max_large_value_size(&self) -> usize {
        self.max_small_value_size * MAX_LARGE_VALUE_CHUNKS
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            max_memtable_size: 1024 * 1024,
            block_size: 32 * 1024,
            max_sorted_block_table_size: 2 * 1024 * 1024,
            level_zero_page_limit: 4,
            manifest_version_count: 1000,
            max_key_size: 4 * 1024,
            max_small_value_size: 24 * 1024,
            block_cache_capacity: 8 * 1024 * 1024,
            index_cache_capacity: 64,
            journal_sync: true,
            read_lock_timeout: Duration::from_secs(5),
            write_lock_timeout: Duration::from_secs(8),
            rotation_wait_timeout: Duration::from_secs(30),
            compaction_tick: Duration::from_millis(250),
            write_retry_limit: 10,
        }
    }
}
