//! # Engine — LSM key-value store orchestration
//!
//! Ties the [`journal`], [`memtable`], and [`blocktable`] crates into a
//! complete log-structured merge-tree store.
//!
//! ```text
//! Client
//!   |
//!   v
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          STORE                              │
//! │                                                             │
//! │ write.rs → journal append → memtable insert                 │
//! │              |                                              │
//! │              |  (memtable full?)                            │
//! │              v                                              │
//! │        rotation → background flush → level-0 page           │
//! │              |                                              │
//! │              |  (level overflow?)                           │
//! │              v                                              │
//! │   table manager thread → merge → level N+1 pages            │
//! │                                                             │
//! │ read.rs → memtable → rotated memtable → manifest snapshot:  │
//! │           L0 newest-version-first → one page per level ≥ 1  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reads run lock-free against a reference-counted manifest snapshot, so a
//! concurrent compaction can retire the pages a reader is using without
//! ever pulling files out from under it. Writes go to the journal before
//! the memtable; rotation hands the frozen generation to a background
//! flush while writers continue into the new one.

mod compaction;
mod index;
mod journaled;
mod manifest;
mod read;
mod recovery;
mod write;

use anyhow::{ensure, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use blocktable::{Cache, PageLocks};
use config::StoreOptions;
use journaled::JournaledMemTable;

pub use manifest::{Manifest, ManifestImmutable, ManifestSnapshot, PageRecord, MANIFEST_FILE};
pub use read::{ScanReport, StoreIterator};

use compaction::{CompactionSignal, TableManager};

/// Single-flight gate around memtable rotation: at most one frozen
/// generation is ever mid-flush, and `close()` can wait for it.
pub(crate) struct RotationGate {
    in_flight: Mutex<bool>,
    cond: Condvar,
}

impl RotationGate {
    fn new() -> Self {
        RotationGate { in_flight: Mutex::new(false), cond: Condvar::new() }
    }

    /// Claims the gate, waiting at most `timeout` for a previous rotation
    /// to finish. Timing out is a fatal operational error, not a retry.
    pub(crate) fn begin(&self, timeout: Duration) -> Result<()> {
        let mut in_flight = self.wait_until_idle(timeout, "starting a rotation")?;
        *in_flight = true;
        Ok(())
    }

    pub(crate) fn end(&self) {
        *self.in_flight.lock().expect("rotation gate") = false;
        self.cond.notify_all();
    }

    pub(crate) fn wait_idle(&self, timeout: Duration) -> Result<()> {
        self.wait_until_idle(timeout, "waiting for the in-flight rotation")?;
        Ok(())
    }

    fn wait_until_idle<'a>(
        &'a self,
        timeout: Duration,
        what: &str,
    ) -> Result<std::sync::MutexGuard<'a, bool>> {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self.in_flight.lock().expect("rotation gate");
        while *in_flight {
            let now = Instant::now();
            ensure!(now < deadline, "timed out after {:?} {}", timeout, what);
            let (next, _) = self
                .cond
                .wait_timeout(in_flight, deadline - now)
                .expect("rotation gate");
            in_flight = next;
        }
        Ok(in_flight)
    }
}

pub(crate) struct StoreShared {
    dir: PathBuf,
    opts: StoreOptions,
    manifest: Manifest,
    cache: Arc<Cache>,
    locks: Arc<PageLocks>,
    /// The active generation; swapped atomically under the write lock so
    /// readers never observe a torn pointer.
    current: RwLock<Arc<JournaledMemTable>>,
    /// The frozen generation currently being flushed, if any.
    rotated: Mutex<Option<Arc<JournaledMemTable>>>,
    /// Serializes the full-check/swap sequence (double-checked fullness).
    rotation_lock: Mutex<()>,
    rotation: RotationGate,
    compaction: CompactionSignal,
    closed: AtomicBool,
}

impl StoreShared {
    pub(crate) fn current_table(&self) -> Arc<JournaledMemTable> {
        Arc::clone(&self.current.read().expect("current memtable pointer"))
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        ensure!(!self.closed.load(Ordering::SeqCst), "store is closed");
        Ok(())
    }
}

/// Snapshot of store shape for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub memtable_entries: usize,
    pub memtable_size: usize,
    pub rotation_pending: bool,
    /// `(level, page count)` for every level the store has touched.
    pub levels: Vec<(u32, usize)>,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// An embedded, multi-thread-safe LSM key-value store rooted at one
/// directory.
pub struct Store {
    shared: Arc<StoreShared>,
    table_manager: TableManager,
    /// Lazily opened secondary-index stores, one nested directory each.
    indexes: Mutex<HashMap<String, Arc<Store>>>,
}

impl Store {
    /// Opens (or creates) the store in `dir`, replaying any crash state:
    /// leftover temp files are removed, an interrupted rotation is flushed
    /// synchronously, and the active generation's journal is replayed into
    /// the fresh memtable.
    pub fn open(dir: impl AsRef<Path>, opts: StoreOptions) -> Result<Store> {
        let dir = dir.as_ref().to_path_buf();
        ensure!(
            opts.max_key_size + opts.max_small_value_size + 64 <= opts.block_size,
            "block size {} cannot hold a maximal record (key {} + value {})",
            opts.block_size,
            opts.max_key_size,
            opts.max_small_value_size
        );
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating store directory {}", dir.display()))?;

        let cache = Arc::new(Cache::new(
            opts.block_cache_capacity,
            opts.block_size,
            opts.index_cache_capacity,
        ));
        let locks = Arc::new(PageLocks::new(opts.read_lock_timeout, opts.write_lock_timeout));
        let manifest = Manifest::open(&dir, &opts, Arc::clone(&cache), Arc::clone(&locks))?;

        recovery::cleanup_tmp_files(&dir);
        recovery::recover_incomplete_rotation(&dir, &opts, &manifest, &locks)?;

        let current =
            JournaledMemTable::create(&dir, manifest.current_version(0), &opts)?;

        let shared = Arc::new(StoreShared {
            dir,
            opts,
            manifest,
            cache,
            locks,
            current: RwLock::new(Arc::new(current)),
            rotated: Mutex::new(None),
            rotation_lock: Mutex::new(()),
            rotation: RotationGate::new(),
            compaction: CompactionSignal::new(),
            closed: AtomicBool::new(false),
        });

        let table_manager = TableManager::start(Arc::clone(&shared));
        log::info!(
            "store opened at {} (generation {}, {} pages)",
            shared.dir.display(),
            shared.current_table().version(),
            shared.manifest.current().total_pages()
        );
        Ok(Store { shared, table_manager, indexes: Mutex::new(HashMap::new()) })
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    pub fn options(&self) -> &StoreOptions {
        &self.shared.opts
    }

    /// Forces the current memtable to rotate and waits for its background
    /// flush to finish. A no-op on an empty memtable.
    pub fn flush(&self) -> Result<()> {
        self.shared.check_open()?;
        if self.shared.current_table().is_empty() {
            return Ok(());
        }
        self.shared.rotate(true)?;
        self.shared.rotation.wait_idle(self.shared.opts.rotation_wait_timeout)
    }

    /// Shuts the store down: waits (bounded) for an in-flight rotation so
    /// it is never silently dropped, stops the table manager, and closes
    /// the active journal. Unflushed memtable contents stay recoverable
    /// through the journal.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared
            .rotation
            .wait_idle(self.shared.opts.rotation_wait_timeout)
            .context("closing the store")?;
        self.table_manager.stop();
        self.shared.current_table().close_journal()?;
        for (_, store) in self.indexes.lock().expect("index stores").drain() {
            store.close()?;
        }
        log::info!("store closed at {}", self.shared.dir.display());
        Ok(())
    }

    /// Wipes every file of the store (indexes included) and resets it to
    /// the empty state, keeping the instance usable.
    pub fn truncate(&self) -> Result<()> {
        self.shared.check_open()?;
        self.shared
            .rotation
            .wait_idle(self.shared.opts.rotation_wait_timeout)
            .context("truncating the store")?;
        self.table_manager.stop();

        for (_, store) in self.indexes.lock().expect("index stores").drain() {
            store.close()?;
        }
        self.shared.current_table().close_journal()?;
        *self.shared.rotated.lock().expect("rotated slot") = None;

        // releases every page, deleting the .sbt files
        self.shared.manifest.reset()?;

        for entry in std::fs::read_dir(&self.shared.dir)? {
            let path = entry?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else if path.extension().map_or(false, |e| e == "jf" || e == "tmp") {
                std::fs::remove_file(&path)?;
            }
        }
        self.shared.cache.clear();

        let fresh = JournaledMemTable::create(
            &self.shared.dir,
            self.shared.manifest.current_version(0),
            &self.shared.opts,
        )?;
        *self.shared.current.write().expect("current memtable pointer") = Arc::new(fresh);

        self.table_manager.restart();
        log::info!("store truncated at {}", self.shared.dir.display());
        Ok(())
    }

    pub fn stats(&self) -> StoreStats {
        let current = self.shared.current_table();
        let manifest = self.shared.manifest.current();
        let (cache_hits, cache_misses) = self.shared.cache.stats();
        StoreStats {
            memtable_entries: current.len(),
            memtable_size: current.size(),
            rotation_pending: self.shared.rotated.lock().expect("rotated slot").is_some(),
            levels: (0..manifest.level_count() as u32)
                .map(|l| (l, manifest.page_count(l)))
                .collect(),
            cache_hits,
            cache_misses,
        }
    }

    /// Page count at one level; mainly for tests and diagnostics.
    pub fn page_count(&self, level: u32) -> usize {
        self.shared.manifest.page_count(level)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Store")
            .field("dir", &self.shared.dir)
            .field("memtable_entries", &stats.memtable_entries)
            .field("memtable_size", &stats.memtable_size)
            .field("rotation_pending", &stats.rotation_pending)
            .field("levels", &stats.levels)
            .finish()
    }
}

/// Best-effort close on drop. Data is safe regardless — everything
/// unflushed is in the journal — but this releases the background thread
/// and file handles promptly.
impl Drop for Store {
    fn drop(&mut self) {
        if !self.shared.closed.load(Ordering::SeqCst) {
            if let Err(e) = self.close() {
                log::warn!("store drop: close failed: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests;
