//! Bounded read-through caches for sorted block tables.
//!
//! One [`Cache`] is owned by each store instance and shared by every table
//! reader it opens. Three namespaces, all keyed by page identity:
//!
//! - decoded **blocks** by `(page, block#)`, capacity-bounded in bytes;
//! - materialized **page indexes** (first key of every data block),
//!   capacity-bounded in entries;
//! - parsed **table metadata**, one small record per open page.
//!
//! Everything cached is derived purely from immutable files, so eviction is
//! always safe — a miss recomputes from disk. Blocks are held as shared
//! [`Bytes`], so a cached block is handed out without copying and cannot be
//! mutated by readers.

use bytes::Bytes;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use types::Key;

use crate::format::{PageId, TableMeta};

/// Least-recently-used map with a fixed entry capacity.
struct Lru<K, V> {
    map: HashMap<K, (V, u64)>,
    tick: u64,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> Lru<K, V> {
    fn new(capacity: usize) -> Self {
        Lru { map: HashMap::new(), tick: 0, capacity: capacity.max(1) }
    }

    fn get(&mut self, key: &K) -> Option<V> {
        self.tick += 1;
        let tick = self.tick;
        self.map.get_mut(key).map(|slot| {
            slot.1 = tick;
            slot.0.clone()
        })
    }

    fn insert(&mut self, key: K, value: V) {
        self.tick += 1;
        self.map.insert(key, (value, self.tick));
        while self.map.len() > self.capacity {
            if let Some(oldest) = self
                .map
                .iter()
                .min_by_key(|(_, (_, t))| *t)
                .map(|(k, _)| k.clone())
            {
                self.map.remove(&oldest);
            } else {
                break;
            }
        }
    }

    fn retain<F: FnMut(&K) -> bool>(&mut self, mut keep: F) {
        self.map.retain(|k, _| keep(k));
    }

    fn clear(&mut self) {
        self.map.clear();
    }
}

pub struct Cache {
    blocks: Mutex<Lru<(PageId, u64), Bytes>>,
    indexes: Mutex<Lru<PageId, Arc<[Key]>>>,
    metas: Mutex<HashMap<PageId, TableMeta>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Cache {
    /// `block_capacity_bytes` bounds the block namespace; `index_capacity`
    /// bounds the number of cached page indexes.
    pub fn new(block_capacity_bytes: usize, block_size: usize, index_capacity: usize) -> Self {
        let block_slots = (block_capacity_bytes / block_size.max(1)).max(1);
        Cache {
            blocks: Mutex::new(Lru::new(block_slots)),
            indexes: Mutex::new(Lru::new(index_capacity)),
            metas: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get_block(&self, id: PageId, block_no: u64) -> Option<Bytes> {
        let hit = self.blocks.lock().expect("block cache").get(&(id, block_no));
        match &hit {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        hit
    }

    pub fn put_block(&self, id: PageId, block_no: u64, block: Bytes) {
        self.blocks.lock().expect("block cache").insert((id, block_no), block);
    }

    pub fn get_index(&self, id: PageId) -> Option<Arc<[Key]>> {
        self.indexes.lock().expect("index cache").get(&id)
    }

    pub fn put_index(&self, id: PageId, index: Arc<[Key]>) {
        self.indexes.lock().expect("index cache").insert(id, index);
    }

    pub fn get_meta(&self, id: PageId) -> Option<TableMeta> {
        self.metas.lock().expect("meta cache").get(&id).copied()
    }

    pub fn put_meta(&self, id: PageId, meta: TableMeta) {
        self.metas.lock().expect("meta cache").insert(id, meta);
    }

    /// Drops every cached artifact of a page whose file was deleted.
    pub fn evict_page(&self, id: PageId) {
        self.blocks.lock().expect("block cache").retain(|(pid, _)| *pid != id);
        self.indexes.lock().expect("index cache").retain(|pid| *pid != id);
        self.metas.lock().expect("meta cache").remove(&id);
    }

    /// Empties all namespaces (store truncation).
    pub fn clear(&self) {
        self.blocks.lock().expect("block cache").clear();
        self.indexes.lock().expect("index cache").clear();
        self.metas.lock().expect("meta cache").clear();
    }

    /// `(hits, misses)` of the block namespace.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }
}
