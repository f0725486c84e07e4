//! K-way merge over sorted entry streams.
//!
//! The merge primitive behind both compaction and whole-store enumeration.
//! Sources are ordered by priority: index 0 is the newest data (e.g. the
//! active memtable snapshot, or the highest-version level-0 page). When the
//! same key appears in several sources, only the occurrence from the
//! highest-priority source is emitted — newest version wins; the shadowed
//! duplicates are consumed and dropped.

use anyhow::Result;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use types::{Key, Value};

/// A sorted stream of key/value pairs.
pub type EntrySource = Box<dyn Iterator<Item = Result<(Key, Value)>> + Send>;

struct HeapEntry {
    key: Key,
    value: Value,
    /// Index into the source list; lower = newer data.
    priority: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.priority == other.priority
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse to pop the smallest key first.
        // On equal keys the lower-priority-index (newer) source pops first.
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.priority.cmp(&self.priority))
    }
}

/// Merges N sorted sources into one sorted, deduplicated stream.
pub struct MergeIterator {
    sources: Vec<EntrySource>,
    heap: BinaryHeap<HeapEntry>,
}

impl std::fmt::Debug for MergeIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeIterator")
            .field("sources", &self.sources.len())
            .field("heap", &self.heap.len())
            .finish()
    }
}

impl MergeIterator {
    /// `sources` in priority order, newest first. Each must yield keys in
    /// strictly ascending order.
    pub fn new(sources: Vec<EntrySource>) -> Result<Self> {
        let mut merge = MergeIterator { sources, heap: BinaryHeap::new() };
        for i in 0..merge.sources.len() {
            merge.advance(i)?;
        }
        Ok(merge)
    }

    fn advance(&mut self, priority: usize) -> Result<()> {
        if let Some(item) = self.sources[priority].next() {
            let (key, value) = item?;
            self.heap.push(HeapEntry { key, value, priority });
        }
        Ok(())
    }

    /// Pops the next entry in key order. Duplicates of that key from
    /// lower-priority sources are drained and discarded.
    pub fn next_entry(&mut self) -> Result<Option<(Key, Value)>> {
        let Some(top) = self.heap.pop() else {
            return Ok(None);
        };
        self.advance(top.priority)?;

        while let Some(peek) = self.heap.peek() {
            if peek.key != top.key {
                break;
            }
            let dup = self.heap.pop().expect("peeked entry");
            self.advance(dup.priority)?;
        }

        Ok(Some((top.key, top.value)))
    }
}

impl Iterator for MergeIterator {
    type Item = Result<(Key, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
