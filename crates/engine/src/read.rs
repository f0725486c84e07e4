//! Read path: point lookups, whole-store enumeration, and diagnostics.
//!
//! A lookup consults, in order: the current memtable, the rotated memtable
//! if one is mid-flush (captured once — the background flush may clear the
//! slot concurrently), the manifest snapshot's level-0 pages newest version
//! first, and finally the single range-matching page per level ≥ 1. The
//! snapshot guard keeps every page file alive for the whole operation even
//! if compaction retires it mid-lookup; the rotated memtable must be
//! checked before disk because its data may not be in any manifest page
//! yet.

use anyhow::{anyhow, bail, ensure, Result};
use bytes::Bytes;
use std::sync::Arc;

use blocktable::{EntrySource, MergeIterator, PageId, SortedBlockTableReader};
use types::{Key, Value, ValueFlag};

use crate::manifest::{ManifestSnapshot, PageRecord};
use crate::{Store, StoreShared};

impl Store {
    /// Looks up the live value for `key`, reassembling multi-part values.
    /// Returns `None` for never-written and deleted keys alike.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.shared.check_open()?;
        self.shared.check_key(key)?;
        let primary = Key::primary(key);
        let Some(value) = self.shared.internal_get(&primary)? else {
            return Ok(None);
        };
        match value.flag() {
            Some(ValueFlag::Deleted) | Some(ValueFlag::Null) => Ok(None),
            Some(ValueFlag::SmallValue) => Ok(Some(value.payload_bytes())),
            Some(ValueFlag::LargeValueDescriptor) => {
                self.shared.assemble_large(&primary, &value).map(Some)
            }
            Some(ValueFlag::LargeValueChunk) => bail!(
                "corrupt record for key {:?}: chunk stored at sequence 0",
                primary
            ),
            None => bail!("corrupt record for key {:?}: unknown value flag", primary),
        }
    }

    /// Ordered stream of all live `(key, value)` pairs.
    pub fn enumerate(&self) -> Result<StoreIterator> {
        self.shared.check_open()?;
        self.shared.enumerate_from_key(None)
    }

    /// Ordered stream of all live `(key, value)` pairs with key ≥ `start`.
    pub fn enumerate_from(&self, start: &[u8]) -> Result<StoreIterator> {
        self.shared.check_open()?;
        self.shared.enumerate_from_key(Some(Key::primary(start)))
    }

    /// Walks every page verifying record order and parseability. Slower
    /// than regular reads, by design; problems are collected, not thrown.
    pub fn scan_check(&self) -> Result<ScanReport> {
        self.shared.check_open()?;
        let snapshot = self.shared.manifest.latest();
        let mut report = ScanReport::default();
        for page in snapshot.all_pages() {
            match self.shared.check_page(page) {
                Ok(records) => {
                    report.pages += 1;
                    report.records += records;
                }
                Err(e) => report.problems.push(format!("page {}: {:#}", page.id(), e)),
            }
        }
        Ok(report)
    }
}

/// Outcome of [`Store::scan_check`].
#[derive(Debug, Default)]
pub struct ScanReport {
    pub pages: usize,
    pub records: u64,
    pub problems: Vec<String>,
}

impl ScanReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

impl StoreShared {
    pub(crate) fn open_reader(&self, id: PageId) -> Result<SortedBlockTableReader> {
        SortedBlockTableReader::open(
            &self.dir,
            id,
            self.opts.block_size,
            Arc::clone(&self.cache),
            Arc::clone(&self.locks),
        )
    }

    /// Raw lookup of one internal key, first occurrence wins. Tombstones
    /// are returned as values; the caller interprets the flag.
    pub(crate) fn internal_get(&self, key: &Key) -> Result<Option<Value>> {
        // 1. current memtable
        if let Some(value) = self.current_table().lookup(key) {
            return Ok(Some(value));
        }

        // 2. rotated memtable, captured once against the concurrent clear
        let rotated = self.rotated.lock().expect("rotated slot").clone();
        if let Some(rotated) = rotated {
            if let Some(value) = rotated.lookup(key) {
                return Ok(Some(value));
            }
        }

        let snapshot = self.manifest.latest();

        // 3. level 0 may hold overlapping ranges: newest version first
        let mut level0: Vec<&Arc<PageRecord>> =
            snapshot.pages(0).iter().filter(|p| p.contains(key)).collect();
        level0.sort_by(|a, b| b.version().cmp(&a.version()));
        for page in level0 {
            let reader = self.open_reader(page.id())?;
            if let Some(value) = reader.lookup(key)? {
                return Ok(Some(value));
            }
        }

        // 4. levels ≥ 1 are non-overlapping: at most one candidate each
        for level in 1..snapshot.level_count() as u32 {
            if let Some(page) = snapshot.find_page(level, key) {
                let reader = self.open_reader(page.id())?;
                if let Some(value) = reader.lookup(key)? {
                    return Ok(Some(value));
                }
            }
        }

        Ok(None)
    }

    /// Reassembles a multi-part value from its descriptor: chunks live at
    /// sequence 1..N of the same user key. A missing chunk is a named
    /// corruption error, never a silent short read.
    pub(crate) fn assemble_large(&self, key: &Key, descriptor: &Value) -> Result<Bytes> {
        let total = descriptor
            .descriptor_len()
            .ok_or_else(|| anyhow!("corrupt large-value descriptor for key {:?}", key))?
            as usize;

        let mut out = Vec::with_capacity(total);
        let mut seq: u16 = 1;
        while out.len() < total {
            ensure!(
                seq <= u8::MAX as u16,
                "large value for key {:?} is missing data past chunk {}",
                key,
                seq - 1
            );
            let chunk_key = key.with_seq(seq as u8);
            let chunk = self
                .internal_get(&chunk_key)?
                .ok_or_else(|| anyhow!("large value for key {:?} is missing chunk {}", key, seq))?;
            ensure!(
                chunk.flag() == Some(ValueFlag::LargeValueChunk),
                "large value for key {:?}: record at chunk {} has the wrong flag",
                key,
                seq
            );
            out.extend_from_slice(chunk.payload());
            seq += 1;
        }
        ensure!(
            out.len() == total,
            "large value for key {:?}: reassembled {} bytes, descriptor says {}",
            key,
            out.len(),
            total
        );
        Ok(Bytes::from(out))
    }

    /// Builds the whole-store merged enumeration. Priority order: current
    /// memtable, rotated memtable, level-0 pages newest first, then each
    /// deeper level — the same newest-wins ordering the read path uses.
    pub(crate) fn enumerate_from_key(&self, start: Option<Key>) -> Result<StoreIterator> {
        let mut sources: Vec<EntrySource> = Vec::new();

        let mem_source = |snap: memtable::MemTableSnapshot, start: Option<Key>| -> EntrySource {
            match start {
                None => Box::new(snap.into_entries().map(Ok)),
                Some(start) => {
                    Box::new(snap.into_entries().skip_while(move |(k, _)| *k < start).map(Ok))
                }
            }
        };

        // memtables are captured before the manifest snapshot: a rotation
        // completing in between would otherwise leave its generation in
        // neither source
        sources.push(mem_source(self.current_table().snapshot(), start.clone()));
        let rotated = self.rotated.lock().expect("rotated slot").clone();
        if let Some(rotated) = rotated {
            sources.push(mem_source(rotated.snapshot(), start.clone()));
        }
        let snapshot = self.manifest.latest();

        let mut level0: Vec<&Arc<PageRecord>> = snapshot.pages(0).iter().collect();
        level0.sort_by(|a, b| b.version().cmp(&a.version()));
        for page in level0 {
            let reader = Arc::new(self.open_reader(page.id())?);
            sources.push(Box::new(reader.enumerate_from(start.as_ref())?));
        }
        for level in 1..snapshot.level_count() as u32 {
            for page in snapshot.pages(level) {
                let reader = Arc::new(self.open_reader(page.id())?);
                sources.push(Box::new(reader.enumerate_from(start.as_ref())?));
            }
        }

        Ok(StoreIterator {
            merge: MergeIterator::new(sources)?,
            _snapshot: snapshot,
            done: false,
        })
    }

    fn check_page(&self, page: &Arc<PageRecord>) -> Result<u64> {
        let reader = Arc::new(self.open_reader(page.id())?);
        let mut records = 0u64;
        let mut previous: Option<Key> = None;
        for entry in reader.enumerate()? {
            let (key, value) = entry?;
            if let Some(prev) = &previous {
                ensure!(*prev < key, "keys out of order at {:?}", key);
            }
            ensure!(value.flag().is_some(), "unknown value flag at {:?}", key);
            ensure!(
                page.contains(&key),
                "key {:?} outside the page's recorded range",
                key
            );
            previous = Some(key);
            records += 1;
        }
        ensure!(records > 0, "page enumerates no records");
        Ok(records)
    }
}

/// Merged, deduplicated stream of live user `(key, value)` pairs.
///
/// Holds one manifest snapshot for its whole lifetime, so every page it
/// reads stays on disk even while compaction replaces it. Tombstones and
/// chunk records are consumed internally; multi-part values come back
/// reassembled.
pub struct StoreIterator {
    merge: MergeIterator,
    _snapshot: ManifestSnapshot,
    done: bool,
}

impl StoreIterator {
    fn step(&mut self) -> Result<Option<(Bytes, Bytes)>> {
        loop {
            let Some((key, value)) = self.merge.next_entry()? else {
                return Ok(None);
            };
            // chunks without a preceding descriptor are stale leftovers of
            // an overwritten large value; the merge order guarantees a live
            // descriptor always precedes its chunks
            if key.seq() != 0 {
                continue;
            }
            match value.flag() {
                Some(ValueFlag::Deleted) => continue,
                Some(ValueFlag::SmallValue) => {
                    return Ok(Some((
                        Bytes::copy_from_slice(key.user_key()),
                        value.payload_bytes(),
                    )))
                }
                Some(ValueFlag::LargeValueDescriptor) => {
                    let assembled = self.assemble_from_stream(&key, &value)?;
                    return Ok(Some((Bytes::copy_from_slice(key.user_key()), assembled)));
                }
                Some(ValueFlag::Null) | Some(ValueFlag::LargeValueChunk) | None => {
                    bail!("corrupt record for key {:?} during enumeration", key)
                }
            }
        }
    }

    /// Chunks sort immediately after their descriptor, so they are simply
    /// the next entries of the merged stream.
    fn assemble_from_stream(&mut self, key: &Key, descriptor: &Value) -> Result<Bytes> {
        let total = descriptor
            .descriptor_len()
            .ok_or_else(|| anyhow!("corrupt large-value descriptor for key {:?}", key))?
            as usize;
        let mut out = Vec::with_capacity(total);
        let mut seq: u8 = 1;
        while out.len() < total {
            let entry = self.merge.next_entry()?;
            let valid = entry.as_ref().map_or(false, |(k, v)| {
                k.user_key() == key.user_key()
                    && k.seq() == seq
                    && v.flag() == Some(ValueFlag::LargeValueChunk)
            });
            let Some((_, chunk)) = entry.filter(|_| valid) else {
                bail!("large value for key {:?} is missing chunk {}", key, seq);
            };
            out.extend_from_slice(chunk.payload());
            seq = seq
                .checked_add(1)
                .ok_or_else(|| anyhow!("large value for key {:?} overruns its chunks", key))?;
        }
        ensure!(
            out.len() == total,
            "large value for key {:?}: reassembled {} bytes, descriptor says {}",
            key,
            out.len(),
            total
        );
        Ok(Bytes::from(out))
    }
}

impl Iterator for StoreIterator {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
