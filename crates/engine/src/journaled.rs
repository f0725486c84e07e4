//! One memtable paired with one journal under a shared generation version.
//!
//! Write-ahead order is journal first, memtable second: if the journal
//! refuses the append (it is closing for rotation), the memtable is left
//! untouched and the caller retries against the successor generation. The
//! journal is therefore always a superset of the memtable, which is the
//! whole crash-recovery invariant.

use anyhow::Result;
use std::path::Path;
use std::sync::RwLock;

use blocktable::{ClosedTable, PageId, PageLocks, SortedBlockTableWriter};
use config::StoreOptions;
use journal::{journal_path, JournalReader, JournalWriter};
use memtable::{MemTable, MemTableSnapshot};
use types::{Key, Value};

pub(crate) struct JournaledMemTable {
    version: u64,
    mem: MemTable,
    journal: JournalWriter,
    /// Adds hold this shared; freezing holds it exclusive, so a snapshot
    /// never misses a record that reached the journal but not yet the
    /// memtable.
    freeze: RwLock<()>,
}

impl JournaledMemTable {
    /// Starts generation `version`. If a journal for it already exists (a
    /// previous run's in-flight generation), its records are replayed into
    /// the fresh memtable and the journal is reopened in append mode.
    pub fn create(dir: &Path, version: u64, opts: &StoreOptions) -> Result<Self> {
        let mem = MemTable::new(opts.max_memtable_size);
        let journal = if journal_path(dir, version).exists() {
            let mut reader = JournalReader::open(dir, version)?;
            let valid_bytes = reader.replay(|k, v| mem.add(k, v))?;
            drop(reader);
            // discard a torn tail so resumed appends stay replayable
            journal::truncate_journal(dir, version, valid_bytes)?;
            log::debug!("resumed generation {} ({} journaled entries)", version, mem.len());
            JournalWriter::resume(dir, version, opts.journal_sync)?
        } else {
            JournalWriter::create(dir, version, opts.journal_sync)?
        };
        Ok(JournaledMemTable { version, mem, journal, freeze: RwLock::new(()) })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Journal-first write. `Ok(false)` means the journal has been closed
    /// by a rotation; nothing was written anywhere and the caller must
    /// retry on the new generation.
    pub fn add(&self, key: Key, value: Value) -> Result<bool> {
        let _shared = self.freeze.read().expect("freeze gate");
        if !self.journal.add(&key, &value)? {
            return Ok(false);
        }
        self.mem.add(key, value);
        Ok(true)
    }

    pub fn lookup(&self, key: &Key) -> Option<Value> {
        self.mem.lookup(key)
    }

    pub fn full(&self) -> bool {
        self.mem.full()
    }

    pub fn size(&self) -> usize {
        self.mem.size()
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    pub fn snapshot(&self) -> MemTableSnapshot {
        self.mem.snapshot()
    }

    pub fn close_journal(&self) -> Result<()> {
        let _exclusive = self.freeze.write().expect("freeze gate");
        self.journal.close()?;
        Ok(())
    }

    /// Freezes this generation and serializes it to its level-0 page.
    ///
    /// Sequence: close the journal (new writers now fail over to the next
    /// generation), then write the table. Returns `None` for an empty
    /// generation. The caller registers the page in the manifest and only
    /// then deletes the journal file — a crash anywhere in between is safe
    /// because recovery just replays the journal again and pages are
    /// additive.
    pub fn write_to_table(
        &self,
        dir: &Path,
        block_size: usize,
        locks: &PageLocks,
    ) -> Result<Option<ClosedTable>> {
        let snapshot = {
            let _exclusive = self.freeze.write().expect("freeze gate");
            self.journal.close()?;
            self.mem.snapshot()
        };
        if snapshot.is_empty() {
            return Ok(None);
        }

        let mut writer =
            SortedBlockTableWriter::create(dir, PageId::new(0, self.version), block_size, locks)?;
        for (key, value) in snapshot.iter() {
            writer.add(key, value)?;
        }
        Ok(Some(writer.close()?))
    }
}
