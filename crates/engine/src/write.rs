//! Write path: `set`, `delete`, large-value splitting, and the rotation
//! protocol.
//!
//! Every mutation becomes a journal-first append to the current generation.
//! When the memtable fills, the generation is frozen and handed to a
//! background flush while writers continue into a brand-new generation; a
//! writer that races the closing journal simply retries against the new
//! pointer, a bounded number of times.

use anyhow::{bail, ensure, Result};
use std::mem;
use std::sync::Arc;
use std::thread;

use types::{Key, Value};

use crate::journaled::JournaledMemTable;
use crate::{Store, StoreShared};

impl Store {
    /// Inserts or overwrites a key-value pair.
    ///
    /// Values above `max_small_value_size` are split into a descriptor
    /// record plus numbered chunk records; values above the large-value
    /// ceiling are rejected before anything is written.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.shared.check_open()?;
        self.shared.check_key(key)?;
        if value.len() > self.shared.opts.max_small_value_size {
            return self.set_large(key, value);
        }
        self.shared.internal_set(Key::primary(key), Value::small(value))
    }

    /// Deletes a key by writing a tombstone; older versions stay shadowed
    /// until compaction retires them.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.shared.check_open()?;
        self.shared.check_key(key)?;
        self.shared.internal_set(Key::primary(key), Value::tombstone())
    }

    /// Splits a large value into chunks at sequence 1..N, then writes the
    /// descriptor at sequence 0. The descriptor goes last: a crash
    /// mid-split leaves orphan chunks that no read will ever surface.
    fn set_large(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let max = self.shared.opts.max_large_value_size();
        ensure!(
            value.len() <= max,
            "value too large: {} bytes (max {} = {} chunks of {})",
            value.len(),
            max,
            config::MAX_LARGE_VALUE_CHUNKS,
            self.shared.opts.max_small_value_size
        );

        for (i, chunk) in value.chunks(self.shared.opts.max_small_value_size).enumerate() {
            let seq = (i + 1) as u8;
            self.shared.internal_set(Key::new(key, seq), Value::large_chunk(chunk))?;
        }
        self.shared
            .internal_set(Key::primary(key), Value::large_descriptor(value.len() as u32))
    }
}

impl StoreShared {
    pub(crate) fn check_key(&self, key: &[u8]) -> Result<()> {
        ensure!(!key.is_empty(), "key must not be empty");
        ensure!(
            key.len() <= self.opts.max_key_size,
            "key too large: {} bytes (max {})",
            key.len(),
            self.opts.max_key_size
        );
        Ok(())
    }

    /// Routes one record into the current generation, retrying the narrow
    /// window where the journal is closing for rotation.
    pub(crate) fn internal_set(self: &Arc<Self>, key: Key, value: Value) -> Result<()> {
        let mut attempts = 0;
        loop {
            let current = self.current_table();
            if current.add(key.clone(), value.clone())? {
                if current.full() {
                    self.rotate(false)?;
                }
                return Ok(());
            }

            attempts += 1;
            if attempts >= self.opts.write_retry_limit {
                bail!(
                    "write retries exhausted ({}) racing a memtable rotation",
                    self.opts.write_retry_limit
                );
            }
            thread::yield_now();
        }
    }

    /// Freezes the current generation and swaps in a new one.
    ///
    /// Fullness is re-checked under the rotation lock (another writer may
    /// have rotated first); the gate then guarantees a single in-flight
    /// flush. The pointer swap happens under the write lock, so concurrent
    /// readers and writers always observe either the old or the new
    /// generation, never anything in between.
    pub(crate) fn rotate(self: &Arc<Self>, force: bool) -> Result<()> {
        let _serial = self.rotation_lock.lock().expect("rotation lock");

        let current = self.current_table();
        if !force && !current.full() {
            return Ok(());
        }
        if current.is_empty() {
            return Ok(());
        }

        self.rotation.begin(self.opts.rotation_wait_timeout)?;

        let rotated = match self.swap_in_new_generation() {
            Ok(old) => old,
            Err(e) => {
                self.rotation.end();
                return Err(e);
            }
        };
        *self.rotated.lock().expect("rotated slot") = Some(Arc::clone(&rotated));
        log::debug!(
            "rotated generation {} ({} bytes) for background flush",
            rotated.version(),
            rotated.size()
        );

        let shared = Arc::clone(self);
        thread::spawn(move || {
            match shared.flush_rotated(&rotated) {
                Ok(()) => {
                    *shared.rotated.lock().expect("rotated slot") = None;
                }
                Err(e) => {
                    // Keep the rotated table visible to readers; its
                    // journal is still on disk, so a restart recovers it.
                    log::error!(
                        "background flush of generation {} failed: {:#}",
                        rotated.version(),
                        e
                    );
                }
            }
            shared.rotation.end();
            shared.compaction.wake();
        });
        Ok(())
    }

    fn swap_in_new_generation(&self) -> Result<Arc<JournaledMemTable>> {
        let new_version = self.manifest.next_version(0)?;
        let fresh = Arc::new(JournaledMemTable::create(&self.dir, new_version, &self.opts)?);
        let mut current = self.current.write().expect("current memtable pointer");
        Ok(mem::replace(&mut *current, fresh))
    }

    /// Flush sequence for a frozen generation: close journal, write the
    /// level-0 page, register it in the manifest, and only then delete the
    /// journal. A crash between any two steps is recovered by replay.
    fn flush_rotated(&self, table: &JournaledMemTable) -> Result<()> {
        if let Some(closed) =
            table.write_to_table(&self.dir, self.opts.block_size, &self.locks)?
        {
            self.manifest.add_page(&closed)?;
            log::debug!(
                "flushed generation {} to level-0 page {} ({} entries)",
                table.version(),
                closed.id,
                closed.entries
            );
        }
        journal::remove_journal(&self.dir, table.version())?;
        Ok(())
    }
}
