//! Per-page reader/writer locks with bounded acquisition.
//!
//! Coordinates exclusive table creation against in-flight reads of the same
//! page. Acquisition is bounded (read 5 s, write 8 s by default); exceeding
//! the bound surfaces a fatal timeout error instead of deadlocking
//! silently. Readers never wait on other readers, so re-entrant read
//! acquisition from the same thread is permitted.
//!
//! The registry is owned by the store instance and entries are removed
//! explicitly when a page file is deleted.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::format::PageId;

#[derive(Default)]
struct Counts {
    readers: usize,
    writer: bool,
}

#[derive(Default)]
struct LockState {
    counts: Mutex<Counts>,
    cond: Condvar,
}

pub struct PageLocks {
    read_timeout: Duration,
    write_timeout: Duration,
    states: Mutex<HashMap<PageId, Arc<LockState>>>,
}

impl PageLocks {
    pub fn new(read_timeout: Duration, write_timeout: Duration) -> Self {
        PageLocks {
            read_timeout,
            write_timeout,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn state(&self, id: PageId) -> Arc<LockState> {
        let mut states = self.states.lock().expect("page lock registry");
        states.entry(id).or_default().clone()
    }

    /// Acquires a shared read lock on `id`, waiting at most the configured
    /// read timeout for any active writer to finish.
    pub fn read(&self, id: PageId) -> Result<PageReadGuard> {
        let state = self.state(id);
        let deadline = Instant::now() + self.read_timeout;
        let mut counts = state.counts.lock().expect("page lock");
        while counts.writer {
            let now = Instant::now();
            if now >= deadline {
                bail!(
                    "timed out after {:?} acquiring read lock for page {}",
                    self.read_timeout,
                    id
                );
            }
            let (next, _) = state
                .cond
                .wait_timeout(counts, deadline - now)
                .expect("page lock");
            counts = next;
        }
        counts.readers += 1;
        drop(counts);
        Ok(PageReadGuard { state })
    }

    /// Acquires the exclusive write lock on `id`, waiting at most the
    /// configured write timeout for readers and writers to drain.
    pub fn write(&self, id: PageId) -> Result<PageWriteGuard> {
        let state = self.state(id);
        let deadline = Instant::now() + self.write_timeout;
        let mut counts = state.counts.lock().expect("page lock");
        while counts.writer || counts.readers > 0 {
            let now = Instant::now();
            if now >= deadline {
                bail!(
                    "timed out after {:?} acquiring write lock for page {}",
                    self.write_timeout,
                    id
                );
            }
            let (next, _) = state
                .cond
                .wait_timeout(counts, deadline - now)
                .expect("page lock");
            counts = next;
        }
        counts.writer = true;
        drop(counts);
        Ok(PageWriteGuard { state })
    }

    /// Drops the registry entry for a deleted page.
    pub fn remove(&self, id: PageId) {
        self.states.lock().expect("page lock registry").remove(&id);
    }
}

pub struct PageReadGuard {
    state: Arc<LockState>,
}

impl std::fmt::Debug for PageReadGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageReadGuard").finish_non_exhaustive()
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        let mut counts = self.state.counts.lock().expect("page lock");
        counts.readers -= 1;
        drop(counts);
        self.state.cond.notify_all();
    }
}

pub struct PageWriteGuard {
    state: Arc<LockState>,
}

impl std::fmt::Debug for PageWriteGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageWriteGuard").finish_non_exhaustive()
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        let mut counts = self.state.counts.lock().expect("page lock");
        counts.writer = false;
        drop(counts);
        self.state.cond.notify_all();
    }
}
