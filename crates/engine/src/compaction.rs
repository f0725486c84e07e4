//! Table manager: the background compaction thread.
//!
//! One dedicated thread per store parks on a condition variable and wakes
//! when a flush or merge registers new pages (plus a periodic fallback
//! tick). Each cycle merges any level whose page count exceeds its limit:
//! level 0 merges all of its (possibly overlapping) pages plus the
//! overlapping level-1 pages; deeper levels round-robin one page at a time
//! via the manifest's merge cursor. Output pages roll over at the
//! configured table size, and the manifest transition — outputs in, inputs
//! out — is a single atomic `modify_pages` call.
//!
//! Errors in a cycle are logged and the loop continues: a bad merge must
//! never stop the store from accepting writes.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use blocktable::{ClosedTable, EntrySource, MergeIterator, PageId, SortedBlockTableWriter};

use crate::manifest::PageRecord;
use crate::StoreShared;

/// Wake signal for the table manager: set by flush and merge completions,
/// with a timed fallback so missed wakes only delay work by one tick.
pub(crate) struct CompactionSignal {
    pending: Mutex<bool>,
    cond: Condvar,
    shutdown: AtomicBool,
}

impl CompactionSignal {
    pub(crate) fn new() -> Self {
        CompactionSignal {
            pending: Mutex::new(false),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub(crate) fn wake(&self) {
        *self.pending.lock().expect("compaction signal") = true;
        self.cond.notify_all();
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake();
    }

    fn reset(&self) {
        self.shutdown.store(false, Ordering::SeqCst);
        *self.pending.lock().expect("compaction signal") = false;
    }

    /// Parks until woken or for one tick. Returns `false` on shutdown.
    fn wait(&self, tick: Duration) -> bool {
        let mut pending = self.pending.lock().expect("compaction signal");
        if !*pending && !self.shutdown.load(Ordering::SeqCst) {
            let (next, _) = self
                .cond
                .wait_timeout(pending, tick)
                .expect("compaction signal");
            pending = next;
        }
        *pending = false;
        !self.shutdown.load(Ordering::SeqCst)
    }
}

pub(crate) struct TableManager {
    shared: Arc<StoreShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TableManager {
    pub(crate) fn start(shared: Arc<StoreShared>) -> Self {
        let manager = TableManager { shared, handle: Mutex::new(None) };
        manager.restart();
        manager
    }

    /// (Re)spawns the worker thread; used at open and after truncation.
    pub(crate) fn restart(&self) {
        let mut handle = self.handle.lock().expect("table manager handle");
        if handle.is_some() {
            return;
        }
        self.shared.compaction.reset();
        let shared = Arc::clone(&self.shared);
        *handle = Some(std::thread::spawn(move || run_loop(shared)));
    }

    /// Signals shutdown and joins the worker.
    pub(crate) fn stop(&self) {
        self.shared.compaction.shutdown();
        if let Some(handle) = self.handle.lock().expect("table manager handle").take() {
            if handle.join().is_err() {
                log::error!("table manager thread panicked");
            }
        }
    }
}

fn run_loop(shared: Arc<StoreShared>) {
    log::debug!("table manager started");
    loop {
        if !shared.compaction.wait(shared.opts.compaction_tick) {
            break;
        }
        if let Err(e) = run_cycle(&shared) {
            log::error!("compaction cycle failed: {:#}", e);
        }
    }
    log::debug!("table manager stopped");
}

/// Merges overflowing levels until none remain over their limit.
fn run_cycle(shared: &Arc<StoreShared>) -> Result<()> {
    loop {
        let manifest = shared.manifest.current();
        let overflowing = (0..manifest.level_count() as u32)
            .find(|&l| manifest.page_count(l) >= shared.opts.max_pages_on_level(l));
        match overflowing {
            Some(level) => merge_level(shared, level)?,
            None => return Ok(()),
        }
    }
}

fn merge_level(shared: &Arc<StoreShared>, level: u32) -> Result<()> {
    let target = level + 1;

    // Inputs: every level-0 page (they overlap), or one round-robin page
    // for deeper levels.
    let inputs: Vec<Arc<PageRecord>> = if level == 0 {
        let mut pages: Vec<Arc<PageRecord>> =
            shared.manifest.current().pages(0).to_vec();
        // newest version first: its records win the merge tie-break
        pages.sort_by(|a, b| b.version().cmp(&a.version()));
        pages
    } else {
        match shared.manifest.next_merge_page(level)? {
            Some(page) => vec![page],
            None => return Ok(()),
        }
    };
    if inputs.is_empty() {
        return Ok(());
    }

    // The snapshot pins every input file for the duration of the merge.
    let snapshot = shared.manifest.latest();

    let min_first = inputs.iter().map(|p| p.first_key()).min().expect("inputs").clone();
    let max_last = inputs.iter().map(|p| p.last_key()).max().expect("inputs").clone();
    let overlapping: Vec<Arc<PageRecord>> = snapshot
        .pages(target)
        .iter()
        .filter(|p| *p.last_key() >= min_first && *p.first_key() <= max_last)
        .cloned()
        .collect();

    // Tombstones can be dropped only when nothing deeper exists for them
    // to shadow.
    let drop_tombstones = (target + 1..snapshot.level_count() as u32)
        .all(|l| snapshot.page_count(l) == 0);

    let mut sources: Vec<EntrySource> = Vec::with_capacity(inputs.len() + overlapping.len());
    for page in inputs.iter().chain(overlapping.iter()) {
        let reader = Arc::new(shared.open_reader(page.id())?);
        sources.push(Box::new(reader.enumerate()?));
    }
    let mut merge = MergeIterator::new(sources)?;

    let mut outputs: Vec<ClosedTable> = Vec::new();
    let mut writer: Option<SortedBlockTableWriter> = None;
    while let Some((key, value)) = merge.next_entry()? {
        if drop_tombstones && value.is_tombstone() {
            continue;
        }
        if writer.is_none() {
            let version = shared.manifest.next_version(target)?;
            writer = Some(SortedBlockTableWriter::create(
                &shared.dir,
                PageId::new(target, version),
                shared.opts.block_size,
                &shared.locks,
            )?);
        }
        let w = writer.as_mut().expect("open writer");
        w.add(&key, &value)?;
        if w.bytes_written() >= shared.opts.max_sorted_block_table_size {
            outputs.push(writer.take().expect("open writer").close()?);
        }
    }
    if let Some(w) = writer {
        outputs.push(w.close()?);
    }

    // release the read handles before the inputs can be unlinked
    drop(merge);

    let removes: Vec<PageId> =
        inputs.iter().chain(overlapping.iter()).map(|p| p.id()).collect();
    shared.manifest.modify_pages(&outputs, &removes)?;
    log::info!(
        "merged {} level-{} and {} level-{} pages into {} pages",
        inputs.len(),
        level,
        overlapping.len(),
        target,
        outputs.len()
    );

    // dropping the snapshot releases the inputs; their files go away once
    // no other snapshot holds them
    drop(snapshot);
    Ok(())
}
