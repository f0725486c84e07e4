//! Manifest: versioned, reference-counted, copy-on-write metadata
//! describing which pages exist at which levels.
//!
//! [`ManifestImmutable`] is one fully immutable generation of the
//! database's structural state: per-level version counters, per-level page
//! lists sorted by first key, and per-level merge cursors. Every mutation
//! produces a new generation; page records are shared between generations
//! via `Arc`, so a transition clones only the touched level's list.
//!
//! [`Manifest`] owns the current generation, persists each committed one to
//! `0.mf`, and hands out [`ManifestSnapshot`] guards. A snapshot pins every
//! page it can see by bumping the page's reference count; a page removed
//! from the current manifest keeps its file on disk until the last snapshot
//! referencing it is dropped, at which point the file is deleted and its
//! cache and lock entries are torn down. That is what lets readers keep
//! enumerating superseded pages while compaction has already swapped in
//! their replacements.
//!
//! ## Persistence
//!
//! Each committed generation is serialized and appended followed by a
//! 4-byte little-endian record size. Startup reads the trailing size field
//! and deserializes the last complete record, so a torn final append is
//! ignored — the same crash contract as the journal. After
//! `manifest_version_count` appends the file is rewritten compactly with
//! only the latest generation; that rewrite (temp file + rename) is the
//! only non-append write the manifest ever performs.

use anyhow::{bail, ensure, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use blocktable::{Cache, ClosedTable, PageId, PageLocks};
use config::StoreOptions;
use types::{read_uvarint_slice, write_uvarint, Key};

/// Name of the manifest file within the store directory.
pub const MANIFEST_FILE: &str = "0.mf";

const MANIFEST_TMP_FILE: &str = "0.mf.tmp";

/// Decoder sanity caps; structures beyond these are corruption.
const MAX_LEVELS: u64 = 64;
const MAX_PAGES_PER_LEVEL: u64 = 1 << 20;
const MAX_RANGE_KEY_BYTES: u64 = 64 * 1024;

/// One persisted page: identity (level, version), key range, and the
/// atomic reference count governing the life of its file.
pub struct PageRecord {
    level: u32,
    version: u64,
    first_key: Key,
    last_key: Key,
    /// One reference for manifest membership plus one per live snapshot.
    refs: AtomicU32,
}

impl PageRecord {
    fn new(level: u32, version: u64, first_key: Key, last_key: Key) -> Self {
        PageRecord { level, version, first_key, last_key, refs: AtomicU32::new(1) }
    }

    pub fn id(&self) -> PageId {
        PageId::new(self.level, self.version)
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn first_key(&self) -> &Key {
        &self.first_key
    }

    pub fn last_key(&self) -> &Key {
        &self.last_key
    }

    /// True if `key` falls inside this page's inclusive key range.
    pub fn contains(&self, key: &Key) -> bool {
        *key >= self.first_key && *key <= self.last_key
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drops one reference; true when this was the last one.
    fn release(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::SeqCst) == 1
    }
}

impl std::fmt::Debug for PageRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRecord")
            .field("id", &self.id().to_string())
            .field("first_key", &self.first_key)
            .field("last_key", &self.last_key)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// One immutable generation of the manifest.
#[derive(Clone, Default)]
pub struct ManifestImmutable {
    versions: Vec<u64>,
    pages: Vec<Vec<Arc<PageRecord>>>,
    merge_keys: Vec<Option<Key>>,
}

impl ManifestImmutable {
    /// Number of levels this generation has ever touched.
    pub fn level_count(&self) -> usize {
        self.pages.len()
    }

    pub fn current_version(&self, level: u32) -> u64 {
        self.versions.get(level as usize).copied().unwrap_or(0)
    }

    pub fn pages(&self, level: u32) -> &[Arc<PageRecord>] {
        self.pages.get(level as usize).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn page_count(&self, level: u32) -> usize {
        self.pages(level).len()
    }

    pub fn all_pages(&self) -> impl Iterator<Item = &Arc<PageRecord>> {
        self.pages.iter().flatten()
    }

    pub fn total_pages(&self) -> usize {
        self.pages.iter().map(Vec::len).sum()
    }

    /// The single page whose range contains `key` at a non-overlapping
    /// level (≥ 1), found by binary search over the sorted first keys.
    pub fn find_page(&self, level: u32, key: &Key) -> Option<Arc<PageRecord>> {
        let pages = self.pages(level);
        let pp = pages.partition_point(|p| p.first_key() <= key);
        if pp == 0 {
            return None;
        }
        let candidate = &pages[pp - 1];
        candidate.contains(key).then(|| Arc::clone(candidate))
    }

    pub fn merge_key(&self, level: u32) -> Option<&Key> {
        self.merge_keys.get(level as usize).and_then(Option::as_ref)
    }

    /// The next page compaction should merge at `level`, round-robining
    /// through the level via the persisted merge cursor.
    pub fn next_merge_page(&self, level: u32) -> Option<Arc<PageRecord>> {
        let pages = self.pages(level);
        if pages.is_empty() {
            return None;
        }
        let pick = match self.merge_key(level) {
            Some(cursor) => pages
                .iter()
                .find(|p| p.first_key() > cursor)
                .unwrap_or(&pages[0]),
            None => &pages[0],
        };
        Some(Arc::clone(pick))
    }

    fn grown_to(&self, level: u32) -> Self {
        let mut next = self.clone();
        while next.pages.len() <= level as usize {
            next.versions.push(0);
            next.pages.push(Vec::new());
            next.merge_keys.push(None);
        }
        next
    }

    fn with_next_version(&self, level: u32) -> (Self, u64) {
        let mut next = self.grown_to(level);
        next.versions[level as usize] += 1;
        let v = next.versions[level as usize];
        (next, v)
    }

    fn insert_sorted(list: &mut Vec<Arc<PageRecord>>, page: Arc<PageRecord>) {
        let at = list.partition_point(|p| {
            (p.first_key(), p.version()) < (page.first_key(), page.version())
        });
        list.insert(at, page);
    }

    fn with_added_page(&self, page: Arc<PageRecord>) -> Self {
        let mut next = self.grown_to(page.level());
        Self::insert_sorted(&mut next.pages[page.level() as usize], page);
        next
    }

    /// One atomic transition adding `adds` and removing `removes`. Every
    /// removal must name a present page; a miss is a fatal inconsistency.
    fn with_modified_pages(
        &self,
        adds: &[Arc<PageRecord>],
        removes: &[PageId],
    ) -> Result<Self> {
        let max_level = adds
            .iter()
            .map(|p| p.level())
            .chain(removes.iter().map(|id| id.level))
            .max()
            .unwrap_or(0);
        let mut next = self.grown_to(max_level);
        for id in removes {
            let list = &mut next.pages[id.level as usize];
            let Some(at) = list.iter().position(|p| p.id() == *id) else {
                bail!("manifest inconsistency: page {} slated for removal is not present", id);
            };
            list.remove(at);
        }
        for page in adds {
            Self::insert_sorted(&mut next.pages[page.level() as usize], Arc::clone(page));
        }
        Ok(next)
    }

    fn with_merge_key(&self, level: u32, key: Option<Key>) -> Self {
        let mut next = self.grown_to(level);
        next.merge_keys[level as usize] = key;
        next
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        let levels = self.pages.len() as u64;
        write_uvarint(buf, levels);
        for v in &self.versions {
            write_uvarint(buf, *v);
        }
        for level in &self.pages {
            write_uvarint(buf, level.len() as u64);
            for page in level {
                write_uvarint(buf, page.version());
                write_uvarint(buf, page.first_key().internal().len() as u64);
                buf.extend_from_slice(page.first_key().internal());
                write_uvarint(buf, page.last_key().internal().len() as u64);
                buf.extend_from_slice(page.last_key().internal());
            }
        }
        for cursor in &self.merge_keys {
            match cursor {
                None => buf.push(0),
                Some(k) => {
                    buf.push(1);
                    write_uvarint(buf, k.internal().len() as u64);
                    buf.extend_from_slice(k.internal());
                }
            }
        }
    }

    /// Decodes one record from `buf` starting at `*pos`, advancing past it.
    fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let read_key = |buf: &[u8], pos: &mut usize| -> Result<Key> {
            let len = read_uvarint_slice(buf, pos)
                .filter(|l| (1..=MAX_RANGE_KEY_BYTES).contains(l))
                .context("manifest record: bad key length")?;
            let end = *pos + len as usize;
            ensure!(end <= buf.len(), "manifest record: key overruns the record");
            let key = Key::from_internal(buf[*pos..end].to_vec());
            *pos = end;
            Ok(key)
        };

        let levels = read_uvarint_slice(buf, pos)
            .filter(|l| *l <= MAX_LEVELS)
            .context("manifest record: bad level count")?;

        let mut versions = Vec::with_capacity(levels as usize);
        for _ in 0..levels {
            versions.push(read_uvarint_slice(buf, pos).context("manifest record: bad version")?);
        }

        let mut pages = Vec::with_capacity(levels as usize);
        for level in 0..levels {
            let count = read_uvarint_slice(buf, pos)
                .filter(|c| *c <= MAX_PAGES_PER_LEVEL)
                .context("manifest record: bad page count")?;
            let mut list = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let version =
                    read_uvarint_slice(buf, pos).context("manifest record: bad page version")?;
                let first = read_key(buf, pos)?;
                let last = read_key(buf, pos)?;
                list.push(Arc::new(PageRecord::new(level as u32, version, first, last)));
            }
            pages.push(list);
        }

        let mut merge_keys = Vec::with_capacity(levels as usize);
        for _ in 0..levels {
            let presence = *buf.get(*pos).context("manifest record: truncated merge cursor")?;
            *pos += 1;
            merge_keys.push(match presence {
                0 => None,
                1 => Some(read_key(buf, pos)?),
                other => bail!("manifest record: bad merge cursor marker {:#04x}", other),
            });
        }

        Ok(ManifestImmutable { versions, pages, merge_keys })
    }
}

struct ManifestState {
    current: Arc<ManifestImmutable>,
    file: File,
    appends: usize,
}

pub(crate) struct ManifestShared {
    dir: PathBuf,
    rollover_count: usize,
    cache: Arc<Cache>,
    locks: Arc<PageLocks>,
    state: Mutex<ManifestState>,
}

impl ManifestShared {
    /// Drops one reference to `page`; deletes its file and tears down its
    /// cache and lock entries when that was the last one.
    fn release_page(&self, page: &Arc<PageRecord>) {
        if !page.release() {
            return;
        }
        let path = page.id().path(&self.dir);
        match std::fs::remove_file(&path) {
            Ok(()) => log::debug!("deleted released page {}", page.id()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("failed deleting released page {}: {}", page.id(), e),
        }
        self.cache.evict_page(page.id());
        self.locks.remove(page.id());
    }
}

/// Thread-safe owner of the current manifest generation. One instance per
/// store directory.
pub struct Manifest {
    shared: Arc<ManifestShared>,
}

impl Manifest {
    pub fn open(
        dir: &Path,
        opts: &StoreOptions,
        cache: Arc<Cache>,
        locks: Arc<PageLocks>,
    ) -> Result<Manifest> {
        let path = dir.join(MANIFEST_FILE);
        let current = if path.exists() {
            Self::load(&path)?
        } else {
            ManifestImmutable::default()
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Manifest {
            shared: Arc::new(ManifestShared {
                dir: dir.to_path_buf(),
                rollover_count: opts.manifest_version_count,
                cache,
                locks,
                state: Mutex::new(ManifestState {
                    current: Arc::new(current),
                    file,
                    appends: 0,
                }),
            }),
        })
    }

    /// Reads the last fully-written record: trailing size field first, with
    /// a forward scan fallback if the fast path lands in a torn append.
    fn load(path: &Path) -> Result<ManifestImmutable> {
        let data = std::fs::read(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        if data.is_empty() {
            return Ok(ManifestImmutable::default());
        }

        if data.len() > 4 {
            let size_at = data.len() - 4;
            let size = (&data[size_at..]).read_u32::<LittleEndian>()? as usize;
            if size <= size_at {
                let start = size_at - size;
                let mut pos = start;
                if let Ok(m) = ManifestImmutable::decode(&data, &mut pos) {
                    if pos == size_at {
                        return Ok(m);
                    }
                }
            }
        }

        // Torn tail: scan forward keeping the last record whose trailing
        // size field confirms it.
        let mut last = None;
        let mut pos = 0usize;
        while pos + 4 < data.len() {
            let start = pos;
            let Ok(m) = ManifestImmutable::decode(&data, &mut pos) else { break };
            let consumed = pos - start;
            if pos + 4 > data.len() {
                break;
            }
            let size = (&data[pos..]).read_u32::<LittleEndian>()? as usize;
            if size != consumed {
                break;
            }
            pos += 4;
            last = Some(m);
        }
        last.ok_or_else(|| {
            anyhow::anyhow!("corrupt manifest {}: no complete record found", path.display())
        })
    }

    /// Current generation without reference counting. For metadata peeks
    /// (page counts, version counters) only — never for reading page files.
    pub fn current(&self) -> Arc<ManifestImmutable> {
        Arc::clone(&self.shared.state.lock().expect("manifest lock").current)
    }

    pub fn current_version(&self, level: u32) -> u64 {
        self.current().current_version(level)
    }

    pub fn page_count(&self, level: u32) -> usize {
        self.current().page_count(level)
    }

    /// A reference-counted snapshot: every page it can see stays on disk
    /// and readable until the snapshot is dropped.
    pub fn latest(&self) -> ManifestSnapshot {
        let state = self.shared.state.lock().expect("manifest lock");
        let inner = Arc::clone(&state.current);
        for page in inner.all_pages() {
            page.acquire();
        }
        drop(state);
        ManifestSnapshot { shared: Arc::clone(&self.shared), inner }
    }

    /// Bumps and persists the version counter for `level`, returning the
    /// new version.
    pub fn next_version(&self, level: u32) -> Result<u64> {
        let mut state = self.shared.state.lock().expect("manifest lock");
        let (next, version) = state.current.with_next_version(level);
        self.commit_locked(&mut state, next)?;
        Ok(version)
    }

    /// Registers a freshly flushed page.
    pub fn add_page(&self, table: &ClosedTable) -> Result<Arc<PageRecord>> {
        let page = Arc::new(PageRecord::new(
            table.id.level,
            table.id.version,
            table.first_key.clone(),
            table.last_key.clone(),
        ));
        let mut state = self.shared.state.lock().expect("manifest lock");
        let next = state.current.with_added_page(Arc::clone(&page));
        self.commit_locked(&mut state, next)?;
        Ok(page)
    }

    /// One atomic transition: a merge's output pages appear and its input
    /// pages disappear together, never half-applied. Removed pages are
    /// released (their files are deleted once no snapshot needs them).
    pub fn modify_pages(
        &self,
        adds: &[ClosedTable],
        removes: &[PageId],
    ) -> Result<Vec<Arc<PageRecord>>> {
        let pages: Vec<Arc<PageRecord>> = adds
            .iter()
            .map(|t| {
                Arc::new(PageRecord::new(
                    t.id.level,
                    t.id.version,
                    t.first_key.clone(),
                    t.last_key.clone(),
                ))
            })
            .collect();

        let removed = {
            let mut state = self.shared.state.lock().expect("manifest lock");
            let removed: Vec<Arc<PageRecord>> = removes
                .iter()
                .filter_map(|id| {
                    state.current.pages(id.level).iter().find(|p| p.id() == *id).cloned()
                })
                .collect();
            let next = state.current.with_modified_pages(&pages, removes)?;
            self.commit_locked(&mut state, next)?;
            removed
        };

        // Outside the manifest lock: file deletion is refcount-driven.
        for page in &removed {
            self.shared.release_page(page);
        }
        Ok(pages)
    }

    /// Picks the next merge victim at `level` and persists the advanced
    /// cursor, so successive compactions visit every page fairly.
    pub fn next_merge_page(&self, level: u32) -> Result<Option<Arc<PageRecord>>> {
        let mut state = self.shared.state.lock().expect("manifest lock");
        let Some(page) = state.current.next_merge_page(level) else {
            return Ok(None);
        };
        let next = state.current.with_merge_key(level, Some(page.first_key().clone()));
        self.commit_locked(&mut state, next)?;
        Ok(Some(page))
    }

    /// Empties the manifest, releasing (and thereby deleting) every page.
    pub fn reset(&self) -> Result<()> {
        let old = {
            let mut state = self.shared.state.lock().expect("manifest lock");
            let old = Arc::clone(&state.current);
            state.current = Arc::new(ManifestImmutable::default());
            state.appends = self.shared.rollover_count; // force a rewrite
            self.persist_locked(&mut state)?;
            old
        };
        for page in old.all_pages() {
            self.shared.release_page(page);
        }
        Ok(())
    }

    fn commit_locked(&self, state: &mut ManifestState, next: ManifestImmutable) -> Result<()> {
        state.current = Arc::new(next);
        state.appends += 1;
        self.persist_locked(state)
    }

    fn persist_locked(&self, state: &mut ManifestState) -> Result<()> {
        if state.appends >= self.shared.rollover_count {
            return self.rewrite_locked(state);
        }
        let mut buf = Vec::with_capacity(256);
        state.current.encode(&mut buf);
        let size = buf.len() as u32;
        buf.write_u32::<LittleEndian>(size)?;
        state.file.write_all(&buf)?;
        state.file.flush()?;
        state.file.sync_data()?;
        Ok(())
    }

    /// Rewrites the manifest compactly with only the latest generation.
    fn rewrite_locked(&self, state: &mut ManifestState) -> Result<()> {
        let path = self.shared.dir.join(MANIFEST_FILE);
        let tmp = self.shared.dir.join(MANIFEST_TMP_FILE);

        let mut buf = Vec::with_capacity(256);
        state.current.encode(&mut buf);
        let size = buf.len() as u32;
        buf.write_u32::<LittleEndian>(size)?;

        {
            let mut f = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp)?;
            f.write_all(&buf)?;
            f.flush()?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("rolling over manifest {}", path.display()))?;

        state.file = OpenOptions::new().append(true).open(&path)?;
        state.appends = 0;
        log::debug!("manifest rolled over ({} pages)", state.current.total_pages());
        Ok(())
    }
}

/// Reference-counted view of one manifest generation. Dropping it releases
/// every page it pinned; pages no longer in the current manifest whose last
/// reference this was are physically deleted.
pub struct ManifestSnapshot {
    shared: Arc<ManifestShared>,
    inner: Arc<ManifestImmutable>,
}

impl Deref for ManifestSnapshot {
    type Target = ManifestImmutable;

    fn deref(&self) -> &ManifestImmutable {
        &self.inner
    }
}

impl Drop for ManifestSnapshot {
    fn drop(&mut self) {
        for page in self.inner.all_pages() {
            self.shared.release_page(page);
        }
    }
}
