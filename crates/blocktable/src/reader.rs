//! Sorted block table reader.
//!
//! Opening a table reads and validates the metadata block (magic string and
//! declared block count against the actual file size — a mismatch is a
//! fatal corruption signal). Point lookups binary-search the page index for
//! the candidate data block, fetch it through the block cache, and walk the
//! block's embedded search tree. Range enumeration walks blocks linearly
//! left to right with one block of read-ahead, seeking past smaller keys
//! only in the first block.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use types::{read_uvarint_slice, Key, Value};

use crate::cache::Cache;
use crate::format::{PageId, TableMeta, BLOCK_HEADER_LEN, END_OF_BLOCK, RECORD_HEADER};
use crate::lock::PageLocks;

pub struct SortedBlockTableReader {
    id: PageId,
    path: PathBuf,
    block_size: usize,
    meta: TableMeta,
    file: Mutex<File>,
    cache: Arc<Cache>,
    locks: Arc<PageLocks>,
}

/// One record parsed out of a data block.
struct ParsedRecord {
    key: Key,
    value: Value,
    left: u16,
    right: u16,
    /// Offset one past the record, for linear scans.
    end: usize,
}

impl SortedBlockTableReader {
    /// Opens page `id` inside `dir`, validating its metadata footer.
    pub fn open(
        dir: &Path,
        id: PageId,
        block_size: usize,
        cache: Arc<Cache>,
        locks: Arc<PageLocks>,
    ) -> Result<Self> {
        let _read = locks.read(id)?;
        let path = id.path(dir);
        let mut file =
            File::open(&path).with_context(|| format!("opening table {}", path.display()))?;

        let meta = match cache.get_meta(id) {
            Some(meta) => meta,
            None => {
                let file_len = file.metadata()?.len();
                if file_len == 0 || file_len % block_size as u64 != 0 {
                    bail!(
                        "corrupt table {}: size {} is not a multiple of the {}-byte block size",
                        path.display(),
                        file_len,
                        block_size
                    );
                }
                let mut block = vec![0u8; block_size];
                file.seek(SeekFrom::End(-(block_size as i64)))?;
                file.read_exact(&mut block)?;
                let meta = TableMeta::decode(&block, &path)?;
                if meta.total_blocks * block_size as u64 != file_len {
                    bail!(
                        "corrupt table {}: metadata declares {} blocks but the file holds {}",
                        path.display(),
                        meta.total_blocks,
                        file_len / block_size as u64
                    );
                }
                cache.put_meta(id, meta);
                meta
            }
        };

        Ok(SortedBlockTableReader {
            id,
            path,
            block_size,
            meta,
            file: Mutex::new(file),
            cache,
            locks,
        })
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn data_blocks(&self) -> u64 {
        self.meta.data_blocks
    }

    /// Fetches block `n`, cache first. A miss reads from disk and populates
    /// the cache with the shared, immutable buffer.
    fn read_block(&self, n: u64) -> Result<Bytes> {
        if let Some(block) = self.cache.get_block(self.id, n) {
            return Ok(block);
        }
        let mut buf = vec![0u8; self.block_size];
        {
            let mut file = self.file.lock().expect("table file lock");
            file.seek(SeekFrom::Start(n * self.block_size as u64))?;
            file.read_exact(&mut buf)
                .with_context(|| format!("reading block {} of table {}", n, self.path.display()))?;
        }
        let block = Bytes::from(buf);
        self.cache.put_block(self.id, n, block.clone());
        Ok(block)
    }

    /// Materializes the page index: the first key of every data block, in
    /// block order. Cached per page; recomputation on eviction is safe
    /// because the file is immutable.
    pub fn get_index(&self) -> Result<Arc<[Key]>> {
        if let Some(index) = self.cache.get_index(self.id) {
            return Ok(index);
        }
        let _read = self.locks.read(self.id)?;

        let mut keys: Vec<Key> = Vec::with_capacity(self.meta.data_blocks as usize);
        for n in self.meta.data_blocks..self.meta.data_blocks + self.meta.index_blocks {
            let block = self.read_block(n)?;
            let mut pos = 0usize;
            loop {
                let Some(klen) = read_uvarint_slice(&block, &mut pos) else { break };
                if klen == 0 {
                    break;
                }
                let end = pos + klen as usize;
                if end > block.len() {
                    bail!(
                        "corrupt table {}: index entry overruns block {}",
                        self.path.display(),
                        n
                    );
                }
                keys.push(Key::from_internal(block.slice(pos..end)));
                pos = end;
            }
        }
        if keys.len() as u64 != self.meta.data_blocks {
            bail!(
                "corrupt table {}: index holds {} entries for {} data blocks",
                self.path.display(),
                keys.len(),
                self.meta.data_blocks
            );
        }

        let index: Arc<[Key]> = keys.into();
        self.cache.put_index(self.id, index.clone());
        Ok(index)
    }

    /// Point lookup: index binary search, then a walk of the candidate
    /// block's embedded tree.
    pub fn lookup(&self, key: &Key) -> Result<Option<Value>> {
        let _read = self.locks.read(self.id)?;
        let index = self.get_index()?;
        let Some(block_no) = find_block_for_key(&index, key) else {
            return Ok(None);
        };
        let block = self.read_block(block_no)?;
        self.tree_lookup(&block, key)
    }

    fn tree_lookup(&self, block: &Bytes, key: &Key) -> Result<Option<Value>> {
        let root = u16::from_le_bytes([block[0], block[1]]);
        let mut off = root;
        while off != 0 {
            let rec = self.parse_record(block, off as usize)?.ok_or_else(|| {
                anyhow::anyhow!(
                    "corrupt table {}: tree offset {} points past the records",
                    self.path.display(),
                    off
                )
            })?;
            match key.cmp(&rec.key) {
                Ordering::Equal => return Ok(Some(rec.value)),
                Ordering::Less => off = rec.left,
                Ordering::Greater => off = rec.right,
            }
        }
        Ok(None)
    }

    /// Parses the record at `off`, or `None` at the end-of-block sentinel.
    fn parse_record(&self, block: &Bytes, off: usize) -> Result<Option<ParsedRecord>> {
        let header = *block.get(off).ok_or_else(|| self.corrupt("record offset out of range"))?;
        if header == END_OF_BLOCK {
            return Ok(None);
        }
        if header != RECORD_HEADER {
            bail!(
                "corrupt table {}: unexpected record header {:#04x} at offset {}",
                self.path.display(),
                header,
                off
            );
        }
        if off + 5 > block.len() {
            return Err(self.corrupt("record prefix overruns block"));
        }
        let left = u16::from_le_bytes([block[off + 1], block[off + 2]]);
        let right = u16::from_le_bytes([block[off + 3], block[off + 4]]);

        let mut pos = off + 5;
        let klen = read_uvarint_slice(block, &mut pos)
            .ok_or_else(|| self.corrupt("record key length truncated"))? as usize;
        if klen == 0 || pos + klen > block.len() {
            return Err(self.corrupt("record key overruns block"));
        }
        let key = Key::from_internal(block.slice(pos..pos + klen));
        pos += klen;

        let vlen = read_uvarint_slice(block, &mut pos)
            .ok_or_else(|| self.corrupt("record value length truncated"))? as usize;
        if pos + vlen > block.len() {
            return Err(self.corrupt("record value overruns block"));
        }
        let value = Value::from_raw(block.slice(pos..pos + vlen));
        pos += vlen;

        Ok(Some(ParsedRecord { key, value, left, right, end: pos }))
    }

    fn corrupt(&self, what: &str) -> anyhow::Error {
        anyhow::anyhow!("corrupt table {}: {}", self.path.display(), what)
    }

    /// Forward enumeration from the start of the table.
    pub fn enumerate(self: &Arc<Self>) -> Result<TableIter> {
        self.enumerate_from(None)
    }

    /// Forward enumeration starting at the first key ≥ `start`.
    pub fn enumerate_from(self: &Arc<Self>, start: Option<&Key>) -> Result<TableIter> {
        let _read = self.locks.read(self.id)?;
        let start_block = match start {
            None => 0,
            Some(key) => {
                let index = self.get_index()?;
                // a start before the table's first key still scans from
                // block zero; nothing gets skipped
                find_block_for_key(&index, key).unwrap_or(0)
            }
        };

        let mut iter = TableIter {
            reader: Arc::clone(self),
            current: None,
            read_ahead: None,
            block_no: start_block,
            pos: BLOCK_HEADER_LEN,
            skip_below: start.cloned(),
            done: false,
        };
        if start_block < self.meta.data_blocks {
            iter.current = Some(self.read_block(start_block)?);
            if start_block + 1 < self.meta.data_blocks {
                iter.read_ahead = Some(self.read_block(start_block + 1)?);
            }
        } else {
            iter.done = true;
        }
        Ok(iter)
    }
}

/// Index binary search: the block that may contain `key` is the last one
/// whose first key is ≤ `key`. `None` means the key sorts before the table.
pub fn find_block_for_key(index: &[Key], key: &Key) -> Option<u64> {
    let pp = index.partition_point(|first| first <= key);
    if pp == 0 {
        None
    } else {
        Some((pp - 1) as u64)
    }
}

/// Ordered forward iterator over one table's records.
///
/// Holds its reader via `Arc`, so the iterator is self-contained; blocks
/// are walked linearly (enumeration needs sequential order, not the tree)
/// with the next block fetched ahead of the one being parsed.
pub struct TableIter {
    reader: Arc<SortedBlockTableReader>,
    current: Option<Bytes>,
    read_ahead: Option<Bytes>,
    block_no: u64,
    pos: usize,
    skip_below: Option<Key>,
    done: bool,
}

impl TableIter {
    fn step(&mut self) -> Result<Option<(Key, Value)>> {
        loop {
            if self.done {
                return Ok(None);
            }
            let Some(block) = self.current.as_ref() else {
                self.done = true;
                return Ok(None);
            };

            let rec = if self.pos >= block.len() {
                None
            } else {
                self.reader.parse_record(block, self.pos)?
            };

            match rec {
                None => {
                    // block exhausted; move to the prefetched one
                    self.block_no += 1;
                    self.pos = BLOCK_HEADER_LEN;
                    self.current = self.read_ahead.take();
                    if self.current.is_none() {
                        self.done = true;
                        return Ok(None);
                    }
                    if self.block_no + 1 < self.reader.meta.data_blocks {
                        self.read_ahead = Some(self.reader.read_block(self.block_no + 1)?);
                    }
                }
                Some(rec) => {
                    self.pos = rec.end;
                    if let Some(skip) = &self.skip_below {
                        if rec.key < *skip {
                            continue;
                        }
                        self.skip_below = None;
                    }
                    return Ok(Some((rec.key, rec.value)));
                }
            }
        }
    }
}

impl Iterator for TableIter {
    type Item = Result<(Key, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
