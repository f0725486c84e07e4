//! Sorted block table writer.
//!
//! Accepts key/value pairs in strictly ascending key order (caller
//! contract, not re-validated) and assembles fixed-size data blocks. When a
//! block fills, a balanced binary search tree is linked over its record
//! offsets (recursive midpoint split) and the block is handed to a
//! dedicated writer thread over a bounded channel, so the next block is
//! assembled while the previous one is still being flushed to disk.
//!
//! The file is written as `<name>.tmp` and atomically renamed on
//! [`close`](SortedBlockTableWriter::close), after a full fsync. A crash
//! mid-write leaves only a temp file that recovery removes.

use anyhow::{anyhow, bail, ensure, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, SyncSender};
use std::thread::{self, JoinHandle};

use types::{uvarint_len, write_uvarint, Key, Value};

use crate::format::{
    record_len, PageId, TableMeta, BLOCK_HEADER_LEN, END_OF_BLOCK, RECORD_HEADER,
};
use crate::lock::{PageLocks, PageWriteGuard};

/// Summary of a finished table, used to register it in the manifest.
#[derive(Debug, Clone)]
pub struct ClosedTable {
    pub id: PageId,
    pub first_key: Key,
    pub last_key: Key,
    pub entries: u64,
}

/// One data block under construction.
struct BlockBuilder {
    buf: Vec<u8>,
    offsets: Vec<u16>,
}

impl BlockBuilder {
    fn new(block_size: usize) -> Self {
        let mut buf = Vec::with_capacity(block_size);
        buf.extend_from_slice(&[0u8; BLOCK_HEADER_LEN]);
        BlockBuilder { buf, offsets: Vec::new() }
    }

    fn entry_count(&self) -> usize {
        self.offsets.len()
    }

    fn bytes_used(&self) -> usize {
        self.buf.len()
    }

    fn fits(&self, key: &Key, value: &Value, block_size: usize) -> bool {
        self.buf.len() + record_len(key, value) <= block_size
    }

    fn push(&mut self, key: &Key, value: &Value) {
        self.offsets.push(self.buf.len() as u16);
        self.buf.push(RECORD_HEADER);
        self.buf.extend_from_slice(&[0u8; 4]); // child offsets linked in finish()
        write_uvarint(&mut self.buf, key.internal().len() as u64);
        self.buf.extend_from_slice(key.internal());
        write_uvarint(&mut self.buf, value.raw().len() as u64);
        self.buf.extend_from_slice(value.raw());
    }

    /// Links the balanced search tree over the records, writes the root
    /// offset header, and pads the block to its fixed size.
    fn finish(mut self, block_size: usize) -> Vec<u8> {
        let offsets = mem::take(&mut self.offsets);
        let root = Self::link(&mut self.buf, &offsets, 0, offsets.len());
        self.buf[..BLOCK_HEADER_LEN].copy_from_slice(&root.to_le_bytes());
        if self.buf.len() < block_size {
            self.buf.push(END_OF_BLOCK);
            self.buf.resize(block_size, 0);
        }
        self.buf
    }

    /// Recursive midpoint split over `offsets[lo..hi)`; returns the offset
    /// of the subtree root. Zero means "no child" (offset 0 is the block
    /// header, never a record).
    fn link(buf: &mut [u8], offsets: &[u16], lo: usize, hi: usize) -> u16 {
        let mid = lo + (hi - lo) / 2;
        let off = offsets[mid] as usize;
        let left = if lo < mid { Self::link(buf, offsets, lo, mid) } else { 0 };
        let right = if mid + 1 < hi { Self::link(buf, offsets, mid + 1, hi) } else { 0 };
        buf[off + 1..off + 3].copy_from_slice(&left.to_le_bytes());
        buf[off + 3..off + 5].copy_from_slice(&right.to_le_bytes());
        offsets[mid]
    }
}

/// Dedicated block-flushing thread: one block may be in flight while the
/// caller assembles the next (double buffering via a bounded channel).
struct BlockSink {
    tx: SyncSender<Vec<u8>>,
    handle: JoinHandle<std::io::Result<File>>,
}

impl BlockSink {
    fn spawn(mut file: File) -> Self {
        let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(1);
        let handle = thread::spawn(move || -> std::io::Result<File> {
            for block in rx {
                file.write_all(&block)?;
            }
            file.flush()?;
            Ok(file)
        });
        BlockSink { tx, handle }
    }

    fn send(&self, block: Vec<u8>) -> Result<()> {
        self.tx
            .send(block)
            .map_err(|_| anyhow!("block writer thread terminated early"))
    }

    fn finish(self) -> Result<File> {
        drop(self.tx);
        let file = self
            .handle
            .join()
            .map_err(|_| anyhow!("block writer thread panicked"))??;
        Ok(file)
    }
}

pub struct SortedBlockTableWriter {
    id: PageId,
    path: PathBuf,
    tmp_path: PathBuf,
    block_size: usize,
    block: BlockBuilder,
    index_keys: Vec<Key>,
    first_key: Option<Key>,
    last_key: Option<Key>,
    entries: u64,
    data_blocks: u64,
    sink: Option<BlockSink>,
    _write_guard: PageWriteGuard,
}

impl SortedBlockTableWriter {
    /// Opens a writer for page `id` inside `dir`, holding the page's write
    /// lock until the table is closed.
    pub fn create(dir: &Path, id: PageId, block_size: usize, locks: &PageLocks) -> Result<Self> {
        ensure!(
            (64..=65536).contains(&block_size),
            "block size {} outside the supported range (in-block offsets are u16)",
            block_size
        );
        let write_guard = locks.write(id)?;
        let path = id.path(dir);
        let tmp_path = path.with_extension("tmp");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("creating table {}", tmp_path.display()))?;
        Ok(SortedBlockTableWriter {
            id,
            path,
            tmp_path,
            block_size,
            block: BlockBuilder::new(block_size),
            index_keys: Vec::new(),
            first_key: None,
            last_key: None,
            entries: 0,
            data_blocks: 0,
            sink: Some(BlockSink::spawn(file)),
            _write_guard: write_guard,
        })
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    /// Bytes of data-section output so far, for page-size rollover checks.
    pub fn bytes_written(&self) -> u64 {
        self.data_blocks * self.block_size as u64 + self.block.bytes_used() as u64
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Appends the next record. Keys must arrive in strictly ascending
    /// order; a record too large for an empty block is rejected.
    pub fn add(&mut self, key: &Key, value: &Value) -> Result<()> {
        if !self.block.fits(key, value, self.block_size) {
            ensure!(
                self.block.entry_count() > 0,
                "record for key {:?} exceeds the {}-byte block size",
                key,
                self.block_size
            );
            self.finish_block()?;
        }
        if self.block.entry_count() == 0 {
            self.index_keys.push(key.clone());
        }
        self.block.push(key, value);
        if self.first_key.is_none() {
            self.first_key = Some(key.clone());
        }
        self.last_key = Some(key.clone());
        self.entries += 1;
        Ok(())
    }

    fn finish_block(&mut self) -> Result<()> {
        let block = mem::replace(&mut self.block, BlockBuilder::new(self.block_size));
        let bytes = block.finish(self.block_size);
        self.sink.as_ref().expect("writer not closed").send(bytes)?;
        self.data_blocks += 1;
        Ok(())
    }

    /// Builds the index blocks: `[varint key_len][key]` entries, one per
    /// data block, zero-padded so the first pad byte doubles as the
    /// zero-length terminator.
    fn index_blocks(&self, block_size: usize) -> Vec<Vec<u8>> {
        let mut blocks = Vec::new();
        let mut buf: Vec<u8> = Vec::with_capacity(block_size);
        for key in &self.index_keys {
            let klen = key.internal().len();
            let entry_len = uvarint_len(klen as u64) + klen;
            // leave one byte for the terminator marker
            if buf.len() + entry_len + 1 > block_size {
                buf.resize(block_size, 0);
                blocks.push(mem::replace(&mut buf, Vec::with_capacity(block_size)));
            }
            write_uvarint(&mut buf, klen as u64);
            buf.extend_from_slice(key.internal());
        }
        buf.resize(block_size, 0);
        blocks.push(buf);
        blocks
    }

    /// Finalizes the table: flushes the last data block, writes the index
    /// and metadata blocks, fsyncs, and renames into place.
    pub fn close(mut self) -> Result<ClosedTable> {
        ensure!(self.entries > 0, "refusing to write empty table {}", self.id);
        if self.block.entry_count() > 0 {
            self.finish_block()?;
        }

        let index_blocks = self.index_blocks(self.block_size);
        let meta = TableMeta {
            total_blocks: self.data_blocks + index_blocks.len() as u64 + 1,
            data_blocks: self.data_blocks,
            index_blocks: index_blocks.len() as u64,
        };

        let sink = self.sink.take().expect("writer not closed");
        for block in index_blocks {
            sink.send(block)?;
        }
        sink.send(meta.encode_block(self.block_size))?;

        let file = sink.finish().with_context(|| format!("writing table {}", self.id))?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&self.tmp_path, &self.path)
            .with_context(|| format!("publishing table {}", self.path.display()))?;
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        let (Some(first_key), Some(last_key)) = (self.first_key.take(), self.last_key.take())
        else {
            bail!("table {} closed without a key range", self.id);
        };
        Ok(ClosedTable { id: self.id, first_key, last_key, entries: self.entries })
    }

    /// Abandons the table, deleting the temp file.
    pub fn abort(mut self) {
        if let Some(sink) = self.sink.take() {
            let _ = sink.finish();
        }
        let _ = std::fs::remove_file(&self.tmp_path);
    }
}

impl Drop for SortedBlockTableWriter {
    fn drop(&mut self) {
        // close() and abort() take the sink; reaching Drop with one still
        // present means the writer was abandoned mid-write.
        if let Some(sink) = self.sink.take() {
            let _ = sink.finish();
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}
