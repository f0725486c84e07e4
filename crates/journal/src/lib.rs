//! # Journal — Write-Ahead Log
//!
//! Crash-safe durability for one memtable generation. Every mutation is
//! appended here **before** the corresponding in-memory update, so a reader
//! or recovery pass that sees an entry in the memtable is guaranteed it is
//! also on disk.
//!
//! ## Binary Record Format
//!
//! ```text
//! [varint key_len][key bytes][varint value_len][value bytes]
//! ```
//!
//! repeated until end of file. Value bytes are the raw flag-tagged value
//! representation, so tombstones are ordinary records.
//!
//! ## Crash Recovery Contract
//!
//! Replay stops **silently** at the first malformed or truncated record —
//! including an EOF in the middle of one. A partial trailing record means a
//! crash interrupted a write; everything before it is valid and everything
//! from that point on is discarded. At most the last in-flight write is
//! lost; all fully-written prior records are recovered.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use types::{read_uvarint, write_uvarint, Key, Value};

/// Extension of journal files: `<version>.jf`.
pub const JOURNAL_EXT: &str = "jf";

/// Largest key a replay will accept before treating the record as torn.
const MAX_REPLAY_KEY_BYTES: u64 = 64 * 1024;
/// Largest value a replay will accept before treating the record as torn.
const MAX_REPLAY_VALUE_BYTES: u64 = 64 * 1024 * 1024;

/// Errors from journal operations. Truncation during replay is not an
/// error; it terminates the replay.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal io error: {0}")]
    Io(#[from] io::Error),
}

/// Path of the journal for `version` inside a store directory.
pub fn journal_path(dir: &Path, version: u64) -> PathBuf {
    dir.join(format!("{}.{}", version, JOURNAL_EXT))
}

/// Removes the journal file for `version`. Missing file is not an error.
pub fn remove_journal(dir: &Path, version: u64) -> Result<(), JournalError> {
    match std::fs::remove_file(journal_path(dir, version)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Truncates the journal for `version` to `len` bytes. Used after replay
/// to discard a torn tail before the journal is reopened for appends —
/// new records written after garbage would be unreachable to replay.
pub fn truncate_journal(dir: &Path, version: u64, len: u64) -> Result<(), JournalError> {
    let file = OpenOptions::new().write(true).open(journal_path(dir, version))?;
    file.set_len(len)?;
    Ok(())
}

struct WriterState {
    /// `None` once the journal has been closed.
    file: Option<File>,
    /// Reusable scratch buffer so appends don't allocate.
    buf: Vec<u8>,
}

/// Append-only journal writer for one generation.
///
/// [`add`](JournalWriter::add) returns `false` after [`close`] — a writer
/// racing a generation rotation must fail cleanly and retry against the new
/// generation, never corrupt the file. `close` is idempotent.
pub struct JournalWriter {
    version: u64,
    sync: bool,
    inner: Mutex<WriterState>,
}

impl JournalWriter {
    /// Creates a fresh journal for `version` (truncating any stale file of
    /// the same name).
    pub fn create(dir: &Path, version: u64, sync: bool) -> Result<Self, JournalError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(journal_path(dir, version))?;
        Ok(Self::from_file(file, version, sync))
    }

    /// Reopens an existing journal in append mode to resume its generation
    /// after a restart.
    pub fn resume(dir: &Path, version: u64, sync: bool) -> Result<Self, JournalError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(journal_path(dir, version))?;
        Ok(Self::from_file(file, version, sync))
    }

    fn from_file(file: File, version: u64, sync: bool) -> Self {
        JournalWriter {
            version,
            sync,
            inner: Mutex::new(WriterState {
                file: Some(file),
                buf: Vec::with_capacity(256),
            }),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Appends one record and flushes it.
    ///
    /// Returns `Ok(false)` once the journal has been closed; the caller
    /// must retry against the successor generation. The record is written
    /// with a single `write_all`, so a crash leaves either the whole record
    /// or a torn tail that replay discards.
    pub fn add(&self, key: &Key, value: &Value) -> Result<bool, JournalError> {
        let mut state = self.inner.lock().expect("journal writer lock");
        let WriterState { file, buf } = &mut *state;
        let file = match file {
            Some(f) => f,
            None => return Ok(false),
        };

        buf.clear();
        write_uvarint(buf, key.internal().len() as u64);
        buf.extend_from_slice(key.internal());
        write_uvarint(buf, value.raw().len() as u64);
        buf.extend_from_slice(value.raw());

        file.write_all(buf)?;
        file.flush()?;
        if self.sync {
            file.sync_data()?;
        }
        Ok(true)
    }

    /// Flushes and closes the underlying file. Safe to call repeatedly.
    pub fn close(&self) -> Result<(), JournalError> {
        let mut state = self.inner.lock().expect("journal writer lock");
        if let Some(mut file) = state.file.take() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("journal writer lock").file.is_none()
    }
}

/// Sequential journal reader.
///
/// Generic over any `Read` implementor so tests can replay from in-memory
/// buffers.
pub struct JournalReader<R: Read> {
    rdr: BufReader<R>,
}

impl JournalReader<File> {
    /// Opens the journal for `version` for replay.
    pub fn open(dir: &Path, version: u64) -> Result<JournalReader<File>, JournalError> {
        let f = File::open(journal_path(dir, version))?;
        Ok(JournalReader { rdr: BufReader::new(f) })
    }
}

impl<R: Read> JournalReader<R> {
    pub fn from_reader(reader: R) -> Self {
        JournalReader { rdr: BufReader::new(reader) }
    }

    /// Replays every fully-written record, calling `apply` for each, and
    /// returns the byte length of the valid prefix.
    ///
    /// Terminates silently on end of file, on a truncated trailing record,
    /// and on a malformed record (absurd length fields): all three mean a
    /// crash interrupted the final write. Genuine I/O errors still
    /// propagate. The returned length is what the file must be truncated
    /// to before appending resumes.
    pub fn replay<F>(&mut self, mut apply: F) -> Result<u64, JournalError>
    where
        F: FnMut(Key, Value),
    {
        let mut valid_bytes: u64 = 0;
        loop {
            let key_len = match read_uvarint(&mut self.rdr) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(valid_bytes),
                Err(e) if e.kind() == io::ErrorKind::InvalidData => return Ok(valid_bytes),
                Err(e) => return Err(e.into()),
            };
            if key_len == 0 || key_len > MAX_REPLAY_KEY_BYTES {
                return Ok(valid_bytes);
            }

            let mut key = vec![0u8; key_len as usize];
            match self.rdr.read_exact(&mut key) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(valid_bytes),
                Err(e) => return Err(e.into()),
            }

            let value_len = match read_uvarint(&mut self.rdr) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(valid_bytes),
                Err(e) if e.kind() == io::ErrorKind::InvalidData => return Ok(valid_bytes),
                Err(e) => return Err(e.into()),
            };
            if value_len == 0 || value_len > MAX_REPLAY_VALUE_BYTES {
                return Ok(valid_bytes);
            }

            let mut value = vec![0u8; value_len as usize];
            match self.rdr.read_exact(&mut value) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(valid_bytes),
                Err(e) => return Err(e.into()),
            }

            valid_bytes += (types::uvarint_len(key_len) + types::uvarint_len(value_len)) as u64
                + key_len
                + value_len;
            apply(Key::from_internal(key), Value::from_raw(value));
        }
    }
}
