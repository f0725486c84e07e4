//! Byte-level primitives shared by every layer of the storage engine.
//!
//! [`ByteArray`] is an immutable, memcmp-ordered byte buffer. [`Key`] is a
//! user key plus one trailing sequence byte (sequence 0 is the primary
//! record for a key; 1..N are the chunks of a multi-part value, which sort
//! immediately after their descriptor). [`Value`] is a flag-tagged payload
//! whose first on-disk byte is the [`ValueFlag`].
//!
//! All three wrap [`bytes::Bytes`], so cloning a key or value anywhere in
//! the engine (memtable snapshots, cached blocks, manifest key ranges) is a
//! reference-count bump, never a copy.

use bytes::Bytes;
use std::fmt;

pub mod varint;

pub use varint::{read_uvarint, read_uvarint_slice, uvarint_len, write_uvarint};

/// Immutable byte buffer ordered by lexicographic byte comparison.
///
/// Ties between buffers where one is a prefix of the other are broken by
/// length (the shorter sorts first), which is exactly what slice ordering
/// gives us. Equality and hashing are content-derived.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteArray(Bytes);

impl ByteArray {
    pub fn new(data: impl Into<Bytes>) -> Self {
        ByteArray(data.into())
    }

    pub fn copy_from(data: &[u8]) -> Self {
        ByteArray(Bytes::copy_from_slice(data))
    }

    pub fn empty() -> Self {
        ByteArray(Bytes::new())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl fmt::Debug for ByteArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteArray(")?;
        for b in self.0.iter().take(24) {
            write!(f, "{:02x}", b)?;
        }
        if self.0.len() > 24 {
            write!(f, "..+{}", self.0.len() - 24)?;
        }
        write!(f, ")")
    }
}

impl From<Vec<u8>> for ByteArray {
    fn from(v: Vec<u8>) -> Self {
        ByteArray(Bytes::from(v))
    }
}

impl From<&[u8]> for ByteArray {
    fn from(v: &[u8]) -> Self {
        ByteArray::copy_from(v)
    }
}

/// A storage key: the user's key bytes plus one trailing sequence byte.
///
/// The ordering is byte-wise over the full internal representation, so all
/// sequence numbers of one user key are adjacent and sorted by sequence.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(ByteArray);

impl Key {
    /// Builds a key from user bytes and an explicit sequence number.
    pub fn new(user_key: &[u8], seq: u8) -> Self {
        let mut buf = Vec::with_capacity(user_key.len() + 1);
        buf.extend_from_slice(user_key);
        buf.push(seq);
        Key(ByteArray::from(buf))
    }

    /// The sequence-0 key: the primary record (or large-value descriptor).
    pub fn primary(user_key: &[u8]) -> Self {
        Key::new(user_key, 0)
    }

    /// Rebuilds a key from its on-disk internal representation.
    ///
    /// The representation must be at least one byte (the sequence byte).
    pub fn from_internal(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        debug_assert!(!bytes.is_empty(), "internal key representation is never empty");
        Key(ByteArray(bytes))
    }

    /// Full internal representation (user key + sequence byte).
    pub fn internal(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn internal_bytes(&self) -> Bytes {
        self.0 .0.clone()
    }

    /// The user-visible portion of the key.
    pub fn user_key(&self) -> &[u8] {
        let s = self.0.as_slice();
        &s[..s.len() - 1]
    }

    pub fn seq(&self) -> u8 {
        *self.0.as_slice().last().expect("key has a sequence byte")
    }

    /// Same user key, different sequence number.
    pub fn with_seq(&self, seq: u8) -> Self {
        Key::new(self.user_key(), seq)
    }

    /// Internal length in bytes (user key + sequence byte).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(self.user_key()) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => {
                write!(f, "Key({:?}#{})", s, self.seq())
            }
            _ => write!(f, "Key({:?}#{})", ByteArray::copy_from(self.user_key()), self.seq()),
        }
    }
}

/// Interpretation of the first byte of a value's on-disk payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFlag {
    /// The key never existed. Never written to disk; the in-memory
    /// representation is an empty payload.
    Null,
    /// Tombstone: the key was deleted.
    Deleted,
    /// The data fits in a single record.
    SmallValue,
    /// First record of a multi-part value; payload is the little-endian
    /// total byte length of the reassembled data.
    LargeValueDescriptor,
    /// One chunk of a multi-part value.
    LargeValueChunk,
}

impl ValueFlag {
    pub const DELETED: u8 = 0x01;
    pub const SMALL_VALUE: u8 = 0x02;
    pub const LARGE_VALUE_DESCRIPTOR: u8 = 0x03;
    pub const LARGE_VALUE_CHUNK: u8 = 0x04;

    pub fn from_byte(b: u8) -> Option<ValueFlag> {
        match b {
            Self::DELETED => Some(ValueFlag::Deleted),
            Self::SMALL_VALUE => Some(ValueFlag::SmallValue),
            Self::LARGE_VALUE_DESCRIPTOR => Some(ValueFlag::LargeValueDescriptor),
            Self::LARGE_VALUE_CHUNK => Some(ValueFlag::LargeValueChunk),
            _ => None,
        }
    }
}

/// A flag-tagged value. The raw representation (what the journal and block
/// tables store) is `[flag: u8][payload ...]`; a `Null` value is the empty
/// buffer and never reaches disk.
#[derive(Clone, PartialEq, Eq)]
pub struct Value(Bytes);

impl Value {
    pub fn small(data: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(data.len() + 1);
        buf.push(ValueFlag::SMALL_VALUE);
        buf.extend_from_slice(data);
        Value(Bytes::from(buf))
    }

    pub fn tombstone() -> Self {
        Value(Bytes::from_static(&[ValueFlag::DELETED]))
    }

    pub fn large_descriptor(total_len: u32) -> Self {
        let mut buf = Vec::with_capacity(5);
        buf.push(ValueFlag::LARGE_VALUE_DESCRIPTOR);
        buf.extend_from_slice(&total_len.to_le_bytes());
        Value(Bytes::from(buf))
    }

    pub fn large_chunk(data: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(data.len() + 1);
        buf.push(ValueFlag::LARGE_VALUE_CHUNK);
        buf.extend_from_slice(data);
        Value(Bytes::from(buf))
    }

    pub fn null() -> Self {
        Value(Bytes::new())
    }

    /// Rebuilds a value from its raw on-disk representation.
    pub fn from_raw(bytes: impl Into<Bytes>) -> Self {
        Value(bytes.into())
    }

    /// The flag, or `None` if the first byte is not a known flag
    /// (a corruption signal for callers reading from disk).
    pub fn flag(&self) -> Option<ValueFlag> {
        match self.0.first() {
            None => Some(ValueFlag::Null),
            Some(&b) => ValueFlag::from_byte(b),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.flag() == Some(ValueFlag::Deleted)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_empty()
    }

    /// Payload bytes after the flag. Empty for `Null` and tombstones.
    pub fn payload(&self) -> &[u8] {
        if self.0.is_empty() {
            &[]
        } else {
            &self.0[1..]
        }
    }

    /// Zero-copy payload slice.
    pub fn payload_bytes(&self) -> Bytes {
        if self.0.is_empty() {
            Bytes::new()
        } else {
            self.0.slice(1..)
        }
    }

    /// Total length of a multi-part value, read from a descriptor payload.
    pub fn descriptor_len(&self) -> Option<u32> {
        if self.flag() != Some(ValueFlag::LargeValueDescriptor) {
            return None;
        }
        let p = self.payload();
        if p.len() != 4 {
            return None;
        }
        Some(u32::from_le_bytes([p[0], p[1], p[2], p[3]]))
    }

    /// Raw on-disk representation (flag byte + payload).
    pub fn raw(&self) -> &[u8] {
        &self.0
    }

    pub fn raw_bytes(&self) -> Bytes {
        self.0.clone()
    }

    /// Raw length, used for memtable size accounting.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.flag() {
            Some(ValueFlag::Null) => write!(f, "Value(Null)"),
            Some(ValueFlag::Deleted) => write!(f, "Value(Deleted)"),
            Some(ValueFlag::SmallValue) => {
                write!(f, "Value(Small, {} bytes)", self.payload().len())
            }
            Some(ValueFlag::LargeValueDescriptor) => {
                write!(f, "Value(Descriptor, total {:?})", self.descriptor_len())
            }
            Some(ValueFlag::LargeValueChunk) => {
                write!(f, "Value(Chunk, {} bytes)", self.payload().len())
            }
            None => write!(f, "Value(invalid flag {:#04x})", self.0[0]),
        }
    }
}
