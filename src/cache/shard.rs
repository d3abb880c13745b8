//! Shard Index Files
//!
//! A shard maps descriptors to the location of their blob inside one data
//! file. Each data file has `nbr_hash` shards; a descriptor always lives in
//! the shard chosen by its bucket.
//!
//! # On-disk Format
//!
//! ```text
//! ┌──────────────┬──────────────┬─────────────────────────────────────────┐
//! │ u32 body_len │ u32 count    │ count × { cstr desc │ u64 off │ u32 len } │
//! └──────────────┴──────────────┴─────────────────────────────────────────┘
//!                 ◀──────────────────── body_len bytes ───────────────────▶
//! ```
//!
//! All integers are big-endian. Entries are written in descriptor order;
//! on load a later entry for the same descriptor wins.

use std::collections::BTreeMap;

use bytes::Bytes;

use super::buffer::{ByteReader, ByteWriter};
use super::descriptor::Descriptor;
use crate::error::{Error, Result};

/// Size of the body length prefix
pub const SHARD_LENGTH_PREFIX: usize = 4;

/// Largest body length accepted when loading a shard (64MB)
pub const MAX_SHARD_BODY_LEN: usize = 64 * 1024 * 1024;

/// Fixed bytes per entry besides the descriptor text (NUL + offset + length)
const ENTRY_OVERHEAD: usize = 1 + 8 + 4;

/// Location of one blob inside one data file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardEntry {
    /// Byte offset of the blob in the data file
    pub offset: u64,
    /// Length of the blob in bytes
    pub length: u32,
}

impl ShardEntry {
    /// Create an entry
    pub fn new(offset: u64, length: u32) -> Self {
        Self { offset, length }
    }

    /// First byte past the blob, `None` if the entry overflows a u64
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(u64::from(self.length))
    }
}

/// In-memory form of one shard
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardIndex {
    entries: BTreeMap<Descriptor, ShardEntry>,
}

impl ShardIndex {
    /// Create an empty shard
    pub fn new() -> Self {
        Self::default()
    }

    /// Location of `descriptor`, if indexed
    pub fn get(&self, descriptor: &Descriptor) -> Option<ShardEntry> {
        self.entries.get(descriptor).copied()
    }

    /// Insert or overwrite the entry for `descriptor`
    pub fn insert(&mut self, descriptor: Descriptor, entry: ShardEntry) -> Option<ShardEntry> {
        self.entries.insert(descriptor, entry)
    }

    /// Erase the entry for `descriptor`
    pub fn remove(&mut self, descriptor: &Descriptor) -> Option<ShardEntry> {
        self.entries.remove(descriptor)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the shard has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in descriptor order
    pub fn iter(&self) -> impl Iterator<Item = (&Descriptor, &ShardEntry)> {
        self.entries.iter()
    }

    /// Size of the encoded shard including the length prefix
    pub fn encoded_len(&self) -> usize {
        SHARD_LENGTH_PREFIX
            + 4
            + self
                .entries
                .keys()
                .map(|d| d.len() + ENTRY_OVERHEAD)
                .sum::<usize>()
    }

    /// Serialize the whole shard, length prefix included
    pub fn encode(&self) -> Bytes {
        let total = self.encoded_len();
        let mut writer = ByteWriter::with_capacity(total);
        writer.put_u32((total - SHARD_LENGTH_PREFIX) as u32);
        writer.put_u32(self.entries.len() as u32);
        for (descriptor, entry) in &self.entries {
            writer
                .put_cstr(descriptor.as_str())
                .put_u64(entry.offset)
                .put_u32(entry.length);
        }
        writer.freeze()
    }

    /// Decode a shard body (everything after the length prefix)
    pub fn decode_body(body: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(body);
        let count = reader.get_u32()? as usize;
        if count > reader.remaining() / ENTRY_OVERHEAD {
            return Err(Error::CorruptShard(format!(
                "{count} entries cannot fit in {} bytes",
                reader.remaining()
            )));
        }

        let mut shard = Self::new();
        for _ in 0..count {
            let descriptor = Descriptor::new(reader.get_cstr()?)?;
            let offset = reader.get_u64()?;
            let length = reader.get_u32()?;
            shard.insert(descriptor, ShardEntry::new(offset, length));
        }
        Ok(shard)
    }

    /// Decode a complete shard file
    pub fn decode(file: &[u8]) -> Result<Self> {
        let body_len = parse_length_prefix(file).ok_or(Error::ShortBuffer {
            needed: SHARD_LENGTH_PREFIX,
            remaining: file.len(),
        })?;
        let mut reader = ByteReader::new(&file[SHARD_LENGTH_PREFIX..]);
        Self::decode_body(reader.get_bytes(body_len)?)
    }
}

/// Body length announced by a shard file prefix
///
/// `None` when fewer than four bytes are available.
pub fn parse_length_prefix(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < SHARD_LENGTH_PREFIX {
        return None;
    }
    ByteReader::new(bytes).get_u32().ok().map(|len| len as usize)
}

// =============================================================================
// Tests
// =============================================================================
