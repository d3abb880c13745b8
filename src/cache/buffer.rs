//! Big-endian Record Buffers
//!
//! Cursor-based readers and writers for the fixed-width integers, NUL
//! terminated strings and length-prefixed byte arrays used by shard files
//! and dump files. Reads are bounds checked and fail with
//! [`Error::ShortBuffer`] instead of panicking.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Growable big-endian record writer
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: BytesMut,
}

impl ByteWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer with room for `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Append a big-endian u32
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    /// Append a big-endian u64
    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64(value);
        self
    }

    /// Append raw bytes
    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Append a NUL terminated string
    pub fn put_cstr(&mut self, value: &str) -> &mut Self {
        self.buf.put_slice(value.as_bytes());
        self.buf.put_u8(0);
        self
    }

    /// Append a u32 length followed by the bytes
    pub fn put_len_prefixed(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_u32(bytes.len() as u32);
        self.buf.put_slice(bytes);
        self
    }

    /// Number of bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if nothing has been written
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Discard everything written so far
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Take the written bytes, leaving the writer empty
    pub fn split(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Finish writing
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Bounds-checked big-endian record reader
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    consumed: usize,
}

impl<'a> ByteReader<'a> {
    /// Start reading at the beginning of `buf`
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, consumed: 0 }
    }

    /// Bytes left to read
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Bytes read so far
    #[inline]
    pub fn position(&self) -> usize {
        self.consumed
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(Error::ShortBuffer {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    /// Read a big-endian u32
    pub fn get_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        self.consumed += 4;
        Ok(self.buf.get_u32())
    }

    /// Read a big-endian u64
    pub fn get_u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        self.consumed += 8;
        Ok(self.buf.get_u64())
    }

    /// Read exactly `len` raw bytes
    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.ensure(len)?;
        let buf: &'a [u8] = self.buf;
        let (head, tail) = buf.split_at(len);
        self.buf = tail;
        self.consumed += len;
        Ok(head)
    }

    /// Read a NUL terminated UTF-8 string
    pub fn get_cstr(&mut self) -> Result<&'a str> {
        let buf: &'a [u8] = self.buf;
        let Some(nul) = buf.iter().position(|&b| b == 0) else {
            return Err(Error::ShortBuffer {
                needed: buf.len() + 1,
                remaining: buf.len(),
            });
        };
        let text = std::str::from_utf8(&buf[..nul])
            .map_err(|e| Error::CorruptShard(format!("descriptor is not UTF-8: {e}")))?;
        self.buf = &buf[nul + 1..];
        self.consumed += nul + 1;
        Ok(text)
    }

    /// Read a u32 length followed by that many bytes
    pub fn get_len_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.get_bytes(len)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_big_endian_layout() {
        let mut writer = ByteWriter::new();
        writer.put_u32(0x0102_0304).put_u64(5);
        let bytes = writer.freeze();

        assert_eq!(&bytes[..4], &[1, 2, 3, 4]);
        assert_eq!(&bytes[4..], &[0, 0, 0, 0, 0, 0, 0, 5]);
    }

    #[test]
    fn test_cstr_is_nul_terminated() {
        let mut writer = ByteWriter::new();
        writer.put_cstr("tile").put_u32(7);
        let bytes = writer.freeze();
        assert_eq!(&bytes[..5], b"tile\0");

        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.get_cstr().unwrap(), "tile");
        assert_eq!(reader.position(), 5);
        assert_eq!(reader.get_u32().unwrap(), 7);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_short_reads_fail_cleanly() {
        let mut reader = ByteReader::new(&[0, 0, 1]);
        assert_matches!(
            reader.get_u32(),
            Err(Error::ShortBuffer { needed: 4, remaining: 3 })
        );
        // Failed reads do not consume.
        assert_eq!(reader.remaining(), 3);
        assert_matches!(reader.get_cstr(), Ok(""));
        assert_matches!(reader.get_u64(), Err(Error::ShortBuffer { .. }));
    }

    #[test]
    fn test_unterminated_string() {
        let mut reader = ByteReader::new(b"abc");
        assert_matches!(reader.get_cstr(), Err(Error::ShortBuffer { .. }));
    }

    #[test]
    fn test_len_prefixed_overrun() {
        let mut writer = ByteWriter::new();
        writer.put_u32(100).put_bytes(b"short");
        let bytes = writer.freeze();

        let mut reader = ByteReader::new(&bytes);
        assert_matches!(
            reader.get_len_prefixed(),
            Err(Error::ShortBuffer { needed: 100, remaining: 5 })
        );
    }
}
