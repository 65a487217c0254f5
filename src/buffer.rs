//! Outbound byte buffer.

use std::io::{self, Read};

use bytes::{BufMut, BytesMut};

/// The chunk size used when refilling from a file stream, and the floor for
/// capacity growth. One buffer worth is also the most we try to push to a
/// socket per write-ready event.
pub(crate) const CHUNK_SIZE: usize = 32 * 1024;

/// Append-only byte buffer with amortized growth.
///
/// Used for the per-connection send buffer and for assembling frames. The
/// owner tracks how much of it has already been flushed; `clear` resets the
/// buffer once fully drained, keeping the allocation.
pub(crate) struct ByteBuffer {
    bytes: BytesMut,
}

impl ByteBuffer {
    pub(crate) fn new() -> ByteBuffer {
        ByteBuffer {
            bytes: BytesMut::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        self.bytes.as_ref()
    }

    pub(crate) fn append(&mut self, data: &[u8]) {
        if self.bytes.remaining_mut() < data.len() {
            // Round reservations up to a chunk so repeated small appends
            // don't trigger repeated reallocation.
            self.bytes.reserve(data.len().max(CHUNK_SIZE));
        }
        self.bytes.extend_from_slice(data);
    }

    /// Appends up to one chunk read from `src`. Returns the number of bytes
    /// read; 0 means EOF.
    pub(crate) fn fill_from(&mut self, src: &mut impl Read) -> io::Result<usize> {
        let mut chunk = [0u8; CHUNK_SIZE];
        let n = src.read(&mut chunk)?;
        if n > 0 {
            self.append(&chunk[..n]);
        }
        Ok(n)
    }

    pub(crate) fn clear(&mut self) {
        self.bytes.clear();
    }
}

impl std::fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn append_and_clear() {
        let mut buf = ByteBuffer::new();
        assert!(buf.is_empty());
        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.as_slice(), b"hello world");
        assert_eq!(buf.len(), 11);
        buf.clear();
        assert!(buf.is_empty());
    }

    #[test]
    fn fill_from_reads_at_most_one_chunk() {
        let big = vec![0x42u8; CHUNK_SIZE * 2 + 17];
        let mut src = Cursor::new(big);
        let mut buf = ByteBuffer::new();

        assert_eq!(buf.fill_from(&mut src).unwrap(), CHUNK_SIZE);
        assert_eq!(buf.fill_from(&mut src).unwrap(), CHUNK_SIZE);
        assert_eq!(buf.fill_from(&mut src).unwrap(), 17);
        assert_eq!(buf.fill_from(&mut src).unwrap(), 0, "eof");
        assert_eq!(buf.len(), CHUNK_SIZE * 2 + 17);
    }

    #[test]
    fn growth_is_amortized() {
        let mut buf = ByteBuffer::new();
        for _ in 0..10_000 {
            buf.append(b"0123456789abcdef");
        }
        assert_eq!(buf.len(), 160_000);
    }
}
