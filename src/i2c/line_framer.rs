//! Circular line buffer
//!
//! Turns a byte stream into `\n`-terminated lines without shifting bytes
//! around. Scanning resumes where the previous call stopped, so a long line
//! arriving in small chunks is only walked once.

use super::source::ByteSource;
use crate::error::{Error, Result};

/// Fixed-capacity ring buffer that yields complete lines from a [`ByteSource`].
///
/// Cursor invariants:
/// - `read == None` iff the buffer holds no bytes
/// - `read == Some(write)` iff the buffer is completely full
/// - buffered data occupies `[read, write)` modulo capacity
pub struct LineFramer<S> {
    source: S,
    data: Box<[u8]>,
    write: usize,       // Next free slot
    read: Option<usize>, // First buffered byte
    scanned: usize,     // Bytes past `read` already checked for a terminator
}

impl<S: ByteSource> LineFramer<S> {
    /// Create a framer with `capacity` bytes of buffer (at least 1).
    pub fn new(source: S, capacity: usize) -> Self {
        Self {
            source,
            data: vec![0u8; capacity.max(1)].into_boxed_slice(),
            write: 0,
            read: None,
            scanned: 0,
        }
    }

    /// Read the next line, terminator included.
    ///
    /// Returns `Ok(None)` once the source reports end of stream and no
    /// complete line remains. A full buffer without a terminator is
    /// [`Error::BufferOverflow`].
    pub fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            if self.is_full() {
                return Err(Error::BufferOverflow {
                    capacity: self.capacity(),
                });
            }
            if !self.fill()? {
                return Ok(None);
            }
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of buffered bytes not yet returned as a line
    pub fn len(&self) -> usize {
        match self.read {
            None => 0,
            Some(read) if read < self.write => self.write - read,
            Some(read) => self.capacity() - read + self.write,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read.is_none()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.read == Some(self.write)
    }

    /// Find a terminator among the unscanned bytes and cut the line out.
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let read = self.read?;
        let cap = self.capacity();
        let unscanned = self.len() - self.scanned;
        let start = (read + self.scanned) % cap;

        // Unscanned bytes form at most two contiguous segments
        let first_len = unscanned.min(cap - start);
        let found = match self.data[start..start + first_len]
            .iter()
            .position(|&b| b == b'\n')
        {
            Some(pos) => Some(self.scanned + pos),
            None => self.data[..unscanned - first_len]
                .iter()
                .position(|&b| b == b'\n')
                .map(|pos| self.scanned + first_len + pos),
        };

        let Some(offset) = found else {
            self.scanned += unscanned;
            return None;
        };

        let line_len = offset + 1;
        let end = read + line_len;
        let mut line = Vec::with_capacity(line_len);
        if end <= cap {
            line.extend_from_slice(&self.data[read..end]);
        } else {
            line.extend_from_slice(&self.data[read..]);
            line.extend_from_slice(&self.data[..end - cap]);
        }

        let next = end % cap;
        self.scanned = 0;
        if next == self.write {
            self.read = None;
            self.write = 0;
        } else {
            self.read = Some(next);
        }
        Some(line)
    }

    /// Pull bytes into the free contiguous run. Returns `false` at end of stream.
    fn fill(&mut self) -> Result<bool> {
        let cap = self.capacity();
        let (start, end) = match self.read {
            None => {
                self.write = 0;
                (0, cap)
            }
            Some(read) if read < self.write => (self.write, cap),
            Some(read) => (self.write, read),
        };

        let n = self.source.read(&mut self.data[start..end])?;
        if n == 0 {
            return Ok(false);
        }
        let n = n.min(end - start);

        if self.read.is_none() {
            self.read = Some(start);
        }
        self.write = (start + n) % cap;
        Ok(true)
    }
}
