//! Growable byte buffer with separate read and write cursors.
//!
//! Each connection owns three of these (receive, send, pending-send).
//! Socket reads land at the write cursor, socket writes drain from the
//! read cursor, and the readable window between them is what the codec
//! layer sees.
//!
//! ## Compaction
//!
//! Long-lived idle connections must not pin large allocations, but
//! compacting on every read would waste cycles. `compact` only shifts and
//! shrinks when capacity exceeds the configured high-water mark while
//! occupancy has fallen under half of it.

#![allow(dead_code)] // Some accessors exist for the embedding application

use std::io::{self, Read, Write};

/// Minimum number of writable bytes guaranteed before a socket read.
const READ_CHUNK: usize = 4 * 1024;

/// Growable byte region with independent read/write cursors.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    /// Capacity threshold above which compaction may shrink the region.
    high_water: usize,
}

impl Buffer {
    /// Create an empty buffer with the given high-water mark.
    pub fn new(high_water: usize) -> Self {
        Self {
            data: Vec::new(),
            read_pos: 0,
            write_pos: 0,
            high_water,
        }
    }

    /// Bytes available to read: write cursor minus read cursor.
    pub fn readable_len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// View of the readable window.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Check whether the readable window is empty.
    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// Current allocated capacity.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Consume `n` readable bytes.
    ///
    /// A fully drained buffer resets both cursors to the origin so the
    /// next write reuses the front of the region.
    pub fn advance_read(&mut self, n: usize) {
        debug_assert!(n <= self.readable_len(), "advance past write cursor");
        self.read_pos += n;
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    /// Snapshot of the write cursor, for later rollback.
    pub fn write_mark(&self) -> usize {
        self.write_pos
    }

    /// Roll the write cursor back to a mark taken earlier.
    ///
    /// Discards everything appended since the mark; used to keep partial
    /// frames from ever becoming visible to a reader.
    pub fn rollback_write(&mut self, mark: usize) {
        debug_assert!(mark >= self.read_pos && mark <= self.write_pos);
        self.write_pos = mark;
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    /// Append bytes at the write cursor.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.data[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
    }

    /// Read once from `reader` into the write cursor.
    ///
    /// Returns the byte count straight from the reader; `Ok(0)` means EOF.
    /// The caller classifies `WouldBlock`.
    pub fn fill_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        self.reserve(READ_CHUNK);
        let n = reader.read(&mut self.data[self.write_pos..])?;
        self.write_pos += n;
        Ok(n)
    }

    /// Write once from the read cursor into `writer`.
    ///
    /// Advances the read cursor by however many bytes the writer accepted.
    pub fn drain_into<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let n = writer.write(&self.data[self.read_pos..self.write_pos])?;
        self.advance_read(n);
        Ok(n)
    }

    /// Move all readable bytes into `other`, leaving this buffer empty.
    pub fn drain_to_buffer(&mut self, other: &mut Buffer) {
        if !self.is_empty() {
            other.extend_from_slice(&self.data[self.read_pos..self.write_pos]);
            self.advance_read(self.readable_len());
        }
    }

    /// Opportunistic compaction after a read cycle.
    ///
    /// Shifts remaining bytes to the origin and shrinks the allocation
    /// back to the high-water mark when the region has grown past it and
    /// occupancy has dropped under half.
    pub fn compact(&mut self) {
        if self.data.len() <= self.high_water {
            return;
        }
        let len = self.readable_len();
        if len >= self.data.len() / 2 {
            return;
        }
        self.data.copy_within(self.read_pos..self.write_pos, 0);
        self.read_pos = 0;
        self.write_pos = len;
        let target = self.high_water.max(len);
        self.data.truncate(target);
        self.data.shrink_to_fit();
    }

    /// Ensure `extra` writable bytes past the write cursor.
    ///
    /// Prefers reclaiming dead space in front of the read cursor over
    /// growing the allocation.
    fn reserve(&mut self, extra: usize) {
        if self.data.len() - self.write_pos >= extra {
            return;
        }
        let len = self.readable_len();
        if self.read_pos > 0 && self.data.len() - len >= extra {
            self.data.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = len;
            return;
        }
        self.data.resize(self.write_pos + extra, 0);
    }
}
