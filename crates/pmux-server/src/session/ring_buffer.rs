//! Circular output buffer with single-use replay markers.
//!
//! Stores the last N bytes of a pane's output. A marker remembers the write
//! position at the time it was set, so a reconnecting client can ask for
//! "everything since the marker" instead of a full screen dump.

use std::collections::HashMap;

/// A fixed-capacity circular byte buffer.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    capacity: usize,
    /// Write position (wraps around).
    write_pos: usize,
    /// Total bytes ever written (used to detect wrap).
    total_written: u64,
    /// Marker id -> offset, or `None` once the buffer has wrapped past it.
    markers: HashMap<u64, Option<usize>>,
}

impl RingBuffer {
    /// Create a new ring buffer with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            capacity,
            write_pos: 0,
            total_written: 0,
            markers: HashMap::new(),
        }
    }

    /// Append data, overwriting the oldest bytes once full.
    ///
    /// A marker is invalidated when the write position, advancing through
    /// this append, lands back on the marker's offset.
    pub fn append(&mut self, data: &[u8]) {
        if self.capacity == 0 || data.is_empty() {
            return;
        }

        self.invalidate_covered(self.write_pos, data.len());

        // Only the trailing `capacity` bytes can survive.
        let skip = data.len().saturating_sub(self.capacity);
        let tail = &data[skip..];
        let start = (self.write_pos + skip) % self.capacity;
        let first = tail.len().min(self.capacity - start);
        self.buf[start..start + first].copy_from_slice(&tail[..first]);
        self.buf[..tail.len() - first].copy_from_slice(&tail[first..]);

        self.write_pos = (self.write_pos + data.len()) % self.capacity;
        self.total_written += data.len() as u64;
    }

    fn invalidate_covered(&mut self, start: usize, len: usize) {
        let capacity = self.capacity;
        for offset in self.markers.values_mut() {
            let Some(o) = *offset else { continue };
            let distance = (o + capacity - start) % capacity;
            if len >= capacity || (1..=len).contains(&distance) {
                *offset = None;
            }
        }
    }

    /// Record the current write position under `id`, replacing any previous
    /// marker with the same id.
    pub fn mark(&mut self, id: u64) {
        self.markers.insert(id, Some(self.write_pos));
    }

    /// Bytes written since `marker`, oldest first.
    ///
    /// With no marker, or one that is unknown or was invalidated, returns
    /// everything still held. The marker is removed either way.
    pub fn take_since(&mut self, marker: Option<u64>) -> Vec<u8> {
        let offset = marker.and_then(|id| self.markers.remove(&id)).flatten();
        match offset {
            Some(o) if o <= self.write_pos => self.buf[o..self.write_pos].to_vec(),
            Some(o) => {
                let mut result = Vec::with_capacity(self.capacity - o + self.write_pos);
                result.extend_from_slice(&self.buf[o..]);
                result.extend_from_slice(&self.buf[..self.write_pos]);
                result
            }
            None => self.read_all(),
        }
    }

    /// Read all buffered data in chronological order.
    ///
    /// Returns up to `capacity` bytes, starting from the oldest data.
    pub fn read_all(&self) -> Vec<u8> {
        if self.total_written == 0 {
            return Vec::new();
        }

        let len = self.len();
        let mut result = Vec::with_capacity(len);

        if self.total_written <= self.capacity as u64 {
            // Not wrapped yet: data starts at 0
            result.extend_from_slice(&self.buf[..len]);
        } else {
            // Wrapped: oldest data starts at write_pos
            result.extend_from_slice(&self.buf[self.write_pos..]);
            result.extend_from_slice(&self.buf[..self.write_pos]);
        }

        result
    }

    /// Number of valid bytes currently stored.
    pub fn len(&self) -> usize {
        if self.total_written >= self.capacity as u64 {
            self.capacity
        } else {
            self.total_written as usize
        }
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.total_written == 0
    }

    /// Number of markers not yet taken.
    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_write_read() {
        let mut rb = RingBuffer::new(10);
        rb.append(b"hello");
        assert_eq!(rb.read_all(), b"hello");
        assert_eq!(rb.len(), 5);
    }

    #[test]
    fn wrap_around() {
        let mut rb = RingBuffer::new(5);
        rb.append(b"abcde"); // fills exactly
        rb.append(b"fg"); // overwrites a, b
        assert_eq!(rb.read_all(), b"cdefg");
        assert_eq!(rb.len(), 5);
    }

    #[test]
    fn oversized_append_keeps_the_tail() {
        let mut rb = RingBuffer::new(4);
        rb.append(b"ab");
        rb.append(b"0123456");
        assert_eq!(rb.read_all(), b"3456");
    }

    #[test]
    fn empty_buffer() {
        let mut rb = RingBuffer::new(10);
        assert!(rb.is_empty());
        assert_eq!(rb.read_all(), Vec::<u8>::new());
        assert_eq!(rb.take_since(None), Vec::<u8>::new());
    }

    #[test]
    fn zero_capacity() {
        let mut rb = RingBuffer::new(0);
        rb.append(b"test");
        rb.mark(1);
        assert!(rb.is_empty());
        assert_eq!(rb.take_since(Some(1)), Vec::<u8>::new());
    }

    #[test]
    fn take_right_after_mark_is_empty() {
        let mut rb = RingBuffer::new(8);
        rb.append(b"abcdefghij");
        rb.mark(1);
        assert_eq!(rb.take_since(Some(1)), Vec::<u8>::new());
    }

    #[test]
    fn take_returns_bytes_since_mark() {
        let mut rb = RingBuffer::new(16);
        rb.append(b"before");
        rb.mark(1);
        rb.append(b"after");
        assert_eq!(rb.take_since(Some(1)), b"after");
    }

    #[test]
    fn take_since_mark_across_the_seam() {
        let mut rb = RingBuffer::new(5);
        rb.append(b"abc");
        rb.mark(1);
        rb.append(b"defg");
        assert_eq!(rb.take_since(Some(1)), b"defg");
    }

    #[test]
    fn markers_are_single_use() {
        let mut rb = RingBuffer::new(16);
        rb.append(b"one");
        rb.mark(7);
        rb.append(b"two");
        assert_eq!(rb.take_since(Some(7)), b"two");
        assert_eq!(rb.marker_count(), 0);
        // Second take falls back to everything held.
        assert_eq!(rb.take_since(Some(7)), b"onetwo");
    }

    #[test]
    fn mark_overwrites_same_id() {
        let mut rb = RingBuffer::new(16);
        rb.mark(1);
        rb.append(b"xx");
        rb.mark(1);
        rb.append(b"yy");
        assert_eq!(rb.take_since(Some(1)), b"yy");
    }

    #[test]
    fn full_wrap_invalidates_marker() {
        let mut rb = RingBuffer::new(5);
        rb.append(b"abc");
        rb.mark(1);
        rb.append(b"defgh");
        let everything = rb.read_all();
        assert_eq!(rb.take_since(Some(1)), everything);
        assert_eq!(rb.take_since(Some(99)), everything);
    }

    #[test]
    fn marker_invalidated_partway_through_an_append() {
        let mut rb = RingBuffer::new(5);
        rb.append(b"abc");
        rb.mark(1);
        rb.append(b"de");
        // Cursor goes 0 -> 1 -> 2 -> 3; lands on the marker at the last byte.
        rb.append(b"fgh");
        assert_eq!(rb.take_since(Some(1)), b"defgh");
        assert_eq!(rb.marker_count(), 0);
    }

    #[test]
    fn marker_survives_append_that_stops_short() {
        let mut rb = RingBuffer::new(5);
        rb.append(b"abc");
        rb.mark(1);
        rb.append(b"de");
        rb.append(b"fg");
        assert_eq!(rb.take_since(Some(1)), b"defg");
    }

    #[test]
    fn everything_branch_excludes_unwritten_tail() {
        let mut rb = RingBuffer::new(100);
        rb.append(b"short");
        assert_eq!(rb.take_since(None), b"short");
    }
}
