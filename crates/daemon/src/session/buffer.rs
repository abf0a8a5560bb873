//! Bounded output history for replay on attach.

use std::collections::VecDeque;

/// Default number of bytes retained per session.
pub const DEFAULT_BUFFER_CAPACITY: usize = 50_000;

/// Ring of the most recent output bytes of a session.
///
/// Appending beyond the capacity drops the oldest bytes, so a snapshot is
/// always a suffix of everything the process ever wrote.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    total_written: u64,
}

impl OutputBuffer {
    /// Creates an empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity.min(DEFAULT_BUFFER_CAPACITY)),
            capacity,
            total_written: 0,
        }
    }

    /// Appends a chunk, evicting from the front as needed.
    pub fn push(&mut self, chunk: &[u8]) {
        self.total_written += chunk.len() as u64;

        if chunk.len() >= self.capacity {
            self.data.clear();
            self.data.extend(&chunk[chunk.len() - self.capacity..]);
            return;
        }

        let overflow = (self.data.len() + chunk.len()).saturating_sub(self.capacity);
        self.data.drain(..overflow);
        self.data.extend(chunk);
    }

    /// Copies out the retained bytes, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        let (front, back) = self.data.as_slices();
        let mut out = Vec::with_capacity(self.data.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        out
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes ever pushed, including evicted ones.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}
