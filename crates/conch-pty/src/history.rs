//! Bounded output history replayed to late subscribers.

use std::collections::VecDeque;

use crate::config::OutputEncoding;
use crate::decoder::is_continuation;

/// The last `capacity` bytes of session output, oldest first.
#[derive(Debug)]
pub struct HistoryBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
    encoding: OutputEncoding,
    /// Total bytes ever appended.
    total_written: u64,
}

impl HistoryBuffer {
    pub fn new(capacity: usize, encoding: OutputEncoding) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(16 * 1024)),
            capacity,
            encoding,
            total_written: 0,
        }
    }

    /// Append output, evicting the oldest bytes once over capacity.
    pub fn append(&mut self, data: &[u8]) {
        self.total_written += data.len() as u64;
        if self.capacity == 0 {
            return;
        }

        // Only the tail of an oversized chunk can survive.
        let data = if data.len() > self.capacity {
            self.buf.clear();
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        self.buf.drain(..overflow);
        self.buf.extend(data);

        // Replay must not open on half a character.
        if self.encoding == OutputEncoding::Utf8 {
            while self.buf.front().is_some_and(|b| is_continuation(*b)) {
                self.buf.pop_front();
            }
        }
    }

    /// Copy out the retained bytes in chronological order.
    pub fn snapshot(&self) -> Vec<u8> {
        let (a, b) = self.buf.as_slices();
        [a, b].concat()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }
}
