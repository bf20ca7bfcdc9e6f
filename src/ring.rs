//! Bounded FIFO that keeps the newest entries.
//!
//! Thin layer over `heapless::Deque`: pushing into a full buffer drops
//! the oldest entry, and `front_run` exposes the oldest entries only up
//! to the physical end of the storage so callers can send them as one
//! contiguous block.

use heapless::Deque;

pub struct RingBuffer<T, const N: usize> {
    inner: Deque<T, N>,
}

impl<T: Copy, const N: usize> RingBuffer<T, N> {
    pub const fn new() -> Self {
        Self {
            inner: Deque::new(),
        }
    }

    /// Append `item`, returning the entry evicted to make room, if any.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.inner.is_full() {
            self.inner.pop_front()
        } else {
            None
        };
        // Cannot fail: there is room after the eviction above.
        let _ = self.inner.push_back(item);
        evicted
    }

    pub fn pop(&mut self) -> Option<T> {
        let item = self.inner.pop_front();
        if self.inner.is_empty() {
            self.inner.clear();
        }
        item
    }

    /// Up to `max` oldest entries, stopping at the physical end of the
    /// buffer. Entries past the wrap point come out on the next call.
    pub fn front_run(&self, max: usize) -> &[T] {
        let (head, _) = self.inner.as_slices();
        &head[..head.len().min(max)]
    }

    /// Drop the `n` oldest entries.
    pub fn consume(&mut self, n: usize) {
        for _ in 0..n {
            if self.pop().is_none() {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Empty the buffer and rewind it to the start of storage.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.inner.iter()
    }
}

impl<T: Copy, const N: usize> Default for RingBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
