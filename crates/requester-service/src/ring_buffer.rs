//! A fixed-capacity circular buffer addressed by recency.
//!
//! The [`RingBuffer`] keeps the last `capacity` appended items. Items are addressed by their
//! recency rank, where index `0` is the most recently appended item. Once the buffer is full,
//! every [`append`](RingBuffer::append) overwrites the oldest item. Reading an item never
//! changes its rank.

use std::fmt;
use std::num::NonZeroUsize;

use thiserror::Error;

/// Returned by [`RingBuffer::item`] for an index that does not address a live item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{index} is not a valid index for an element in this buffer")]
pub struct IndexOutOfRange {
    /// The offending recency index.
    pub index: usize,
}

/// A fixed-capacity buffer that retains the most recently appended items.
pub struct RingBuffer<T> {
    slots: Box<[Option<T>]>,
    /// The slot written by the next `append`. Once the buffer is full, this is also the
    /// slot holding the oldest item.
    head: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    /// Creates an empty buffer that holds at most `capacity` items.
    pub fn new(capacity: NonZeroUsize) -> Self {
        let slots = std::iter::repeat_with(|| None)
            .take(capacity.get())
            .collect();

        Self {
            slots,
            head: 0,
            len: 0,
        }
    }

    /// Appends `item` as the most recent item, overwriting the oldest one if the buffer is full.
    pub fn append(&mut self, item: T) {
        let capacity = self.capacity();

        self.slots[self.head] = Some(item);
        self.head = (self.head + 1) % capacity;
        if self.len < capacity {
            self.len += 1;
        }
    }

    /// Returns the item at recency rank `index`, `0` being the most recently appended one.
    pub fn item(&self, index: usize) -> Result<&T, IndexOutOfRange> {
        if index >= self.len {
            return Err(IndexOutOfRange { index });
        }

        // `index < len <= capacity`, so this never underflows.
        let capacity = self.capacity();
        let pos = (self.head + capacity - 1 - index) % capacity;

        self.slots[pos].as_ref().ok_or(IndexOutOfRange { index })
    }

    /// The number of items currently held.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The maximum number of items this buffer retains.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Iterates over all held items, most recent first.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(|index| self.item(index).ok())
    }
}

impl<T: fmt::Debug> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
