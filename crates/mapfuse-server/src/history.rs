//! Fixed-capacity rolling history.
//!
//! [`RingBuffer`] is an index-addressed arena: `capacity` slots allocated up
//! front, a head index and a length.  Pushing into a full buffer evicts and
//! returns the oldest element in O(1); nothing is ever removed from the
//! middle.

/// A fixed-capacity ring of `T`, oldest first.
#[derive(Debug)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    /// Slot of the oldest element.
    head: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    /// Create an empty ring holding at most `capacity` elements (at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, head: 0, len: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Append `value` as the newest element, returning the evicted oldest
    /// element when the ring was full.
    pub fn push(&mut self, value: T) -> Option<T> {
        let cap = self.capacity();
        if self.len < cap {
            let slot = (self.head + self.len) % cap;
            self.slots[slot] = Some(value);
            self.len += 1;
            None
        } else {
            let evicted = self.slots[self.head].replace(value);
            self.head = (self.head + 1) % cap;
            evicted
        }
    }

    /// Element `index` counted from the oldest.
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        self.slots[(self.head + index) % self.capacity()].as_ref()
    }

    pub fn oldest(&self) -> Option<&T> {
        self.get(0)
    }

    pub fn newest(&self) -> Option<&T> {
        self.len.checked_sub(1).and_then(|i| self.get(i))
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |i| self.get(i))
    }

    /// Drop every element, keeping the allocation.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }
}
