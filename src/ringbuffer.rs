// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A fixed-capacity, pre-allocated circular buffer.
//!
//! Rate calculations and sparklines need in-order access to recent samples;
//! bounded memory per series is a hard requirement; allocating on every
//! sample is not acceptable. `RingBuffer::add` never allocates after
//! construction.

/// A fixed-capacity circular buffer over a value type `T`.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    storage: Vec<Option<T>>,
    head: usize,
    count: usize,
}

impl<T: Clone> RingBuffer<T> {
    /// Create a buffer with the given capacity. A capacity of zero is
    /// coerced up to one.
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            storage: vec![None; cap],
            head: 0,
            count: 0,
        }
    }

    /// Capacity of the buffer (fixed for its lifetime).
    pub fn cap(&self) -> usize {
        self.storage.len()
    }

    /// Number of live elements, `<= cap`.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Whether the buffer is at capacity (the next `add` overwrites the
    /// oldest element).
    pub fn is_full(&self) -> bool {
        self.count == self.cap()
    }

    /// Append a value, overwriting the oldest element once full. O(1), no
    /// allocation.
    pub fn add(&mut self, value: T) {
        let cap = self.cap();
        self.storage[self.head] = Some(value);
        self.head = (self.head + 1) % cap;
        if self.count < cap {
            self.count += 1;
        }
    }

    /// The oldest live element.
    pub fn first(&self) -> Option<&T> {
        self.get(0)
    }

    /// The newest live element.
    pub fn last(&self) -> Option<&T> {
        if self.count == 0 {
            return None;
        }
        self.get(self.count - 1)
    }

    /// Fetch the `i`-th oldest element (`0` = oldest, `len()-1` = newest).
    /// Out-of-bounds indices return `None`.
    pub fn get(&self, i: usize) -> Option<&T> {
        if i >= self.count {
            return None;
        }
        let cap = self.cap();
        let start = (self.head + cap - self.count) % cap;
        let idx = (start + i) % cap;
        self.storage[idx].as_ref()
    }

    /// Allocate a fresh `Vec` with every live element in chronological
    /// (oldest-to-newest) order.
    pub fn slice(&self) -> Vec<T> {
        (0..self.count)
            .filter_map(|i| self.get(i).cloned())
            .collect()
    }

    /// Visit every live element oldest-to-newest. The callback returns
    /// `false` to stop early.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&T) -> bool,
    {
        for i in 0..self.count {
            let Some(value) = self.get(i) else { break };
            if !f(value) {
                break;
            }
        }
    }

    /// Reset to empty. Retains the allocated storage.
    pub fn clear(&mut self) {
        self.head = 0;
        self.count = 0;
        for slot in self.storage.iter_mut() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_is_coerced_to_one() {
        let buf: RingBuffer<i32> = RingBuffer::new(0);
        assert_eq!(buf.cap(), 1);
    }

    #[test]
    fn len_is_min_of_adds_and_capacity() {
        let mut buf = RingBuffer::new(3);
        for v in 0..5 {
            buf.add(v);
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.cap(), 3);
        assert!(buf.is_full());
    }

    #[test]
    fn first_and_last_after_overflow() {
        let mut buf = RingBuffer::new(3);
        for v in 1..=5 {
            buf.add(v);
        }
        // K=5, C=3: first should be the (K-C+1)=3rd added value, last the 5th.
        assert_eq!(buf.first(), Some(&3));
        assert_eq!(buf.last(), Some(&5));
    }

    #[test]
    fn range_visits_oldest_to_newest() {
        let mut buf = RingBuffer::new(4);
        for v in 1..=6 {
            buf.add(v);
        }
        let mut seen = Vec::new();
        buf.range(|v| {
            seen.push(*v);
            true
        });
        assert_eq!(seen, vec![3, 4, 5, 6]);
    }

    #[test]
    fn range_can_stop_early() {
        let mut buf = RingBuffer::new(4);
        for v in 1..=4 {
            buf.add(v);
        }
        let mut seen = Vec::new();
        buf.range(|v| {
            seen.push(*v);
            *v < 2
        });
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn slice_matches_sequential_get() {
        let mut buf = RingBuffer::new(3);
        for v in 1..=5 {
            buf.add(v);
        }
        let expected: Vec<i32> = (0..buf.len()).map(|i| *buf.get(i).unwrap()).collect();
        assert_eq!(buf.slice(), expected);
    }

    #[test]
    fn clear_then_add_resets_first_and_last() {
        let mut buf = RingBuffer::new(3);
        buf.add(1);
        buf.add(2);
        buf.clear();
        assert!(buf.is_empty());
        buf.add(42);
        assert_eq!(buf.first(), Some(&42));
        assert_eq!(buf.last(), Some(&42));
    }

    #[test]
    fn out_of_bounds_get_is_none() {
        let mut buf = RingBuffer::new(2);
        buf.add(1);
        assert!(buf.get(1).is_none());
        assert!(buf.get(99).is_none());
    }
}
