// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Binary min-heap with stable handles
//!
//! Elements are ordered by their `Ord` implementation, smallest at the root.
//! Every inserted element gets a HeapHandle which stays valid until the
//! element leaves the heap, so an element can be removed from the middle of
//! the heap in O(log n). Handles of removed elements never resolve again,
//! even when their slot is reused.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapHandle {
    slot: usize,
    gen: u64,
}

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    gen: u64,
    pos: usize,
}

#[derive(Debug)]
pub struct BinHeap<T: Ord> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    heap: Vec<usize>,
}

impl<T: Ord> Default for BinHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord> BinHeap<T> {
    pub fn new() -> Self {
        Self {
            slots: vec![],
            free: vec![],
            heap: vec![],
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: vec![],
            heap: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn value(&self, slot: usize) -> &T {
        match &self.slots[slot].value {
            Some(value) => value,
            None => panic!("heap slot {} is linked but empty", slot),
        }
    }

    fn less(&self, a: usize, b: usize) -> bool {
        self.value(self.heap[a]) < self.value(self.heap[b])
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        let (sa, sb) = (self.heap[a], self.heap[b]);
        self.slots[sa].pos = a;
        self.slots[sb].pos = b;
    }

    fn bubble(&mut self, mut pos: usize) -> usize {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.less(pos, parent) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
        pos
    }

    fn sink(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut min = pos;
            if left < self.heap.len() && self.less(left, min) {
                min = left;
            }
            if right < self.heap.len() && self.less(right, min) {
                min = right;
            }
            if min == pos {
                return;
            }
            self.swap(pos, min);
            pos = min;
        }
    }

    /// Insert `value`, returning a handle for later removal.
    pub fn insert(&mut self, value: T) -> HeapHandle {
        let pos = self.heap.len();
        let slot = match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot];
                entry.gen += 1;
                entry.value = Some(value);
                entry.pos = pos;
                slot
            }
            None => {
                self.slots.push(Slot {
                    value: Some(value),
                    gen: 0,
                    pos,
                });
                self.slots.len() - 1
            }
        };
        self.heap.push(slot);
        self.bubble(pos);
        HeapHandle {
            slot,
            gen: self.slots[slot].gen,
        }
    }

    fn linked(&self, handle: HeapHandle) -> bool {
        match self.slots.get(handle.slot) {
            Some(entry) => entry.gen == handle.gen && entry.value.is_some(),
            None => false,
        }
    }

    pub fn get(&self, handle: HeapHandle) -> Option<&T> {
        if !self.linked(handle) {
            return None;
        }
        self.slots[handle.slot].value.as_ref()
    }

    /// Smallest element and its handle.
    pub fn peek(&self) -> Option<(HeapHandle, &T)> {
        let slot = *self.heap.first()?;
        let entry = &self.slots[slot];
        Some((
            HeapHandle {
                slot,
                gen: entry.gen,
            },
            entry.value.as_ref()?,
        ))
    }

    pub fn pop(&mut self) -> Option<T> {
        let (handle, _) = self.peek()?;
        self.remove(handle)
    }

    /// Remove the element behind `handle`. Stale handles return None.
    pub fn remove(&mut self, handle: HeapHandle) -> Option<T> {
        if !self.linked(handle) {
            return None;
        }
        let pos = self.slots[handle.slot].pos;
        let last = self.heap.len() - 1;
        if pos != last {
            self.swap(pos, last);
        }
        self.heap.pop();
        let value = self.slots[handle.slot].value.take();
        self.free.push(handle.slot);

        if pos < self.heap.len() {
            let pos = self.bubble(pos);
            self.sink(pos);
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_order() {
        let mut heap = BinHeap::new();
        for v in [5, 3, 9, 1, 7, 3] {
            heap.insert(v);
        }
        let mut out = vec![];
        while let Some(v) = heap.pop() {
            out.push(v);
        }
        assert_eq!(out, vec![1, 3, 3, 5, 7, 9]);
    }

    #[test]
    fn test_remove_middle() {
        let mut heap = BinHeap::new();
        let handles: Vec<_> = (0..10).rev().map(|v| (v, heap.insert(v))).collect();
        for (v, h) in handles.iter() {
            if v % 3 == 0 {
                assert_eq!(heap.remove(*h), Some(*v));
            }
        }
        assert_eq!(heap.len(), 6);
        let (_, root) = heap.peek().unwrap();
        assert_eq!(*root, 1);
        let mut out = vec![];
        while let Some(v) = heap.pop() {
            out.push(v);
        }
        assert_eq!(out, vec![1, 2, 4, 5, 7, 8]);
    }

    #[test]
    fn test_stale_handle() {
        let mut heap = BinHeap::new();
        let h = heap.insert(1);
        assert_eq!(heap.remove(h), Some(1));
        let h2 = heap.insert(2);
        assert_eq!(heap.get(h), None);
        assert_eq!(heap.remove(h), None);
        assert_eq!(heap.get(h2), Some(&2));
    }
}
