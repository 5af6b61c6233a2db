//! Binary heap with an element index.
//!
//! [`IndexedPriorityQueue`] keeps a hash map from each element to its slots in
//! the heap array. This makes `contains` O(1), arbitrary `remove` O(log n), and
//! lets callers reposition an element whose sort key changed behind the
//! queue's back by calling [`offer`](IndexedPriorityQueue::offer) on it again,
//! instead of removing and re-inserting.
//!
//! Element identity is whatever `Eq`/`Hash` says. Wrap shared handles in a
//! pointer-identity newtype to key by reference rather than by value.
//! Duplicates are allowed; each occurrence has its own slot.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use thiserror::Error;

/// Orders queue elements; the least element is at the top.
pub trait Comparator<E> {
    fn compare(&self, a: &E, b: &E) -> Ordering;
}

impl<E, F> Comparator<E> for F
where
    F: Fn(&E, &E) -> Ordering,
{
    fn compare(&self, a: &E, b: &E) -> Ordering {
        self(a, b)
    }
}

/// Orders elements by their `Ord` implementation (a min-heap).
#[derive(Debug, Default, Clone, Copy)]
pub struct NaturalOrder;

impl<E: Ord> Comparator<E> for NaturalOrder {
    fn compare(&self, a: &E, b: &E) -> Ordering {
        a.cmp(b)
    }
}

/// A broken internal invariant, reported by [`IndexedPriorityQueue::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("heap order violated between parent {parent} and child {child}")]
    HeapOrder { parent: usize, child: usize },

    #[error("slot {0} is missing from the element index")]
    Unindexed(usize),

    #[error("element index points at slot {0} holding a different element")]
    StaleIndex(usize),

    #[error("element index tracks {indexed} slots but heap holds {len}")]
    SizeMismatch { indexed: usize, len: usize },
}

/// Min-heap with O(log n) removal and in-place key update.
pub struct IndexedPriorityQueue<E, C = NaturalOrder> {
    heap: Vec<E>,
    index: HashMap<E, Vec<usize>>,
    cmp: C,
}

impl<E: Hash + Eq + Clone + Ord> IndexedPriorityQueue<E, NaturalOrder> {
    pub fn new() -> Self {
        Self::with_comparator(NaturalOrder)
    }
}

impl<E: Hash + Eq + Clone + Ord> Default for IndexedPriorityQueue<E, NaturalOrder> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, C> IndexedPriorityQueue<E, C>
where
    E: Hash + Eq + Clone,
    C: Comparator<E>,
{
    pub fn with_comparator(cmp: C) -> Self {
        Self {
            heap: Vec::new(),
            index: HashMap::new(),
            cmp,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Insert a new occurrence of `e`, even if it is already queued.
    pub fn push(&mut self, e: E) {
        let pos = self.heap.len();
        self.index.entry(e.clone()).or_default().push(pos);
        self.heap.push(e);
        self.sift_up(pos);
    }

    /// Insert `e`, or restore the position of every occurrence already queued.
    ///
    /// Returns `true` when `e` was newly inserted. Call this after mutating
    /// the sort key of a queued element.
    pub fn offer(&mut self, e: E) -> bool {
        let occurrences = match self.index.get(&e) {
            Some(slots) => slots.len(),
            None => {
                self.push(e);
                return true;
            }
        };
        for k in 0..occurrences {
            let pos = self.index[&e][k];
            self.reposition(pos);
        }
        false
    }

    /// The least element, if any.
    pub fn peek(&self) -> Option<&E> {
        self.heap.first()
    }

    /// Remove and return the least element.
    pub fn poll(&mut self) -> Option<E> {
        if self.heap.is_empty() {
            return None;
        }
        Some(self.remove_at(0))
    }

    /// Remove one occurrence of `e`. Returns whether anything was removed.
    pub fn remove(&mut self, e: &E) -> bool {
        let pos = match self.index.get(e).and_then(|slots| slots.last()) {
            Some(&pos) => pos,
            None => return false,
        };
        self.remove_at(pos);
        true
    }

    pub fn contains(&self, e: &E) -> bool {
        self.index.contains_key(e)
    }

    /// Read-only traversal in heap array order (not sorted order).
    pub fn iter(&self) -> std::slice::Iter<'_, E> {
        self.heap.iter()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    /// Check heap order and index agreement.
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        for child in 1..self.heap.len() {
            let parent = (child - 1) / 2;
            if self.cmp.compare(&self.heap[parent], &self.heap[child]) == Ordering::Greater {
                return Err(InvariantViolation::HeapOrder { parent, child });
            }
        }
        let mut indexed = 0;
        for (e, slots) in &self.index {
            for &pos in slots {
                if self.heap.get(pos) != Some(e) {
                    return Err(InvariantViolation::StaleIndex(pos));
                }
            }
            indexed += slots.len();
        }
        if indexed != self.heap.len() {
            return Err(InvariantViolation::SizeMismatch {
                indexed,
                len: self.heap.len(),
            });
        }
        for (pos, e) in self.heap.iter().enumerate() {
            if !self.index.get(e).is_some_and(|slots| slots.contains(&pos)) {
                return Err(InvariantViolation::Unindexed(pos));
            }
        }
        Ok(())
    }

    fn remove_at(&mut self, pos: usize) -> E {
        let last = self.heap.len() - 1;
        if pos != last {
            self.swap(pos, last);
        }
        let removed = self.heap.swap_remove(last);
        self.unindex(&removed, last);
        if pos < self.heap.len() {
            self.reposition(pos);
        }
        removed
    }

    fn reposition(&mut self, pos: usize) {
        if self.sift_down(pos) == pos {
            self.sift_up(pos);
        }
    }

    fn sift_up(&mut self, mut pos: usize) -> usize {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.cmp.compare(&self.heap[pos], &self.heap[parent]) != Ordering::Less {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
        pos
    }

    fn sift_down(&mut self, mut pos: usize) -> usize {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len
                && self.cmp.compare(&self.heap[right], &self.heap[left]) == Ordering::Less
            {
                right
            } else {
                left
            };
            if self.cmp.compare(&self.heap[child], &self.heap[pos]) != Ordering::Less {
                break;
            }
            self.swap(pos, child);
            pos = child;
        }
        pos
    }

    fn swap(&mut self, i: usize, j: usize) {
        if self.heap[i] == self.heap[j] {
            // Same element on both sides: its slot set is unchanged.
            self.heap.swap(i, j);
            return;
        }
        self.relocate(i, j);
        self.relocate(j, i);
        self.heap.swap(i, j);
    }

    /// Record that the element at `from` is moving to `to`.
    fn relocate(&mut self, from: usize, to: usize) {
        if let Some(slots) = self.index.get_mut(&self.heap[from]) {
            if let Some(slot) = slots.iter_mut().find(|slot| **slot == from) {
                *slot = to;
            }
        }
    }

    fn unindex(&mut self, e: &E, pos: usize) {
        if let Some(slots) = self.index.get_mut(e) {
            slots.retain(|&slot| slot != pos);
            if slots.is_empty() {
                self.index.remove(e);
            }
        }
    }
}

impl<'a, E, C> IntoIterator for &'a IndexedPriorityQueue<E, C> {
    type Item = &'a E;
    type IntoIter = std::slice::Iter<'a, E>;

    fn into_iter(self) -> Self::IntoIter {
        self.heap.iter()
    }
}

impl<E: fmt::Debug, C> fmt::Debug for IndexedPriorityQueue<E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.heap.iter()).finish()
    }
}
