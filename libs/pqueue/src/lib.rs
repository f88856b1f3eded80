//! Updateable priority queue.
//!
//! A binary min-heap whose insertions hand back an [`ElementRef`]. The
//! handle stays valid until the element leaves the queue (polled or
//! removed) and allows:
//!
//! - O(log n) removal of an arbitrary element
//! - in-place key update followed by a re-heapify around that element
//!
//! # Layout
//!
//! Payloads live in an arena of slots. The heap array holds slot ids, and
//! every slot records its current heap position, so swaps keep both sides
//! in sync. Slots are recycled through a free list; each reuse bumps the
//! slot generation, which is what makes a stale handle detectable.
//!
//! # Invariants
//!
//! - `peek()`/`poll()` return the minimum of the live elements
//! - removing through a stale handle is a no-op returning `None`
//! - `len()` always equals the number of live elements

use std::cmp::Ordering;
use std::fmt;

type Comparator<T> = Box<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Handle to an element previously inserted into an [`UpdateablePriorityQueue`].
///
/// Handles are plain values: copying one does not extend the element's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementRef {
    slot: usize,
    generation: u64,
}

struct Slot<T> {
    value: Option<T>,
    generation: u64,
    /// Position in the heap array while `value` is present.
    pos: usize,
}

/// Binary min-heap with stable element handles.
pub struct UpdateablePriorityQueue<T> {
    heap: Vec<usize>,
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    cmp: Comparator<T>,
}

impl<T: Ord + 'static> UpdateablePriorityQueue<T> {
    /// Create an empty queue ordered by `T`'s natural order.
    pub fn new() -> Self {
        Self::with_comparator(T::cmp)
    }
}

impl<T: Ord + 'static> Default for UpdateablePriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> UpdateablePriorityQueue<T> {
    /// Create an empty queue ordered by `cmp` (smallest first).
    pub fn with_comparator<F>(cmp: F) -> Self
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        Self {
            heap: Vec::new(),
            slots: Vec::new(),
            free: Vec::new(),
            cmp: Box::new(cmp),
        }
    }

    /// Number of live elements.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Insert an element, returning a handle bound to it.
    pub fn add(&mut self, value: T) -> ElementRef {
        let pos = self.heap.len();
        let slot = match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot];
                entry.value = Some(value);
                entry.pos = pos;
                slot
            }
            None => {
                self.slots.push(Slot {
                    value: Some(value),
                    generation: 0,
                    pos,
                });
                self.slots.len() - 1
            }
        };
        self.heap.push(slot);
        self.sift_up(pos);

        ElementRef {
            slot,
            generation: self.slots[slot].generation,
        }
    }

    /// The minimum element, if any.
    pub fn peek(&self) -> Option<&T> {
        self.heap
            .first()
            .and_then(|&slot| self.slots[slot].value.as_ref())
    }

    /// Remove and return the minimum element.
    pub fn poll(&mut self) -> Option<T> {
        if self.heap.is_empty() {
            return None;
        }
        self.remove_at(0)
    }

    /// Whether `elem` still refers to a live element.
    pub fn contains(&self, elem: ElementRef) -> bool {
        self.position(elem).is_some()
    }

    /// Shared access to the element behind `elem`.
    pub fn get(&self, elem: ElementRef) -> Option<&T> {
        self.position(elem)?;
        self.slots[elem.slot].value.as_ref()
    }

    /// Mutable access to the element behind `elem`.
    ///
    /// If the mutation changes the element's ordering, the caller must
    /// follow up with [`element_mutated`](Self::element_mutated). Prefer
    /// [`update`](Self::update) which does both.
    pub fn get_mut(&mut self, elem: ElementRef) -> Option<&mut T> {
        self.position(elem)?;
        self.slots[elem.slot].value.as_mut()
    }

    /// Restore heap order after the element behind `elem` changed.
    ///
    /// Returns `false` for a stale handle.
    pub fn element_mutated(&mut self, elem: ElementRef) -> bool {
        match self.position(elem) {
            Some(pos) => {
                self.resift(pos);
                true
            }
            None => false,
        }
    }

    /// Replace the element behind `elem` and re-heapify around it.
    ///
    /// Returns the previous value, or hands `value` back as `Err` for a
    /// stale handle.
    pub fn set_elem(&mut self, elem: ElementRef, value: T) -> Result<T, T> {
        let Some(pos) = self.position(elem) else {
            return Err(value);
        };
        let previous = self.slots[elem.slot].value.replace(value);
        self.resift(pos);
        match previous {
            Some(previous) => Ok(previous),
            None => unreachable!("live slot without a value"),
        }
    }

    /// Mutate the element behind `elem` in place, then re-heapify.
    ///
    /// Returns `None` for a stale handle.
    pub fn update<R>(&mut self, elem: ElementRef, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let pos = self.position(elem)?;
        let result = f(self.slots[elem.slot].value.as_mut()?);
        self.resift(pos);
        Some(result)
    }

    /// Remove the element behind `elem`.
    ///
    /// A second removal through the same handle (or removal after the
    /// element was polled) returns `None` and leaves the queue untouched.
    pub fn remove(&mut self, elem: ElementRef) -> Option<T> {
        let pos = self.position(elem)?;
        self.remove_at(pos)
    }

    /// Keep only the elements for which `keep` returns `true`.
    ///
    /// Heap order is restored after every removal, so the remaining
    /// elements poll out in order.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        let doomed: Vec<ElementRef> = self
            .iter_refs()
            .filter(|(_, value)| !keep(value))
            .map(|(elem, _)| elem)
            .collect();
        for elem in doomed {
            self.remove(elem);
        }
    }

    /// Iterate in heap-array order (unspecified, not sorted).
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.iter_refs().map(|(_, value)| value)
    }

    /// Iterate handles and elements in heap-array order.
    pub fn iter_refs(&self) -> impl Iterator<Item = (ElementRef, &T)> + '_ {
        self.heap.iter().filter_map(move |&slot| {
            let entry = &self.slots[slot];
            entry.value.as_ref().map(|value| {
                (
                    ElementRef {
                        slot,
                        generation: entry.generation,
                    },
                    value,
                )
            })
        })
    }

    /// Drop every element. Outstanding handles become stale.
    pub fn clear(&mut self) {
        for slot in self.heap.drain(..) {
            let entry = &mut self.slots[slot];
            entry.value = None;
            entry.generation = entry.generation.wrapping_add(1);
            self.free.push(slot);
        }
    }

    fn position(&self, elem: ElementRef) -> Option<usize> {
        let entry = self.slots.get(elem.slot)?;
        if entry.generation != elem.generation || entry.value.is_none() {
            return None;
        }
        Some(entry.pos)
    }

    fn remove_at(&mut self, pos: usize) -> Option<T> {
        let last = self.heap.len() - 1;
        if pos != last {
            self.swap(pos, last);
        }
        let slot = self.heap.pop()?;

        let entry = &mut self.slots[slot];
        let value = entry.value.take();
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(slot);

        // The element moved into `pos` may violate order in either direction.
        if pos < self.heap.len() {
            self.resift(pos);
        }
        value
    }

    fn resift(&mut self, pos: usize) {
        if self.sift_up(pos) == pos {
            self.sift_down(pos);
        }
    }

    fn sift_up(&mut self, mut pos: usize) -> usize {
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

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.less(right, left) {
                right
            } else {
                left
            };
            if !self.less(child, pos) {
                break;
            }
            self.swap(pos, child);
            pos = child;
        }
    }

    fn less(&self, a: usize, b: usize) -> bool {
        match (
            self.slots[self.heap[a]].value.as_ref(),
            self.slots[self.heap[b]].value.as_ref(),
        ) {
            (Some(x), Some(y)) => (self.cmp)(x, y) == Ordering::Less,
            _ => false,
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        let (slot_a, slot_b) = (self.heap[a], self.heap[b]);
        self.slots[slot_a].pos = a;
        self.slots[slot_b].pos = b;
    }
}

impl<T: fmt::Debug> fmt::Debug for UpdateablePriorityQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
