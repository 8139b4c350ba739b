//! An array-backed max-heap over the FREE chunks of one region, keyed
//! by chunk size.  The root is always the largest hole, so "can this
//! request be satisfied at all" is a single comparison, and the three
//! largest holes sit at slots 0, 1 and 2, which is what the
//! fit-selection below exploits.
//!
//! Every FREE chunk records its current heap slot; swaps update both
//! sides in the same critical section so the backlinks never go stale.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use smallvec::SmallVec;

use crate::chunk::{ChunkArena, ChunkId};

/// A fresh region has exactly one FREE chunk; inline capacity keeps
/// early heap operations from allocating while the library is still
/// bootstrapping itself.
const INLINE_FREE_CHUNKS: usize = 8;

#[derive(Debug, Default)]
pub struct FreeHeap {
    slots: SmallVec<[ChunkId; INLINE_FREE_CHUNKS]>,
}

impl FreeHeap {
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// The chunk stored at heap slot `slot`.
    #[inline]
    pub fn chunk_at(&self, slot: usize) -> ChunkId {
        self.slots[slot]
    }

    /// Indexes a newly FREE chunk.
    #[requires(arena[id].is_free(), "only FREE chunks are indexed")]
    #[ensures(self.check_rep_or_err(arena).is_ok())]
    pub fn insert(&mut self, arena: &mut ChunkArena, id: ChunkId) {
        let slot = self.slots.len();
        self.slots.push(id);
        arena[id].heap_slot = Some(slot);
        self.sift_up(arena, slot);
    }

    /// Drops the chunk at `slot` out of the heap (it is about to turn
    /// IN_USE or be merged away).
    #[ensures(self.check_rep_or_err(arena).is_ok())]
    pub fn remove(&mut self, arena: &mut ChunkArena, slot: usize) {
        let last = self.slots.len() - 1;
        self.slots.swap(slot, last);
        let removed = self.slots.pop().expect("heap is non-empty");
        arena[removed].heap_slot = None;

        if slot < self.slots.len() {
            arena[self.slots[slot]].heap_slot = Some(slot);
            // The replacement came from the bottom of the heap, but
            // when `slot` is in the middle of the array it can still
            // be larger than its new parent; reconcile both ways.
            self.reheapify(arena, slot);
        }
    }

    /// Restores order after the chunk at `slot` got bigger
    /// (coalescing only ever grows a FREE chunk).
    #[ensures(self.check_rep_or_err(arena).is_ok())]
    pub fn grew(&mut self, arena: &mut ChunkArena, slot: usize) {
        self.sift_up(arena, slot);
    }

    /// Restores order after the chunk at `slot` got smaller (an
    /// allocation split carved bytes off its low end).
    #[ensures(self.check_rep_or_err(arena).is_ok())]
    pub fn shrank(&mut self, arena: &mut ChunkArena, slot: usize) {
        self.sift_down(arena, slot);
    }

    /// Picks the FREE chunk that should satisfy a request of `size`
    /// bytes, or `None` when no hole is large enough.
    ///
    /// Popping the root would carve every request out of the single
    /// biggest hole and steadily fragment it.  Instead, out of the
    /// root and its two children, this returns the smallest that still
    /// fits, preserving the biggest hole for a future, larger request.
    pub fn best_fit(&self, arena: &ChunkArena, size: usize) -> Option<usize> {
        if self.slots.is_empty() || arena[self.slots[0]].size < size {
            return None;
        }

        let mut best = 0;
        for candidate in 1..3 {
            if candidate < self.slots.len()
                && arena[self.slots[candidate]].size >= size
                && arena[self.slots[candidate]].size < arena[self.slots[best]].size
            {
                best = candidate;
            }
        }

        Some(best)
    }

    /// Restores the heap property at `slot` when the element may have
    /// moved in either direction.
    fn reheapify(&mut self, arena: &mut ChunkArena, slot: usize) {
        if slot > 0 && arena[self.slots[slot]].size > arena[self.slots[(slot - 1) / 2]].size {
            self.sift_up(arena, slot);
        } else {
            self.sift_down(arena, slot);
        }
    }

    fn sift_up(&mut self, arena: &mut ChunkArena, mut slot: usize) {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if arena[self.slots[slot]].size <= arena[self.slots[parent]].size {
                break;
            }
            self.swap(arena, slot, parent);
            slot = parent;
        }
    }

    fn sift_down(&mut self, arena: &mut ChunkArena, mut slot: usize) {
        loop {
            let left = 2 * slot + 1;
            let right = 2 * slot + 2;
            let mut largest = slot;

            if left < self.slots.len()
                && arena[self.slots[left]].size > arena[self.slots[largest]].size
            {
                largest = left;
            }
            if right < self.slots.len()
                && arena[self.slots[right]].size > arena[self.slots[largest]].size
            {
                largest = right;
            }
            if largest == slot {
                return;
            }

            self.swap(arena, slot, largest);
            slot = largest;
        }
    }

    fn swap(&mut self, arena: &mut ChunkArena, a: usize, b: usize) {
        self.slots.swap(a, b);
        arena[self.slots[a]].heap_slot = Some(a);
        arena[self.slots[b]].heap_slot = Some(b);
    }

    /// Returns `Err` when the heap property or a slot backlink is
    /// violated.
    #[cfg(any(test, feature = "check_contracts", feature = "check_contracts_in_tests"))]
    pub fn check_rep_or_err(&self, arena: &ChunkArena) -> Result<(), &'static str> {
        for (slot, &id) in self.slots.iter().enumerate() {
            if !arena[id].is_free() {
                return Err("heap element is not FREE");
            }

            if arena[id].heap_slot != Some(slot) {
                return Err("heap slot backlink is stale");
            }

            if slot > 0 {
                let parent = self.slots[(slot - 1) / 2];
                if arena[parent].size < arena[id].size {
                    return Err("max-heap property violated");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Chunk, ChunkState};
    use proptest::prelude::*;

    fn free_chunk(ptr: usize, size: usize) -> Chunk {
        Chunk {
            ptr,
            size,
            state: ChunkState::Free,
            prev: None,
            next: None,
            heap_slot: None,
        }
    }

    fn heap_with(sizes: &[usize]) -> (ChunkArena, FreeHeap) {
        let mut arena = ChunkArena::new();
        let mut heap = FreeHeap::default();
        let mut ptr = 0x1000;

        for &size in sizes {
            let id = arena.insert(free_chunk(ptr, size));
            heap.insert(&mut arena, id);
            ptr += size;
        }

        (arena, heap)
    }

    #[test]
    fn insert_keeps_the_largest_at_the_root() {
        let (arena, heap) = heap_with(&[10, 300, 25, 4, 100]);

        heap.check_rep_or_err(&arena).expect("heap must be valid");
        assert_eq!(arena[heap.chunk_at(0)].size, 300);
    }

    #[test]
    fn best_fit_prefers_the_smallest_of_the_top_three() {
        // Heap array layout after these inserts: [100, 40, 60].
        let (arena, heap) = heap_with(&[100, 40, 60]);

        let slot = heap.best_fit(&arena, 50).expect("50 fits");
        assert_eq!(arena[heap.chunk_at(slot)].size, 60);

        let slot = heap.best_fit(&arena, 70).expect("70 fits");
        assert_eq!(arena[heap.chunk_at(slot)].size, 100);

        let slot = heap.best_fit(&arena, 40).expect("40 fits");
        assert_eq!(arena[heap.chunk_at(slot)].size, 40);

        assert_eq!(heap.best_fit(&arena, 101), None);
    }

    #[test]
    fn best_fit_fails_on_an_empty_heap() {
        let (arena, heap) = heap_with(&[]);

        assert_eq!(heap.best_fit(&arena, 1), None);
    }

    #[test]
    fn remove_reconciles_in_both_directions() {
        // Inserting in this order yields exactly this heap array:
        // [100, 20, 90, 10, 15, 80, 85].  Removing slot 3 moves 85
        // next to its new parent 20, which only a sift *up* can fix.
        let (mut arena, mut heap) = heap_with(&[100, 20, 90, 10, 15, 80, 85]);

        heap.remove(&mut arena, 3);

        heap.check_rep_or_err(&arena).expect("heap must be valid");
        assert_eq!(heap.len(), 6);
        assert_eq!(arena[heap.chunk_at(0)].size, 100);
    }

    #[test]
    fn removing_the_only_element_empties_the_heap() {
        let (mut arena, mut heap) = heap_with(&[42]);
        let id = heap.chunk_at(0);

        heap.remove(&mut arena, 0);

        assert_eq!(heap.len(), 0);
        assert_eq!(arena[id].heap_slot, None);
    }

    proptest! {
        #[test]
        fn random_operations_preserve_the_invariants(
            ops in proptest::collection::vec((0u8..3, 1usize..10_000), 1..200)
        ) {
            let mut arena = ChunkArena::new();
            let mut heap = FreeHeap::default();
            let mut next_ptr = 0x1000;

            for (op, value) in ops {
                match op {
                    0 => {
                        let id = arena.insert(free_chunk(next_ptr, value));
                        next_ptr += value;
                        heap.insert(&mut arena, id);
                    }
                    1 if heap.len() > 0 => {
                        heap.remove(&mut arena, value % heap.len());
                    }
                    2 => {
                        if let Some(slot) = heap.best_fit(&arena, value) {
                            prop_assert!(arena[heap.chunk_at(slot)].size >= value);
                            heap.remove(&mut arena, slot);
                        }
                    }
                    _ => {}
                }

                prop_assert!(heap.check_rep_or_err(&arena).is_ok());
            }
        }
    }
}
