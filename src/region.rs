//! A region pairs a contiguous virtual-address range with two views of
//! the same set of chunks: a sentinel-headed doubly linked list in
//! strict ascending address order (the directory, which makes
//! adjacent-coalescing cheap) and a max-heap over the FREE chunks (the
//! "largest hole" index).  The chunks partition the range at all
//! times; they split on allocation and merge with FREE neighbours on
//! release.
//!
//! A `Region` is pure bookkeeping.  It never touches the pages it
//! hands out; installing and releasing backing mappings is the
//! caller's business, driven while the caller still holds the global
//! lock.
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

use crate::chunk::{Chunk, ChunkArena, ChunkId, ChunkState};
use crate::free_heap::FreeHeap;

#[derive(Debug)]
pub struct Region {
    base: usize,
    len: usize,
    used: usize,
    /// Head of the chunk list.  The sentinel carries `size = 0`, is
    /// permanently IN_USE, and anchors the region start: the leftmost
    /// real chunk always has a predecessor, and that predecessor never
    /// qualifies for coalescing.
    sentinel: ChunkId,
    chunks: ChunkArena,
    free: FreeHeap,
}

impl Region {
    /// Creates a region covering `[base, base + len)` as one giant
    /// FREE chunk.
    pub fn new(base: usize, len: usize) -> Self {
        let mut chunks = ChunkArena::new();

        let sentinel = chunks.insert(Chunk {
            ptr: base,
            size: 0,
            state: ChunkState::InUse,
            prev: None,
            next: None,
            heap_slot: None,
        });
        let first = chunks.insert(Chunk {
            ptr: base,
            size: len,
            state: ChunkState::Free,
            prev: Some(sentinel),
            next: None,
            heap_slot: None,
        });
        chunks[sentinel].next = Some(first);

        let mut free = FreeHeap::default();
        free.insert(&mut chunks, first);

        Region {
            base,
            len,
            used: 0,
            sentinel,
            chunks,
            free,
        }
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Bytes currently IN_USE.
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Carves `size` bytes out of the best-fitting hole and returns
    /// the chunk's address.  `None` means no FREE chunk is large
    /// enough.  Rounding the request to the region's multiple is the
    /// caller's policy; any positive size is accepted here.
    #[requires(size > 0)]
    #[ensures(self.check_rep_or_err().is_ok())]
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        let slot = self.free.best_fit(&self.chunks, size)?;
        let id = self.free.chunk_at(slot);
        let ptr = self.chunks[id].ptr;

        if self.chunks[id].size == size {
            self.free.remove(&mut self.chunks, slot);
            self.chunks[id].state = ChunkState::InUse;
        } else {
            // Carve the request from the hole's low end; the shrunk
            // remainder stays FREE and keeps its heap slot.
            let carved = self.chunks.insert(Chunk {
                ptr,
                size,
                state: ChunkState::InUse,
                prev: None,
                next: None,
                heap_slot: None,
            });
            self.chunks.link_before(carved, id);
            self.chunks[id].ptr = ptr + size;
            self.chunks[id].size -= size;
            self.free.shrank(&mut self.chunks, slot);
        }

        self.used += size;
        Some(ptr)
    }

    /// Finds the IN_USE chunk starting at `ptr`.
    pub fn lookup(&self, ptr: usize) -> Option<(ChunkId, usize)> {
        let mut cursor = self.chunks[self.sentinel].next;

        while let Some(id) = cursor {
            let chunk = &self.chunks[id];
            if chunk.ptr > ptr {
                // The list is address ordered; no match past this point.
                return None;
            }
            if chunk.ptr == ptr && chunk.state == ChunkState::InUse {
                return Some((id, chunk.size));
            }
            cursor = chunk.next;
        }

        None
    }

    /// Releases the IN_USE chunk starting at `ptr`, merging it with
    /// any FREE neighbour.  Returns the released range, or `None` when
    /// `ptr` does not start a live chunk (a caller bug; the region is
    /// left untouched).
    #[ensures(self.check_rep_or_err().is_ok())]
    pub fn release(&mut self, ptr: usize) -> Option<(usize, usize)> {
        let (id, size) = self.lookup(ptr)?;
        self.used -= size;

        let prev = self.chunks[id].prev.filter(|&p| self.chunks[p].is_free());
        let next = self.chunks[id].next.filter(|&n| self.chunks[n].is_free());

        match (prev, next) {
            (Some(p), Some(n)) => {
                // The successor absorbs the trio.  The predecessor
                // leaves the heap before the successor grows, so the
                // heap is well formed at every step in between.
                let merged_ptr = self.chunks[p].ptr;
                let absorbed = self.chunks[id].size + self.chunks[p].size;

                let p_slot = self.chunks[p].heap_slot.expect("FREE chunks are indexed");
                self.free.remove(&mut self.chunks, p_slot);
                self.chunks.unlink(p);
                self.chunks.retire(p);
                self.chunks.unlink(id);
                self.chunks.retire(id);

                self.chunks[n].ptr = merged_ptr;
                self.chunks[n].size += absorbed;

                // Removing `p` may have moved `n` within the heap.
                let n_slot = self.chunks[n].heap_slot.expect("FREE chunks are indexed");
                self.free.grew(&mut self.chunks, n_slot);
            }
            (None, Some(n)) => {
                let merged_ptr = self.chunks[id].ptr;
                let absorbed = self.chunks[id].size;
                self.chunks.unlink(id);
                self.chunks.retire(id);

                self.chunks[n].ptr = merged_ptr;
                self.chunks[n].size += absorbed;

                let n_slot = self.chunks[n].heap_slot.expect("FREE chunks are indexed");
                self.free.grew(&mut self.chunks, n_slot);
            }
            (Some(p), None) => {
                let absorbed = self.chunks[id].size;
                self.chunks.unlink(id);
                self.chunks.retire(id);

                self.chunks[p].size += absorbed;

                let p_slot = self.chunks[p].heap_slot.expect("FREE chunks are indexed");
                self.free.grew(&mut self.chunks, p_slot);
            }
            (None, None) => {
                self.chunks[id].state = ChunkState::Free;
                self.free.insert(&mut self.chunks, id);
            }
        }

        Some((ptr, size))
    }

    /// Returns `Err` when any structural invariant is violated: the
    /// chunks must tile `[base, base + len)` in address order, FREE
    /// chunks must never touch, heap membership must match the FREE
    /// state, and the used counter must equal the IN_USE total.
    #[cfg(any(test, feature = "check_contracts", feature = "check_contracts_in_tests"))]
    pub fn check_rep_or_err(&self) -> Result<(), &'static str> {
        let sentinel = &self.chunks[self.sentinel];
        if sentinel.size != 0 || sentinel.is_free() || sentinel.prev.is_some() {
            return Err("corrupt sentinel");
        }

        let mut expected_ptr = self.base;
        let mut total = 0;
        let mut used = 0;
        let mut free_count = 0;
        let mut node_count = 1;
        let mut prev_id = Some(self.sentinel);
        let mut prev_free = false;
        let mut cursor = sentinel.next;

        while let Some(id) = cursor {
            let chunk = &self.chunks[id];

            if chunk.prev != prev_id {
                return Err("list backlink is stale");
            }
            if chunk.ptr != expected_ptr {
                return Err("list has a gap or overlap");
            }
            if chunk.size == 0 {
                return Err("zero-sized chunk");
            }

            if chunk.is_free() {
                if prev_free {
                    return Err("adjacent FREE chunks were not coalesced");
                }
                if chunk.heap_slot.is_none() {
                    return Err("FREE chunk missing from the heap");
                }
                free_count += 1;
            } else {
                if chunk.heap_slot.is_some() {
                    return Err("IN_USE chunk still indexed in the heap");
                }
                used += chunk.size;
            }

            expected_ptr += chunk.size;
            total += chunk.size;
            node_count += 1;
            prev_free = chunk.is_free();
            prev_id = Some(id);
            cursor = chunk.next;
        }

        if total != self.len {
            return Err("chunks do not cover the reservation");
        }
        if node_count != self.chunks.live_chunks() {
            return Err("arena leaks chunk records");
        }
        if used != self.used {
            return Err("used counter is off");
        }
        if free_count != self.free.len() {
            return Err("heap population does not match FREE chunks");
        }

        self.free.check_rep_or_err(&self.chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BASE: usize = 0x4000_0000;
    const LEN: usize = 1 << 20;

    fn check(region: &Region) {
        region.check_rep_or_err().expect("region must be valid");
    }

    #[test]
    fn starts_as_one_giant_hole() {
        let mut region = Region::new(BASE, LEN);
        check(&region);

        assert_eq!(region.used(), 0);
        // The whole range is a single chunk, so an exact-length
        // request gets the base address.
        assert_eq!(region.allocate(LEN), Some(BASE));
        assert_eq!(region.used(), LEN);
        assert_eq!(region.allocate(1), None);
        check(&region);
    }

    #[test]
    fn splits_carve_from_the_low_end() {
        let mut region = Region::new(BASE, LEN);

        assert_eq!(region.allocate(4096), Some(BASE));
        assert_eq!(region.allocate(8192), Some(BASE + 4096));
        assert_eq!(region.used(), 4096 + 8192);
        check(&region);
    }

    #[test]
    fn release_handles_every_neighbour_shape() {
        let mut region = Region::new(BASE, LEN);

        let a = region.allocate(4096).unwrap();
        let b = region.allocate(4096).unwrap();
        let c = region.allocate(4096).unwrap();
        let d = region.allocate(4096).unwrap();
        check(&region);

        // Isolated: both neighbours IN_USE.
        assert!(region.release(b).is_some());
        check(&region);

        // Successor only: `a` sits between the sentinel and the hole
        // left by `b`.
        assert!(region.release(a).is_some());
        check(&region);

        // Predecessor only: the merged hole before `c`, `d` after it.
        assert!(region.release(c).is_some());
        check(&region);

        // Trio: the merged hole and the tail hole wrap `d`; everything
        // collapses back into a single chunk.
        assert!(region.release(d).is_some());
        check(&region);
        assert_eq!(region.used(), 0);
        assert_eq!(region.allocate(LEN), Some(BASE));
    }

    #[test]
    fn exact_fit_reuses_a_freed_hole() {
        let mut region = Region::new(BASE, LEN);

        let a = region.allocate(32 << 10).unwrap();
        let b = region.allocate(64 << 10).unwrap();
        let c = region.allocate(32 << 10).unwrap();

        assert!(region.release(b).is_some());
        check(&region);

        // The freed hole fits exactly and is smaller than the tail
        // hole, so fit selection hands the same address back.
        let d = region.allocate(64 << 10).unwrap();
        assert_eq!(d, b);
        assert_eq!(region.used(), (32 << 10) + (32 << 10) + (64 << 10));

        for ptr in [a, c, d].iter() {
            assert!(region.release(*ptr).is_some());
        }
        check(&region);
        assert_eq!(region.used(), 0);
    }

    #[test]
    fn release_rejects_unknown_pointers() {
        let mut region = Region::new(BASE, LEN);
        let a = region.allocate(4096).unwrap();

        // Inside a chunk but not its start.
        assert_eq!(region.release(a + 1), None);
        // Inside the FREE tail.
        assert_eq!(region.release(BASE + 8192), None);

        assert!(region.release(a).is_some());
        // Double release.
        assert_eq!(region.release(a), None);
        check(&region);
    }

    #[test]
    fn lookup_reports_live_chunks_only() {
        let mut region = Region::new(BASE, LEN);
        let a = region.allocate(4096).unwrap();

        let (_, size) = region.lookup(a).expect("chunk is live");
        assert_eq!(size, 4096);
        assert_eq!(region.lookup(a + 4096), None);

        region.release(a).unwrap();
        assert_eq!(region.lookup(a), None);
    }

    proptest! {
        // Random allocate/release interleavings against a shadow
        // model, with the full representation check after every step.
        #[test]
        fn random_traffic_preserves_the_invariants(
            ops in proptest::collection::vec((proptest::bool::ANY, 1usize..64), 1..300)
        ) {
            let mut region = Region::new(BASE, LEN);
            let mut live: Vec<(usize, usize)> = Vec::new();

            for (is_alloc, value) in ops {
                if is_alloc {
                    let size = value * 4096;
                    if let Some(ptr) = region.allocate(size) {
                        prop_assert!(ptr >= BASE && ptr + size <= BASE + LEN);
                        live.push((ptr, size));
                    }
                } else if !live.is_empty() {
                    let (ptr, size) = live.swap_remove(value % live.len());
                    let released = region.release(ptr);
                    prop_assert_eq!(released, Some((ptr, size)));
                }

                prop_assert!(region.check_rep_or_err().is_ok());
                prop_assert_eq!(region.used(), live.iter().map(|(_, s)| s).sum::<usize>());
            }

            for (ptr, _) in live.drain(..) {
                prop_assert!(region.release(ptr).is_some());
            }

            // Round trip: the region is one giant hole again.
            prop_assert_eq!(region.used(), 0);
            prop_assert_eq!(region.allocate(LEN), Some(BASE));
        }
    }
}
