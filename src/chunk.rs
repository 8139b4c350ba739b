//! Chunks are the atomic unit of region bookkeeping: half-open byte
//! ranges `[ptr, ptr + size)` that partition a region's reservation at
//! all times, each either FREE or IN_USE.
//!
//! Chunks live in a `ChunkArena` and are referred to by stable
//! `ChunkId` handles.  The address-ordered list links and the
//! free-heap slots are all expressed in handles, so growing the
//! backing storage never invalidates a cross reference, and the heap
//! and list can point at the same record without aliasing trouble.
use std::ops::{Index, IndexMut};

/// Stable handle for a chunk in its region's `ChunkArena`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChunkId(u32);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChunkState {
    InUse,
    Free,
}

#[derive(Clone, Debug)]
pub struct Chunk {
    /// First byte of the range.
    pub ptr: usize,
    /// Length of the range in bytes.
    pub size: usize,
    pub state: ChunkState,
    /// Address-ordered list links.  `None` marks the list ends.
    pub prev: Option<ChunkId>,
    pub next: Option<ChunkId>,
    /// Position in the region's free-heap array: `Some` exactly for
    /// FREE chunks, kept in lockstep with the heap on every swap.
    pub heap_slot: Option<usize>,
}

impl Chunk {
    #[inline]
    pub fn is_free(&self) -> bool {
        self.state == ChunkState::Free
    }
}

/// Slab of chunk records.  Slots retired by coalescing are recycled
/// before the backing vector grows.
#[derive(Debug, Default)]
pub struct ChunkArena {
    slots: Vec<Chunk>,
    recycled: Vec<ChunkId>,
}

impl ChunkArena {
    pub fn new() -> Self {
        Default::default()
    }

    /// Stores `chunk` and returns its handle.
    pub fn insert(&mut self, chunk: Chunk) -> ChunkId {
        match self.recycled.pop() {
            Some(id) => {
                self.slots[id.0 as usize] = chunk;
                id
            }
            None => {
                assert!(self.slots.len() < u32::MAX as usize, "chunk arena overflow");
                let id = ChunkId(self.slots.len() as u32);
                self.slots.push(chunk);
                id
            }
        }
    }

    /// Returns a chunk's slot to the recycle list.  The handle must
    /// not be used again until `insert` hands it back out.
    pub fn retire(&mut self, id: ChunkId) {
        self.recycled.push(id);
    }

    /// Splices `id` out of the doubly linked list.
    pub fn unlink(&mut self, id: ChunkId) {
        let (prev, next) = (self[id].prev, self[id].next);
        if let Some(p) = prev {
            self[p].next = next;
        }
        if let Some(n) = next {
            self[n].prev = prev;
        }
    }

    /// Links `id` into the list immediately before `anchor`.
    pub fn link_before(&mut self, id: ChunkId, anchor: ChunkId) {
        let prev = self[anchor].prev;
        self[id].prev = prev;
        self[id].next = Some(anchor);
        if let Some(p) = prev {
            self[p].next = Some(id);
        }
        self[anchor].prev = Some(id);
    }

    /// Number of non-retired records.
    #[cfg(any(test, feature = "check_contracts", feature = "check_contracts_in_tests"))]
    pub fn live_chunks(&self) -> usize {
        self.slots.len() - self.recycled.len()
    }
}

impl Index<ChunkId> for ChunkArena {
    type Output = Chunk;

    #[inline]
    fn index(&self, id: ChunkId) -> &Chunk {
        &self.slots[id.0 as usize]
    }
}

impl IndexMut<ChunkId> for ChunkArena {
    #[inline]
    fn index_mut(&mut self, id: ChunkId) -> &mut Chunk {
        &mut self.slots[id.0 as usize]
    }
}
