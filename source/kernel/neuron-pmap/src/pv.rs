// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: PV-entry allocator: fixed-capacity chunks with O(1) alloc/free
//! OWNERS: @kernel-mm-team
//! PUBLIC API (crate): PvChunkList, PvHandle, PV_PER_CHUNK
//! INVARIANTS: a chunk occupies one frame; reserved capacity is never handed
//! out to plain `get` calls; an entirely free chunk returns its frame
//!
//! Entries are packed into frame-backed chunks with an occupancy bitmap so a
//! mapping never costs a separate allocation. `reserve` pins capacity before
//! multi-step operations (demotion) that must not fail partway through.

extern crate alloc;

use alloc::vec::Vec;

use static_assertions::const_assert;

use crate::types::{VirtAddr, PAGE_SIZE};

/// Entries per chunk; sized so one chunk fits in a single frame.
pub(crate) const PV_PER_CHUNK: usize = 168;
const BITMAP_WORDS: usize = 3;
const LAST_WORD_MASK: u64 = (1u64 << (PV_PER_CHUNK - 2 * 64)) - 1;

const_assert!(PV_PER_CHUNK <= BITMAP_WORDS * 64);

/// Index of an entry slot within a pmap's chunk list.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct PvHandle {
    chunk: u32,
    slot: u32,
}

struct PvChunk {
    frame: crate::types::Pfn,
    /// Set bit = free slot.
    bitmap: [u64; BITMAP_WORDS],
    used: u16,
    vas: [usize; PV_PER_CHUNK],
}

const_assert!(core::mem::size_of::<PvChunk>() <= PAGE_SIZE);

impl PvChunk {
    fn new(frame: crate::types::Pfn) -> Self {
        Self {
            frame,
            bitmap: [u64::MAX, u64::MAX, LAST_WORD_MASK],
            used: 0,
            vas: [0; PV_PER_CHUNK],
        }
    }

    fn alloc_slot(&mut self) -> Option<usize> {
        for (word_index, word) in self.bitmap.iter_mut().enumerate() {
            if *word != 0 {
                let bit = word.trailing_zeros() as usize;
                *word &= !(1u64 << bit);
                self.used += 1;
                return Some(word_index * 64 + bit);
            }
        }
        None
    }

    fn free_slot(&mut self, slot: usize) {
        let word = slot / 64;
        let bit = slot % 64;
        debug_assert_eq!(self.bitmap[word] & (1 << bit), 0, "double free of PV slot");
        self.bitmap[word] |= 1 << bit;
        self.used -= 1;
    }

    fn is_unused(&self) -> bool {
        self.used == 0
    }
}

/// Per-address-space chunk list. Guarded by the owning pmap's lock.
/// `hint` names the chunk most recently known to hold a free slot, so
/// allocation starts there instead of rescanning full chunks.
pub(crate) struct PvChunkList {
    chunks: Vec<Option<PvChunk>>,
    free_slots: usize,
    reserved: usize,
    hint: usize,
}

impl PvChunkList {
    pub(crate) fn new() -> Self {
        Self { chunks: Vec::new(), free_slots: 0, reserved: 0, hint: 0 }
    }

    /// Slots obtainable through `get` right now.
    pub(crate) fn free_capacity(&self) -> usize {
        self.free_slots - self.reserved
    }

    /// Adds a fresh frame-backed chunk.
    pub(crate) fn add_chunk(&mut self, frame: crate::types::Pfn) {
        self.free_slots += PV_PER_CHUNK;
        let index = self.chunks.iter().position(|c| c.is_none());
        match index {
            Some(index) => self.chunks[index] = Some(PvChunk::new(frame)),
            None => self.chunks.push(Some(PvChunk::new(frame))),
        }
        self.hint = index.unwrap_or(self.chunks.len() - 1);
    }

    /// Pins `n` slots of existing capacity for an operation that must not
    /// fail once it starts mutating.
    pub(crate) fn reserve(&mut self, n: usize) {
        debug_assert!(self.free_capacity() >= n, "reserving beyond capacity");
        self.reserved += n;
    }

    pub(crate) fn unreserve(&mut self, n: usize) {
        debug_assert!(self.reserved >= n);
        self.reserved -= n;
    }

    /// Takes a slot from unreserved capacity.
    pub(crate) fn get(&mut self, va: VirtAddr) -> Option<PvHandle> {
        if self.free_capacity() == 0 {
            return None;
        }
        Some(self.take_any(va))
    }

    /// Takes a slot previously pinned by `reserve`.
    pub(crate) fn get_reserved(&mut self, va: VirtAddr) -> PvHandle {
        debug_assert!(self.reserved > 0, "no reserved PV capacity");
        self.reserved -= 1;
        self.take_any(va)
    }

    fn take_any(&mut self, va: VirtAddr) -> PvHandle {
        let count = self.chunks.len();
        for offset in 0..count {
            let chunk_index = (self.hint + offset) % count;
            if let Some(chunk) = self.chunks[chunk_index].as_mut() {
                if let Some(slot) = chunk.alloc_slot() {
                    chunk.vas[slot] = va.raw();
                    self.free_slots -= 1;
                    self.hint = chunk_index;
                    return PvHandle { chunk: chunk_index as u32, slot: slot as u32 };
                }
            }
        }
        panic!("PV capacity accounting out of sync");
    }

    pub(crate) fn va(&self, handle: PvHandle) -> VirtAddr {
        let chunk = self.chunk(handle.chunk);
        match VirtAddr::new(chunk.vas[handle.slot as usize]) {
            Some(va) => va,
            None => panic!("PV slot holds a non-canonical address"),
        }
    }

    /// Frees a slot; if its chunk becomes entirely free, the chunk is
    /// dissolved and its backing frame returned for release.
    pub(crate) fn free(&mut self, handle: PvHandle) -> Option<crate::types::Pfn> {
        let chunk = self.chunk_mut(handle.chunk);
        chunk.free_slot(handle.slot as usize);
        let unused = chunk.is_unused();
        self.free_slots += 1;
        self.hint = handle.chunk as usize;
        if unused && self.free_capacity() >= PV_PER_CHUNK {
            self.free_slots -= PV_PER_CHUNK;
            let chunk = self.chunks[handle.chunk as usize]
                .take()
                .map(|c| c.frame);
            debug_assert!(chunk.is_some());
            return chunk;
        }
        None
    }

    /// Takes `chunk_index`'s backing frame if the chunk has no live entries.
    /// Reclamation uses this to harvest a chunk it has just emptied even
    /// when overall capacity stays below the dissolve threshold.
    pub(crate) fn take_chunk_if_unused(&mut self, chunk_index: u32) -> Option<crate::types::Pfn> {
        let unused = self
            .chunks
            .get(chunk_index as usize)
            .and_then(|c| c.as_ref())
            .map(|c| c.is_unused())
            .unwrap_or(false);
        if !unused {
            return None;
        }
        self.free_slots -= PV_PER_CHUNK;
        self.chunks[chunk_index as usize].take().map(|c| c.frame)
    }

    /// Chunk indexes currently populated, for the reclamation scan.
    pub(crate) fn chunk_indexes(&self) -> impl Iterator<Item = u32> + '_ {
        self.chunks
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|_| i as u32))
    }

    /// Occupied slots of one chunk as (handle, va) pairs.
    pub(crate) fn chunk_entries(&self, chunk_index: u32) -> Vec<(PvHandle, VirtAddr)> {
        let chunk = self.chunk(chunk_index);
        let mut out = Vec::with_capacity(chunk.used as usize);
        for slot in 0..PV_PER_CHUNK {
            let word = slot / 64;
            let bit = slot % 64;
            if chunk.bitmap[word] & (1 << bit) == 0 {
                let handle = PvHandle { chunk: chunk_index, slot: slot as u32 };
                out.push((handle, self.va(handle)));
            }
        }
        out
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    fn chunk(&self, index: u32) -> &PvChunk {
        match self.chunks.get(index as usize).and_then(|c| c.as_ref()) {
            Some(chunk) => chunk,
            None => panic!("stale PV chunk handle"),
        }
    }

    fn chunk_mut(&mut self, index: u32) -> &mut PvChunk {
        match self.chunks.get_mut(index as usize).and_then(|c| c.as_mut()) {
            Some(chunk) => chunk,
            None => panic!("stale PV chunk handle"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pfn;

    fn va(n: usize) -> VirtAddr {
        VirtAddr::page_aligned(n * PAGE_SIZE).expect("aligned")
    }

    #[test]
    fn get_respects_reservation() {
        let mut list = PvChunkList::new();
        list.add_chunk(Pfn::new(1));
        assert_eq!(list.free_capacity(), PV_PER_CHUNK);
        list.reserve(PV_PER_CHUNK);
        assert!(list.get(va(1)).is_none());
        let h = list.get_reserved(va(1));
        assert_eq!(list.va(h), va(1));
        list.unreserve(PV_PER_CHUNK - 1);
        assert_eq!(list.free_capacity(), PV_PER_CHUNK - 1);
    }

    #[test]
    fn empty_chunk_returns_frame() {
        let mut list = PvChunkList::new();
        list.add_chunk(Pfn::new(9));
        let a = list.get(va(1)).expect("slot");
        let b = list.get(va(2)).expect("slot");
        assert!(list.free(a).is_none());
        assert_eq!(list.free(b), Some(Pfn::new(9)));
        assert_eq!(list.chunk_count(), 0);
        assert_eq!(list.free_capacity(), 0);
    }

    #[test]
    fn free_slot_hint_steers_allocation() {
        let mut list = PvChunkList::new();
        list.add_chunk(Pfn::new(1));
        let first: Vec<PvHandle> = (0..PV_PER_CHUNK)
            .map(|i| match list.get(va(i + 1)) {
                Some(handle) => handle,
                None => panic!("capacity reported but no slot"),
            })
            .collect();
        list.add_chunk(Pfn::new(2));
        let in_second = list.get(va(600)).expect("slot");
        assert_eq!(in_second.chunk, 1);
        let _ = list.free(first[3]);
        // the freed slot is the next one handed out, no scan of the
        // full chunk ahead of it
        let reused = list.get(va(601)).expect("slot");
        assert_eq!(reused.chunk, 0);
        assert_eq!(reused.slot, first[3].slot);
    }

    #[test]
    fn chunk_fills_completely() {
        let mut list = PvChunkList::new();
        list.add_chunk(Pfn::new(3));
        for i in 0..PV_PER_CHUNK {
            assert!(list.get(va(i + 1)).is_some());
        }
        assert!(list.get(va(500)).is_none());
        assert_eq!(list.chunk_entries(0).len(), PV_PER_CHUNK);
    }
}
