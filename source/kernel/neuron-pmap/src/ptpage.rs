// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Table pages of the three-level tree and their deferred release
//! OWNERS: @kernel-mm-team
//! PUBLIC API (crate): SegmentTable, DirPage, PdeSlot, PageTablePage, FreeQueue
//! INVARIANTS: a PDE slot encoding a superpage has no allocated next-level
//! page; wire counts equal the number of live entries below a page; frames of
//! unlinked table pages are released only after TLB synchronization

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::frames::FrameAllocator;
use crate::pte::{Pte, PteFlags};
use crate::types::{Pfn, PT_ENTRIES};

/// One directory slot: empty, backed by a leaf table page, or a superpage
/// mapping promoted in place.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum PdeSlot {
    Empty,
    /// A leaf table page exists; it is owned by the pmap's radix under the
    /// same linear directory index.
    Table,
    Super(Pte),
}

/// Leaf table page: 512 packed entry words plus a wire count.
///
/// Entry words are atomics because the software referenced/modified fault
/// path and protect/unwire may read-modify-write the same word concurrently.
pub(crate) struct PageTablePage {
    frame: Pfn,
    wire: u16,
    entries: Box<[AtomicU64]>,
}

impl PageTablePage {
    pub(crate) fn new(frame: Pfn) -> Self {
        let entries = (0..PT_ENTRIES)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { frame, wire: 0, entries }
    }

    pub(crate) fn frame(&self) -> Pfn {
        self.frame
    }

    pub(crate) fn load(&self, index: usize) -> Pte {
        Pte::from_raw(self.entries[index].load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, index: usize, pte: Pte) {
        self.entries[index].store(pte.raw(), Ordering::Release);
    }

    /// Atomically clears the slot and returns the previous word.
    pub(crate) fn clear(&self, index: usize) -> Pte {
        Pte::from_raw(self.entries[index].swap(0, Ordering::AcqRel))
    }

    /// Atomic read-modify-write setting `flags`; returns the previous word.
    pub(crate) fn fetch_set(&self, index: usize, flags: PteFlags) -> Pte {
        Pte::from_raw(self.entries[index].fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Atomic read-modify-write clearing `flags`; returns the previous word.
    pub(crate) fn fetch_clear(&self, index: usize, flags: PteFlags) -> Pte {
        Pte::from_raw(self.entries[index].fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    /// Single-word compare-and-swap; `Err` carries the observed word.
    pub(crate) fn compare_exchange(&self, index: usize, old: Pte, new: Pte) -> Result<(), Pte> {
        self.entries[index]
            .compare_exchange(old.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(Pte::from_raw)
    }

    pub(crate) fn wire(&self) -> u16 {
        self.wire
    }

    pub(crate) fn inc_wire(&mut self) -> u16 {
        self.wire += 1;
        debug_assert!(self.wire as usize <= PT_ENTRIES);
        self.wire
    }

    pub(crate) fn dec_wire(&mut self) -> u16 {
        debug_assert!(self.wire > 0, "table page wire underflow");
        self.wire -= 1;
        self.wire
    }

    pub(crate) fn set_wire(&mut self, wire: u16) {
        debug_assert!(wire as usize <= PT_ENTRIES);
        self.wire = wire;
    }

    pub(crate) fn is_full(&self) -> bool {
        self.wire as usize == PT_ENTRIES
    }
}

/// Mid-level directory page: 512 PDE slots plus a wire count of non-empty
/// slots (leaf pages and superpage mappings both count).
pub(crate) struct DirPage {
    frame: Pfn,
    wire: u16,
    slots: Box<[PdeSlot]>,
}

impl DirPage {
    pub(crate) fn new(frame: Pfn) -> Self {
        let slots = (0..PT_ENTRIES)
            .map(|_| PdeSlot::Empty)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { frame, wire: 0, slots }
    }

    pub(crate) fn frame(&self) -> Pfn {
        self.frame
    }

    pub(crate) fn slot(&self, index: usize) -> PdeSlot {
        self.slots[index]
    }

    pub(crate) fn set_slot(&mut self, index: usize, slot: PdeSlot) {
        self.slots[index] = slot;
    }

    pub(crate) fn wire(&self) -> u16 {
        self.wire
    }

    pub(crate) fn inc_wire(&mut self) -> u16 {
        self.wire += 1;
        debug_assert!(self.wire as usize <= PT_ENTRIES);
        self.wire
    }

    pub(crate) fn dec_wire(&mut self) -> u16 {
        debug_assert!(self.wire > 0, "directory page wire underflow");
        self.wire -= 1;
        self.wire
    }
}

/// Root of an address space's tree; always present while the pmap lives.
pub(crate) struct SegmentTable {
    frame: Pfn,
    dirs: Box<[Option<DirPage>]>,
}

impl SegmentTable {
    pub(crate) fn new(frame: Pfn) -> Self {
        let mut dirs: Vec<Option<DirPage>> = Vec::with_capacity(PT_ENTRIES);
        for _ in 0..PT_ENTRIES {
            dirs.push(None);
        }
        Self { frame, dirs: dirs.into_boxed_slice() }
    }

    pub(crate) fn frame(&self) -> Pfn {
        self.frame
    }

    pub(crate) fn dir(&self, seg: usize) -> Option<&DirPage> {
        self.dirs[seg].as_ref()
    }

    pub(crate) fn dir_mut(&mut self, seg: usize) -> Option<&mut DirPage> {
        self.dirs[seg].as_mut()
    }

    pub(crate) fn install_dir(&mut self, seg: usize, dir: DirPage) {
        debug_assert!(self.dirs[seg].is_none());
        self.dirs[seg] = Some(dir);
    }

    pub(crate) fn take_dir(&mut self, seg: usize) -> Option<DirPage> {
        self.dirs[seg].take()
    }

    pub(crate) fn dirs(&self) -> impl Iterator<Item = &DirPage> {
        self.dirs.iter().filter_map(|d| d.as_ref())
    }
}

/// Frames queued for release after the TLB traffic that could still
/// reference them has been issued. Never drains inside a removal.
pub(crate) struct FreeQueue {
    frames: Vec<Pfn>,
}

impl FreeQueue {
    pub(crate) fn new() -> Self {
        Self { frames: Vec::new() }
    }

    pub(crate) fn push_frame(&mut self, frame: Pfn) {
        self.frames.push(frame);
    }

    pub(crate) fn push_ptp(&mut self, ptp: PageTablePage) {
        debug_assert_eq!(ptp.wire(), 0, "freeing a wired table page");
        self.frames.push(ptp.frame);
    }

    pub(crate) fn drain(&mut self, frames: &dyn FrameAllocator) {
        for frame in self.frames.drain(..) {
            frames.free(frame);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }
}

impl Drop for FreeQueue {
    fn drop(&mut self) {
        debug_assert!(self.frames.is_empty(), "free queue dropped undrained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemAttr, Protection};

    #[test]
    fn atomic_entry_edits() {
        let mut ptp = PageTablePage::new(Pfn::new(42));
        let pte = Pte::new_leaf(Pfn::new(7), Protection::RW, MemAttr::WriteBack, PteFlags::VALID);
        ptp.store(3, pte);
        assert_eq!(ptp.load(3), pte);
        let prev = ptp.fetch_set(3, PteFlags::MODIFIED);
        assert_eq!(prev, pte);
        assert!(ptp.load(3).is_modified());
        let prev = ptp.fetch_clear(3, PteFlags::MODIFIED);
        assert!(prev.is_modified());
        assert!(!ptp.load(3).is_modified());
        assert_eq!(ptp.clear(3).pfn(), Pfn::new(7));
        assert_eq!(ptp.load(3), Pte::EMPTY);
        ptp.inc_wire();
        assert_eq!(ptp.dec_wire(), 0);
    }

    #[test]
    fn compare_exchange_reports_observed_word() {
        let ptp = PageTablePage::new(Pfn::new(1));
        let a = Pte::new_leaf(Pfn::new(1), Protection::READ, MemAttr::WriteBack, PteFlags::empty());
        let b = Pte::new_leaf(Pfn::new(2), Protection::READ, MemAttr::WriteBack, PteFlags::empty());
        ptp.store(0, a);
        assert_eq!(ptp.compare_exchange(0, b, a), Err(a));
        assert_eq!(ptp.compare_exchange(0, a, b), Ok(()));
        assert_eq!(ptp.load(0), b);
    }
}
