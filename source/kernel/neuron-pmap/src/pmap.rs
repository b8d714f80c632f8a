// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-address-space page-table tree and the mapping lifecycle
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! PUBLIC API: Pmap (enter/enter_quick/remove/protect/unwire/extract/
//! emulate_fault/change_attr, activate/deactivate, counters), EnterFlags,
//! PmapError, FaultError, FaultAccess, PtpHint
//! DEPENDS_ON: ptpage, pv, phys, tlb, frames, system
//! INVARIANTS: resident_count equals the valid leaf mappings reachable from
//! the tree (superpages count 512); a pmap with resident_count == 0 owns no
//! intermediate table pages; PTE mutation that must be immediately visible
//! is followed by TLB invalidation before the operation returns
//!
//! Locking: the pmap lock guards the tree, the PV chunk list and the
//! counters. Reverse-map shards are taken after the pmap lock, never before.
//! The only blocking points drop the pmap lock first, refill a frame stock,
//! and retry with the tree re-validated, which replaces the source design's
//! goto-based retry convention with named loops.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::frames::{alloc_frame, AllocPolicy, FrameAllocator};
use crate::phys::{PageAttrs, PvRef};
use crate::pte::{effective_attr, Pte, PteFlags};
use crate::ptpage::{DirPage, FreeQueue, PageTablePage, PdeSlot, SegmentTable};
use crate::pv::PvChunkList;
use crate::system::{PmapHandle, PmapSystem};
use crate::tlb::Asid;
use crate::types::{
    CpuId, CpuSet, MemAttr, Pfn, PhysAddr, Protection, VirtAddr, MAX_CPUS, PAGE_SIZE,
    SUPERPAGE_PAGES, SUPERPAGE_SHIFT, SUPERPAGE_SIZE,
};

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Modifiers accepted by [`Pmap::enter`].
    pub struct EnterFlags: u8 {
        /// Exclude the mapping from reclamation accounting.
        const WIRED = 1 << 0;
        /// Fault-time caller: never block for memory, surface
        /// [`PmapError::ResourceShortage`] instead.
        const NOSLEEP = 1 << 1;
    }
}

/// Errors surfaced by mapping operations.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PmapError {
    /// A table page or PV chunk could not be allocated under a non-blocking
    /// request. Retryable after the caller frees memory elsewhere.
    ResourceShortage,
    /// The operation requires an existing mapping that is not present.
    NotMapped,
    /// An address argument is not page aligned.
    Unaligned,
}

/// Outcome of the software referenced/modified fault hook.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaultError {
    /// No valid translation at the faulting address.
    NotMapped,
    /// Store to a mapping without write permission.
    ReadOnly,
}

/// Access kind reported by the fault handler.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaultAccess {
    Load,
    Store,
}

/// Opaque hint naming the table page used by a best-effort enter, so runs of
/// consecutive insertions skip the radix lookup.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PtpHint(pub(crate) usize);

/// Tree state guarded by the pmap lock.
pub(crate) struct PmapInner {
    pub(crate) seg: SegmentTable,
    /// Leaf table pages, keyed by linear directory index.
    pub(crate) ptps: BTreeMap<usize, PageTablePage>,
    /// Table pages parked across promotion, reused by a later demotion.
    pub(crate) stash: BTreeMap<usize, PageTablePage>,
    pub(crate) pv: PvChunkList,
}

impl PmapInner {
    pub(crate) fn pde(&self, va: VirtAddr) -> PdeSlot {
        self.seg
            .dir(va.seg_index())
            .map(|d| d.slot(va.dir_index()))
            .unwrap_or(PdeSlot::Empty)
    }

    /// Rewrites an existing PDE slot without wire-count changes.
    pub(crate) fn set_pde(&mut self, va: VirtAddr, slot: PdeSlot) {
        match self.seg.dir_mut(va.seg_index()) {
            Some(dir) => dir.set_slot(va.dir_index(), slot),
            None => panic!("PDE update without a directory page"),
        }
    }

    /// Allocates any missing directory/leaf level for `va` from `stock`.
    fn ensure_ptp(&mut self, va: VirtAddr, stock: &mut FrameStock<'_>) -> Result<(), PmapError> {
        match self.pde(va) {
            PdeSlot::Table => Ok(()),
            PdeSlot::Super(_) => panic!("allocating under a superpage slot"),
            PdeSlot::Empty => {
                let seg_index = va.seg_index();
                let fresh_dir = self.seg.dir(seg_index).is_none();
                if fresh_dir {
                    let frame = stock.take()?;
                    self.seg.install_dir(seg_index, DirPage::new(frame));
                }
                let frame = match stock.take() {
                    Ok(frame) => frame,
                    Err(e) => {
                        if fresh_dir {
                            if let Some(dir) = self.seg.take_dir(seg_index) {
                                stock.put_back(dir.frame());
                            }
                        }
                        return Err(e);
                    }
                };
                self.ptps.insert(va.pt_index(), PageTablePage::new(frame));
                match self.seg.dir_mut(seg_index) {
                    Some(dir) => {
                        dir.set_slot(va.dir_index(), PdeSlot::Table);
                        dir.inc_wire();
                    }
                    None => panic!("directory vanished during allocation"),
                }
                Ok(())
            }
        }
    }
}

/// Frames pre-pulled from the allocator so the locked sections never call
/// into it with `WaitOk`. Unused frames flow back on drop.
struct FrameStock<'a> {
    frames: &'a dyn FrameAllocator,
    spare: Vec<Pfn>,
}

impl<'a> FrameStock<'a> {
    fn new(frames: &'a dyn FrameAllocator) -> Self {
        Self { frames, spare: Vec::new() }
    }

    fn take(&mut self) -> Result<Pfn, PmapError> {
        if let Some(frame) = self.spare.pop() {
            return Ok(frame);
        }
        alloc_frame(self.frames, AllocPolicy::NoWait).map_err(|_| PmapError::ResourceShortage)
    }

    fn put_back(&mut self, frame: Pfn) {
        self.spare.push(frame);
    }

    fn refill_blocking(&mut self) -> Result<(), PmapError> {
        let frame =
            alloc_frame(self.frames, AllocPolicy::WaitOk).map_err(|_| PmapError::ResourceShortage)?;
        self.spare.push(frame);
        Ok(())
    }
}

impl Drop for FrameStock<'_> {
    fn drop(&mut self) {
        for frame in self.spare.drain(..) {
            self.frames.free(frame);
        }
    }
}

/// One address space's physical map.
pub struct Pmap {
    pub(crate) system: Arc<PmapSystem>,
    handle: PmapHandle,
    kernel: bool,
    pub(crate) inner: Mutex<PmapInner>,
    resident: AtomicUsize,
    wired: AtomicUsize,
    active: AtomicU64,
    /// Per-CPU packed (generation << 16 | asid) tags.
    asids: [AtomicU64; MAX_CPUS],
}

const fn pack_asid(asid: Asid, generation: u64) -> u64 {
    (generation << 16) | asid.0 as u64
}

impl Pmap {
    pub(crate) fn new(
        system: Arc<PmapSystem>,
        handle: PmapHandle,
        kernel: bool,
        root: Pfn,
        cpus: usize,
    ) -> Self {
        let asids = core::array::from_fn(|_| {
            AtomicU64::new(if kernel { pack_asid(Asid::KERNEL, 1) } else { 0 })
        });
        Self {
            system,
            handle,
            kernel,
            inner: Mutex::new(PmapInner {
                seg: SegmentTable::new(root),
                ptps: BTreeMap::new(),
                stash: BTreeMap::new(),
                pv: PvChunkList::new(),
            }),
            resident: AtomicUsize::new(0),
            wired: AtomicUsize::new(0),
            active: AtomicU64::new(if kernel { CpuSet::all(cpus).bits() } else { 0 }),
            asids,
        }
    }

    pub fn handle(&self) -> PmapHandle {
        self.handle
    }

    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    /// Valid leaf mappings reachable from this tree (superpages count 512).
    pub fn resident_count(&self) -> usize {
        self.resident.load(Ordering::Relaxed)
    }

    pub fn wired_count(&self) -> usize {
        self.wired.load(Ordering::Relaxed)
    }

    pub fn active_cpus(&self) -> CpuSet {
        CpuSet::from_bits(self.active.load(Ordering::Acquire))
    }

    /// Marks this address space active on `cpu` and tags it with a fresh
    /// ASID there. The kernel pmap keeps ASID 0 everywhere.
    pub fn activate(&self, cpu: CpuId) {
        let packed = if self.kernel {
            let asids = self.system.asids.lock();
            pack_asid(Asid::KERNEL, asids.generation(cpu))
        } else {
            let mut asids = self.system.asids.lock();
            let (asid, generation) = asids.allocate(cpu);
            pack_asid(asid, generation)
        };
        self.asids[cpu.raw()].store(packed, Ordering::Release);
        self.active.fetch_or(cpu.bit(), Ordering::AcqRel);
    }

    pub fn deactivate(&self, cpu: CpuId) {
        debug_assert!(!self.kernel, "kernel pmap never deactivates");
        self.active.fetch_and(!cpu.bit(), Ordering::AcqRel);
    }

    /// ASID tagging this space on `cpu`, if it is active there.
    pub fn asid_on(&self, cpu: CpuId) -> Option<Asid> {
        if !self.active_cpus().contains(cpu) {
            return None;
        }
        Some(Asid(self.asids[cpu.raw()].load(Ordering::Acquire) as u16))
    }

    /// True when another processor holds this space active under an ASID
    /// generation that has since rolled over: a targeted invalidate there
    /// would be incorrect without a cross-call, so callers fall back to one
    /// bulk flush.
    fn has_stale_remote_asid(&self, current: CpuId) -> bool {
        if self.kernel {
            return false;
        }
        let active = self.active_cpus().without(current);
        if active.is_empty() {
            return false;
        }
        let asids = self.system.asids.lock();
        for raw in 0..MAX_CPUS {
            let cpu = match CpuId::new(raw) {
                Some(cpu) => cpu,
                None => break,
            };
            if !active.contains(cpu) {
                continue;
            }
            let generation = self.asids[raw].load(Ordering::Acquire) >> 16;
            if generation != asids.generation(cpu) {
                return true;
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // enter
    // ------------------------------------------------------------------

    /// Installs (or replaces) a single base-page mapping.
    ///
    /// `prot` is the permission granted; `access` is the access that faulted
    /// us here, used to pre-set the software modified bit so a permitted
    /// store does not immediately re-fault. Every new entry carries the
    /// referenced bit for the same reason.
    pub fn enter(
        &self,
        va: VirtAddr,
        pfn: Pfn,
        prot: Protection,
        access: Protection,
        flags: EnterFlags,
    ) -> Result<(), PmapError> {
        if !va.is_page_aligned() {
            return Err(PmapError::Unaligned);
        }
        debug_assert!(prot.contains(Protection::READ));
        let system = &self.system;
        let managed_attr = system.pages.attr_of(pfn);
        let managed = managed_attr.is_some();
        let attr = effective_attr(
            managed_attr.unwrap_or(MemAttr::WriteBack),
            system.frames.is_cacheable(pfn),
        );
        let wait = !flags.contains(EnterFlags::NOSLEEP);
        let mut stock = FrameStock::new(&*system.frames);
        let mut freeq = FreeQueue::new();

        // Acquire the leaf table page and PV capacity, re-validating the
        // tree after every wait.
        let mut guard = loop {
            let mut guard = self.inner.lock();
            if let PdeSlot::Super(_) = guard.pde(va) {
                // Base-page granularity inside a superpage region.
                let _ = self.demote_locked(&mut guard, va, &mut freeq);
            }
            if !matches!(guard.pde(va), PdeSlot::Table) {
                if let Err(e) = guard.ensure_ptp(va, &mut stock) {
                    drop(guard);
                    if wait {
                        if let Err(e) = stock.refill_blocking() {
                            freeq.drain(&*system.frames);
                            return Err(e);
                        }
                        continue;
                    }
                    freeq.drain(&*system.frames);
                    return Err(e);
                }
            }
            if managed && guard.pv.free_capacity() == 0 {
                match stock.take() {
                    Ok(frame) => guard.pv.add_chunk(frame),
                    Err(e) => {
                        drop(guard);
                        if wait {
                            if stock.refill_blocking().is_ok() {
                                continue;
                            }
                            if let Some(frame) = system.reclaim_pv_chunk(self.handle) {
                                stock.put_back(frame);
                                continue;
                            }
                        }
                        self.abandon_empty_ptp(va, &mut freeq);
                        freeq.drain(&*system.frames);
                        return Err(e);
                    }
                }
            }
            break guard;
        };

        // Infallible from here on.
        let inner = &mut *guard;
        let leaf = va.leaf_index();
        let old = match inner.ptps.get(&va.pt_index()) {
            Some(ptp) => ptp.load(leaf),
            None => panic!("leaf table page missing after allocation"),
        };

        let new_wired = flags.contains(EnterFlags::WIRED);
        let mut extra = PteFlags::REFERENCED;
        if access.contains(Protection::WRITE) && prot.contains(Protection::WRITE) {
            extra |= PteFlags::MODIFIED;
        }
        if new_wired {
            extra |= PteFlags::WIRED;
        }
        if managed {
            extra |= PteFlags::MANAGED;
        }
        if self.kernel {
            extra |= PteFlags::GLOBAL;
        }

        let mut invalidate = false;
        if old.is_valid() && old.pfn() == pfn {
            // Same frame: protection/wiring update in place. The PV entry,
            // wire count and resident count all stay. The managed bit is
            // inherited from the existing entry so a frame registered after
            // the fact does not end up with a PTE claiming a PV entry that
            // was never created.
            if !old.is_managed() {
                extra.remove(PteFlags::MANAGED);
            }
            if old.is_wired() && !new_wired {
                self.wired.fetch_sub(1, Ordering::Relaxed);
            } else if !old.is_wired() && new_wired {
                self.wired.fetch_add(1, Ordering::Relaxed);
            }
            if old.is_modified() {
                if prot.contains(Protection::WRITE) {
                    extra |= PteFlags::MODIFIED;
                } else if old.is_managed() {
                    let mut shard = system.pages.shard_for(pfn).write();
                    shard.page_mut(pfn).saved |= PageAttrs::MODIFIED;
                }
            }
            let new = Pte::new_leaf(pfn, prot, attr, extra);
            match inner.ptps.get(&va.pt_index()) {
                Some(ptp) => ptp.store(leaf, new),
                None => panic!("leaf table page missing"),
            }
            if old.protection() != new.protection() || old.attr() != attr {
                invalidate = true;
            }
        } else {
            if old.is_valid() {
                // Different frame: the stale translation and its PV entry go
                // first. The slot is refilled below, so the wire count and
                // resident count are handed straight to the new mapping.
                self.teardown_leaf(inner, va, old, &mut freeq);
                self.resident.fetch_sub(1, Ordering::Relaxed);
                invalidate = true;
            }
            if managed {
                let slot = match inner.pv.get(va) {
                    Some(slot) => slot,
                    None => panic!("PV capacity vanished under the pmap lock"),
                };
                let mut shard = system.pages.shard_for(pfn).write();
                shard.page_mut(pfn).pv.push(PvRef { pmap: self.handle, va, slot });
            }
            let new = Pte::new_leaf(pfn, prot, attr, extra);
            match inner.ptps.get_mut(&va.pt_index()) {
                Some(ptp) => {
                    ptp.store(leaf, new);
                    if !old.is_valid() {
                        ptp.inc_wire();
                    }
                }
                None => panic!("leaf table page missing"),
            }
            self.resident.fetch_add(1, Ordering::Relaxed);
            if new_wired {
                self.wired.fetch_add(1, Ordering::Relaxed);
            }
        }

        if invalidate {
            system.tlb.page(self, va);
        }

        if system.superpages_enabled {
            let full = inner
                .ptps
                .get(&va.pt_index())
                .map(|ptp| ptp.is_full())
                .unwrap_or(false);
            if full {
                self.try_promote_locked(inner, va, &mut freeq);
            }
        }

        drop(guard);
        freeq.drain(&*system.frames);
        Ok(())
    }

    /// Best-effort mapping insertion for prefault paths: never blocks, never
    /// replaces an existing mapping, never wires. Returns the table-page
    /// hint on success.
    pub fn enter_quick(
        &self,
        va: VirtAddr,
        pfn: Pfn,
        prot: Protection,
        hint: Option<PtpHint>,
    ) -> Option<PtpHint> {
        if !va.is_page_aligned() {
            return None;
        }
        let system = &self.system;
        let managed_attr = system.pages.attr_of(pfn);
        let managed = managed_attr.is_some();
        let attr = effective_attr(
            managed_attr.unwrap_or(MemAttr::WriteBack),
            system.frames.is_cacheable(pfn),
        );
        let mut stock = FrameStock::new(&*system.frames);
        let mut freeq = FreeQueue::new();
        let mut guard = self.inner.lock();

        if let PdeSlot::Super(_) = guard.pde(va) {
            // The quick path never forces a demotion.
            return None;
        }
        debug_assert!(hint.map(|h| h.0 == va.pt_index()).unwrap_or(true));
        if !matches!(guard.pde(va), PdeSlot::Table) {
            if guard.ensure_ptp(va, &mut stock).is_err() {
                return None;
            }
        }
        let leaf = va.leaf_index();
        let existing = match guard.ptps.get(&va.pt_index()) {
            Some(ptp) => ptp.load(leaf),
            None => panic!("leaf table page missing after allocation"),
        };
        if existing.is_valid() {
            return None;
        }
        if managed && guard.pv.free_capacity() == 0 {
            match stock.take() {
                Ok(frame) => guard.pv.add_chunk(frame),
                Err(_) => {
                    self.unlink_if_empty(&mut guard, va, &mut freeq);
                    drop(guard);
                    freeq.drain(&*system.frames);
                    return None;
                }
            }
        }

        let mut extra = PteFlags::REFERENCED;
        if managed {
            extra |= PteFlags::MANAGED;
        }
        if self.kernel {
            extra |= PteFlags::GLOBAL;
        }
        let inner = &mut *guard;
        if managed {
            let slot = match inner.pv.get(va) {
                Some(slot) => slot,
                None => panic!("PV capacity vanished under the pmap lock"),
            };
            let mut shard = system.pages.shard_for(pfn).write();
            shard.page_mut(pfn).pv.push(PvRef { pmap: self.handle, va, slot });
        }
        let new = Pte::new_leaf(pfn, prot, attr, extra);
        let pt_index = va.pt_index();
        match inner.ptps.get_mut(&pt_index) {
            Some(ptp) => {
                ptp.store(leaf, new);
                ptp.inc_wire();
            }
            None => panic!("leaf table page missing"),
        }
        self.resident.fetch_add(1, Ordering::Relaxed);
        drop(guard);
        freeq.drain(&*system.frames);
        Some(PtpHint(pt_index))
    }

    // ------------------------------------------------------------------
    // remove
    // ------------------------------------------------------------------

    /// Removes every mapping in `[sva, eva)`. Superpages only partially
    /// covered are demoted first. The TLB is synchronized before return.
    pub fn remove(&self, sva: VirtAddr, eva: VirtAddr) {
        debug_assert!(sva.is_page_aligned() && eva.is_page_aligned());
        if sva >= eva {
            return;
        }
        let mut freeq = FreeQueue::new();
        let mut guard = self.inner.lock();
        if eva.raw() - sva.raw() == PAGE_SIZE {
            // Fast path: the overwhelmingly common single-page case.
            if let PdeSlot::Super(_) = guard.pde(sva) {
                if !self.demote_locked(&mut guard, sva, &mut freeq) {
                    drop(guard);
                    freeq.drain(&*self.system.frames);
                    return;
                }
            }
            if self.remove_leaf_locked(&mut guard, sva, &mut freeq) {
                self.system.tlb.page(self, sva);
                self.unlink_if_empty(&mut guard, sva, &mut freeq);
            }
        } else {
            self.remove_range_locked(&mut guard, sva, eva, &mut freeq);
        }
        drop(guard);
        freeq.drain(&*self.system.frames);
    }

    fn remove_range_locked(
        &self,
        guard: &mut PmapInner,
        sva: VirtAddr,
        eva: VirtAddr,
        freeq: &mut FreeQueue,
    ) {
        let mut cursor = sva.raw();
        let end = eva.raw();
        while cursor < end {
            let span_end = core::cmp::min(end, (cursor & !(SUPERPAGE_SIZE - 1)) + SUPERPAGE_SIZE);
            let va = va_at(cursor);
            match guard.pde(va) {
                PdeSlot::Empty => {}
                PdeSlot::Super(spte) => {
                    if va.is_superpage_aligned() && span_end - cursor == SUPERPAGE_SIZE {
                        self.remove_superpage_locked(guard, va, spte, freeq);
                    } else if self.demote_locked(guard, va, freeq) {
                        self.remove_leaves_locked(guard, cursor, span_end, freeq);
                    }
                }
                PdeSlot::Table => {
                    self.remove_leaves_locked(guard, cursor, span_end, freeq);
                }
            }
            cursor = span_end;
        }
    }

    /// Removes leaves in `[start, end)` within one table page, batching the
    /// invalidation of each contiguous run into a single range operation.
    fn remove_leaves_locked(
        &self,
        guard: &mut PmapInner,
        start: usize,
        end: usize,
        freeq: &mut FreeQueue,
    ) {
        debug_assert_eq!(
            start >> SUPERPAGE_SHIFT,
            (end - 1) >> SUPERPAGE_SHIFT,
            "span crosses table pages"
        );
        let mut run_start: Option<usize> = None;
        let mut cursor = start;
        while cursor < end {
            let removed = self.remove_leaf_locked(guard, va_at(cursor), freeq);
            if removed {
                run_start.get_or_insert(cursor);
            } else if let Some(s) = run_start.take() {
                self.system.tlb.range(self, va_at(s), cursor);
            }
            cursor += PAGE_SIZE;
        }
        if let Some(s) = run_start.take() {
            self.system.tlb.range(self, va_at(s), cursor);
        }
        self.unlink_if_empty(guard, va_at(start), freeq);
    }

    /// Clears one leaf and performs its bookkeeping. Returns whether a valid
    /// mapping was present. Does not invalidate or unlink; callers batch.
    pub(crate) fn remove_leaf_locked(
        &self,
        guard: &mut PmapInner,
        va: VirtAddr,
        freeq: &mut FreeQueue,
    ) -> bool {
        let old = {
            let ptp = match guard.ptps.get_mut(&va.pt_index()) {
                Some(ptp) => ptp,
                None => return false,
            };
            let old = ptp.clear(va.leaf_index());
            if !old.is_valid() {
                return false;
            }
            ptp.dec_wire();
            old
        };
        self.teardown_leaf(guard, va, old, freeq);
        self.resident.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Reverse-map and counter bookkeeping for a leaf word that has already
    /// been cleared out of the tree. Leaves resident/wire counts to callers
    /// that recycle the slot.
    fn teardown_leaf(&self, guard: &mut PmapInner, va: VirtAddr, old: Pte, freeq: &mut FreeQueue) {
        if old.is_wired() {
            self.wired.fetch_sub(1, Ordering::Relaxed);
        }
        if old.is_managed() {
            let pfn = old.pfn();
            let slot = {
                let mut shard = self.system.pages.shard_for(pfn).write();
                let entry = shard.remove_pv(pfn, self.handle, va);
                let meta = shard.page_mut(pfn);
                if old.is_referenced() {
                    meta.saved |= PageAttrs::REFERENCED;
                }
                if old.is_modified() {
                    meta.saved |= PageAttrs::MODIFIED;
                }
                entry.slot
            };
            if let Some(frame) = guard.pv.free(slot) {
                freeq.push_frame(frame);
            }
        }
    }

    /// Tears down a fully covered superpage mapping.
    pub(crate) fn remove_superpage_locked(
        &self,
        guard: &mut PmapInner,
        va: VirtAddr,
        spte: Pte,
        freeq: &mut FreeQueue,
    ) {
        debug_assert!(va.is_superpage_aligned());
        let base = spte.pfn();
        if spte.is_managed() {
            let slot = {
                let mut shard = self.system.pages.super_shard_for(base).write();
                shard.super_remove_pv(base, self.handle, va).slot
            };
            if let Some(frame) = guard.pv.free(slot) {
                freeq.push_frame(frame);
            }
            if spte.is_referenced() || spte.is_modified() {
                for i in 0..SUPERPAGE_PAGES {
                    let pfn = match base.checked_add(i) {
                        Some(pfn) => pfn,
                        None => break,
                    };
                    let mut shard = self.system.pages.shard_for(pfn).write();
                    if let Some(meta) = shard.pages.get_mut(&pfn) {
                        if spte.is_referenced() {
                            meta.saved |= PageAttrs::REFERENCED;
                        }
                        if spte.is_modified() {
                            meta.saved |= PageAttrs::MODIFIED;
                        }
                    }
                }
            }
        }
        self.resident.fetch_sub(SUPERPAGE_PAGES, Ordering::Relaxed);
        if spte.is_wired() {
            self.wired.fetch_sub(SUPERPAGE_PAGES, Ordering::Relaxed);
        }
        self.clear_pde(guard, va, freeq);
        if let Some(stashed) = guard.stash.remove(&va.pt_index()) {
            freeq.push_frame(stashed.frame());
        }
        self.system.tlb.range(self, va, va.raw() + SUPERPAGE_SIZE);
    }

    /// Unlinks the leaf table page covering `va` if its wire count reached
    /// zero, queuing it (and an emptied directory page) for deferred free.
    pub(crate) fn unlink_if_empty(
        &self,
        guard: &mut PmapInner,
        va: VirtAddr,
        freeq: &mut FreeQueue,
    ) {
        let pt_index = va.pt_index();
        let empty = guard
            .ptps
            .get(&pt_index)
            .map(|ptp| ptp.wire() == 0)
            .unwrap_or(false);
        if !empty {
            return;
        }
        match guard.ptps.remove(&pt_index) {
            Some(ptp) => freeq.push_ptp(ptp),
            None => return,
        }
        self.clear_pde(guard, va, freeq);
    }

    fn clear_pde(&self, guard: &mut PmapInner, va: VirtAddr, freeq: &mut FreeQueue) {
        let seg_index = va.seg_index();
        let wire = match guard.seg.dir_mut(seg_index) {
            Some(dir) => {
                dir.set_slot(va.dir_index(), PdeSlot::Empty);
                dir.dec_wire()
            }
            None => panic!("clearing a PDE without a directory page"),
        };
        if wire == 0 {
            if let Some(dir) = guard.seg.take_dir(seg_index) {
                freeq.push_frame(dir.frame());
            }
        }
    }

    /// Error-path cleanup: drops a leaf page that was allocated but never
    /// populated, so a failed enter leaves the tree exactly as it found it.
    fn abandon_empty_ptp(&self, va: VirtAddr, freeq: &mut FreeQueue) {
        let mut guard = self.inner.lock();
        self.unlink_if_empty(&mut guard, va, freeq);
    }

    // ------------------------------------------------------------------
    // protect / unwire
    // ------------------------------------------------------------------

    /// Restricts permissions over `[sva, eva)`. Only write revocation has an
    /// effect; protecting to a writable permission is a documented no-op (a
    /// remap is required to grant write access).
    pub fn protect(&self, sva: VirtAddr, eva: VirtAddr, prot: Protection) {
        debug_assert!(sva.is_page_aligned() && eva.is_page_aligned());
        debug_assert!(prot.contains(Protection::READ));
        if prot.contains(Protection::WRITE) || sva >= eva {
            return;
        }
        let mut freeq = FreeQueue::new();
        let mut guard = self.inner.lock();
        let defer_bulk = self.has_stale_remote_asid(self.system.current_cpu());
        let mut need_bulk = false;

        let mut cursor = sva.raw();
        let end = eva.raw();
        while cursor < end {
            let span_end = core::cmp::min(end, (cursor & !(SUPERPAGE_SIZE - 1)) + SUPERPAGE_SIZE);
            let va = va_at(cursor);
            match guard.pde(va) {
                PdeSlot::Empty => {}
                PdeSlot::Super(spte) => {
                    if va.is_superpage_aligned() && span_end - cursor == SUPERPAGE_SIZE {
                        if spte.is_writeable() {
                            let was_modified = spte.is_modified();
                            let mut new = spte.without(PteFlags::WRITE);
                            if was_modified {
                                new = new.without(PteFlags::MODIFIED);
                                self.save_superpage_modified(spte);
                            }
                            guard.set_pde(va, PdeSlot::Super(new));
                            if was_modified {
                                if defer_bulk {
                                    need_bulk = true;
                                } else {
                                    self.system.tlb.range(self, va, cursor + SUPERPAGE_SIZE);
                                }
                            }
                        }
                    } else if self.demote_locked(&mut guard, va, &mut freeq) {
                        need_bulk |= self.protect_leaves_locked(
                            &mut guard, cursor, span_end, defer_bulk,
                        );
                    }
                }
                PdeSlot::Table => {
                    need_bulk |=
                        self.protect_leaves_locked(&mut guard, cursor, span_end, defer_bulk);
                }
            }
            cursor = span_end;
        }
        if need_bulk {
            self.system.tlb.all(self);
        }
        drop(guard);
        freeq.drain(&*self.system.frames);
    }

    /// Write-protects leaves in `[start, end)` of one table page. Returns
    /// whether a deferred bulk invalidation is owed.
    fn protect_leaves_locked(
        &self,
        guard: &mut PmapInner,
        start: usize,
        end: usize,
        defer_bulk: bool,
    ) -> bool {
        let va = va_at(start);
        let ptp = match guard.ptps.get(&va.pt_index()) {
            Some(ptp) => ptp,
            None => return false,
        };
        let mut need_bulk = false;
        let mut cursor = start;
        while cursor < end {
            let index = va_at(cursor).leaf_index();
            // Named retry loop standing in for the optimistic CAS of the
            // source design: a concurrent fault emulation may be flipping
            // referenced/modified on the same word.
            loop {
                let old = ptp.load(index);
                if !old.is_valid() || !old.is_writeable() {
                    break;
                }
                let was_modified = old.is_modified();
                let mut new = old.without(PteFlags::WRITE);
                if was_modified {
                    new = new.without(PteFlags::MODIFIED);
                }
                if ptp.compare_exchange(index, old, new).is_err() {
                    continue;
                }
                if was_modified {
                    if old.is_managed() {
                        let pfn = old.pfn();
                        let mut shard = self.system.pages.shard_for(pfn).write();
                        shard.page_mut(pfn).saved |= PageAttrs::MODIFIED;
                    }
                    // A clean mapping is already read-only in the TLB on
                    // this design, so only previously dirty entries need an
                    // invalidate.
                    if defer_bulk {
                        need_bulk = true;
                    } else {
                        self.system.tlb.page(self, va_at(cursor));
                    }
                }
                break;
            }
            cursor += PAGE_SIZE;
        }
        need_bulk
    }

    fn save_superpage_modified(&self, spte: Pte) {
        if !spte.is_managed() {
            return;
        }
        let base = spte.pfn();
        for i in 0..SUPERPAGE_PAGES {
            let pfn = match base.checked_add(i) {
                Some(pfn) => pfn,
                None => break,
            };
            let mut shard = self.system.pages.shard_for(pfn).write();
            if let Some(meta) = shard.pages.get_mut(&pfn) {
                meta.saved |= PageAttrs::MODIFIED;
            }
        }
    }

    /// Clears the wired bit over `[sva, eva)`. Every affected mapping must
    /// currently be wired; anything else is a caller bug and fatal. Wiring
    /// is invisible to the TLB, so no invalidation is issued.
    pub fn unwire(&self, sva: VirtAddr, eva: VirtAddr) {
        debug_assert!(sva.is_page_aligned() && eva.is_page_aligned());
        let mut freeq = FreeQueue::new();
        let mut guard = self.inner.lock();
        let mut cursor = sva.raw();
        let end = eva.raw();
        while cursor < end {
            let span_end = core::cmp::min(end, (cursor & !(SUPERPAGE_SIZE - 1)) + SUPERPAGE_SIZE);
            let va = va_at(cursor);
            match guard.pde(va) {
                PdeSlot::Empty => {}
                PdeSlot::Super(spte) => {
                    if va.is_superpage_aligned() && span_end - cursor == SUPERPAGE_SIZE {
                        assert!(spte.is_wired(), "unwiring an unwired superpage");
                        guard.set_pde(va, PdeSlot::Super(spte.without(PteFlags::WIRED)));
                        self.wired.fetch_sub(SUPERPAGE_PAGES, Ordering::Relaxed);
                    } else if self.demote_locked(&mut guard, va, &mut freeq) {
                        self.unwire_leaves_locked(&guard, cursor, span_end);
                    }
                }
                PdeSlot::Table => self.unwire_leaves_locked(&guard, cursor, span_end),
            }
            cursor = span_end;
        }
        drop(guard);
        freeq.drain(&*self.system.frames);
    }

    fn unwire_leaves_locked(&self, guard: &PmapInner, start: usize, end: usize) {
        let ptp = match guard.ptps.get(&va_at(start).pt_index()) {
            Some(ptp) => ptp,
            None => return,
        };
        let mut cursor = start;
        while cursor < end {
            let index = va_at(cursor).leaf_index();
            let prev = ptp.fetch_clear(index, PteFlags::WIRED);
            if prev.is_valid() {
                assert!(prev.is_wired(), "unwiring an unwired mapping");
                self.wired.fetch_sub(1, Ordering::Relaxed);
            }
            cursor += PAGE_SIZE;
        }
    }

    // ------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------

    /// Physical address currently translating `va`, if any.
    pub fn extract(&self, va: VirtAddr) -> Option<PhysAddr> {
        let guard = self.inner.lock();
        match guard.pde(va) {
            PdeSlot::Empty => None,
            PdeSlot::Super(spte) => {
                if spte.is_valid() {
                    Some(PhysAddr::new(spte.pa().raw() + va.offset_in_superpage()))
                } else {
                    None
                }
            }
            PdeSlot::Table => {
                let pte = guard.ptps.get(&va.pt_index())?.load(va.leaf_index());
                if pte.is_valid() {
                    Some(PhysAddr::new(pte.pa().raw() + va.offset_in_page()))
                } else {
                    None
                }
            }
        }
    }

    /// Software referenced/modified emulation, called by the fault layer on
    /// the first access or store to a mapping.
    pub fn emulate_fault(&self, va: VirtAddr, access: FaultAccess) -> Result<(), FaultError> {
        let mut guard = self.inner.lock();
        match guard.pde(va) {
            PdeSlot::Empty => Err(FaultError::NotMapped),
            PdeSlot::Super(spte) => {
                if !spte.is_valid() {
                    return Err(FaultError::NotMapped);
                }
                match access {
                    FaultAccess::Load => {
                        guard.set_pde(va, PdeSlot::Super(spte.with(PteFlags::REFERENCED)));
                        Ok(())
                    }
                    FaultAccess::Store => {
                        if !spte.is_writeable() {
                            return Err(FaultError::ReadOnly);
                        }
                        guard.set_pde(
                            va,
                            PdeSlot::Super(spte.with(PteFlags::REFERENCED | PteFlags::MODIFIED)),
                        );
                        Ok(())
                    }
                }
            }
            PdeSlot::Table => {
                let ptp = match guard.ptps.get(&va.pt_index()) {
                    Some(ptp) => ptp,
                    None => return Err(FaultError::NotMapped),
                };
                let index = va.leaf_index();
                let pte = ptp.load(index);
                if !pte.is_valid() {
                    return Err(FaultError::NotMapped);
                }
                match access {
                    FaultAccess::Load => {
                        ptp.fetch_set(index, PteFlags::REFERENCED);
                        Ok(())
                    }
                    FaultAccess::Store => {
                        if !pte.is_writeable() {
                            return Err(FaultError::ReadOnly);
                        }
                        ptp.fetch_set(index, PteFlags::REFERENCED | PteFlags::MODIFIED);
                        Ok(())
                    }
                }
            }
        }
    }

    /// Rewrites the cache policy of an already-mapped kernel range. Fails
    /// with `NotMapped` before touching anything if any covered address
    /// lacks a translation; a demotion shortage midway leaves earlier slots
    /// updated and reports `ResourceShortage`.
    pub fn change_attr(&self, sva: VirtAddr, eva: VirtAddr, attr: MemAttr) -> Result<(), PmapError> {
        assert!(self.kernel, "change_attr is restricted to the kernel pmap");
        if !sva.is_page_aligned() || !eva.is_page_aligned() {
            return Err(PmapError::Unaligned);
        }
        let mut freeq = FreeQueue::new();
        let mut guard = self.inner.lock();

        // Pass 1: the whole range must be mapped.
        let mut cursor = sva.raw();
        let end = eva.raw();
        while cursor < end {
            let span_end = core::cmp::min(end, (cursor & !(SUPERPAGE_SIZE - 1)) + SUPERPAGE_SIZE);
            let va = va_at(cursor);
            match guard.pde(va) {
                PdeSlot::Empty => {
                    drop(guard);
                    freeq.drain(&*self.system.frames);
                    return Err(PmapError::NotMapped);
                }
                PdeSlot::Super(_) => {}
                PdeSlot::Table => {
                    let ptp = match guard.ptps.get(&va.pt_index()) {
                        Some(ptp) => ptp,
                        None => panic!("table marker without a leaf page"),
                    };
                    let mut probe = cursor;
                    while probe < span_end {
                        if !ptp.load(va_at(probe).leaf_index()).is_valid() {
                            drop(guard);
                            freeq.drain(&*self.system.frames);
                            return Err(PmapError::NotMapped);
                        }
                        probe += PAGE_SIZE;
                    }
                }
            }
            cursor = span_end;
        }

        // Pass 2: apply.
        let mut cursor = sva.raw();
        while cursor < end {
            let span_end = core::cmp::min(end, (cursor & !(SUPERPAGE_SIZE - 1)) + SUPERPAGE_SIZE);
            let va = va_at(cursor);
            match guard.pde(va) {
                PdeSlot::Empty => {}
                PdeSlot::Super(spte) => {
                    if va.is_superpage_aligned() && span_end - cursor == SUPERPAGE_SIZE {
                        guard.set_pde(va, PdeSlot::Super(spte.with_attr(attr)));
                    } else if self.demote_locked(&mut guard, va, &mut freeq) {
                        change_attr_leaves(&guard, cursor, span_end, attr);
                    } else {
                        drop(guard);
                        freeq.drain(&*self.system.frames);
                        return Err(PmapError::ResourceShortage);
                    }
                }
                PdeSlot::Table => change_attr_leaves(&guard, cursor, span_end, attr),
            }
            cursor = span_end;
        }
        self.system.tlb.range(self, sva, eva.raw());
        drop(guard);
        freeq.drain(&*self.system.frames);
        Ok(())
    }

    // ------------------------------------------------------------------
    // page-started helpers (remove_all, referenced/modified queries)
    // ------------------------------------------------------------------

    /// Demotes the superpage covering `va`, if one still exists.
    pub(crate) fn demote_at(&self, va: VirtAddr) {
        let mut freeq = FreeQueue::new();
        let mut guard = self.inner.lock();
        if let PdeSlot::Super(_) = guard.pde(va) {
            let _ = self.demote_locked(&mut guard, va, &mut freeq);
        }
        drop(guard);
        freeq.drain(&*self.system.frames);
    }

    /// Removes the base-page mapping at `va` if it still translates to
    /// `pfn`; re-validation step of the page-started teardown dance.
    pub(crate) fn remove_mapping_of(&self, pfn: Pfn, va: VirtAddr) -> bool {
        let mut freeq = FreeQueue::new();
        let mut guard = self.inner.lock();
        let current = match guard.pde(va) {
            PdeSlot::Table => guard
                .ptps
                .get(&va.pt_index())
                .map(|ptp| ptp.load(va.leaf_index())),
            _ => None,
        };
        let matches = current
            .map(|pte| pte.is_valid() && pte.pfn() == pfn)
            .unwrap_or(false);
        if !matches {
            drop(guard);
            freeq.drain(&*self.system.frames);
            return false;
        }
        if let Some(pte) = current {
            assert!(!pte.is_wired(), "remove_all hit a wired mapping");
        }
        if self.remove_leaf_locked(&mut guard, va, &mut freeq) {
            self.system.tlb.page(self, va);
            self.unlink_if_empty(&mut guard, va, &mut freeq);
        }
        drop(guard);
        freeq.drain(&*self.system.frames);
        true
    }

    /// Reads the flags of the mapping at `va` if it still maps `pfn`.
    pub(crate) fn read_flags_of(&self, pfn: Pfn, va: VirtAddr) -> Option<PteFlags> {
        let guard = self.inner.lock();
        match guard.pde(va) {
            PdeSlot::Super(spte) if spte.is_valid() && spte.pfn() == pfn.superpage_base() => {
                Some(spte.flags())
            }
            PdeSlot::Table => {
                let pte = guard.ptps.get(&va.pt_index())?.load(va.leaf_index());
                (pte.is_valid() && pte.pfn() == pfn).then(|| pte.flags())
            }
            _ => None,
        }
    }

    /// Clears `flags` on the mapping at `va` if it still maps `pfn`,
    /// invalidating when any bit was actually set. Returns the bits that
    /// were set.
    pub(crate) fn clear_flags_of(&self, pfn: Pfn, va: VirtAddr, flags: PteFlags) -> Option<PteFlags> {
        let mut guard = self.inner.lock();
        match guard.pde(va) {
            PdeSlot::Super(spte) if spte.is_valid() && spte.pfn() == pfn.superpage_base() => {
                let had = spte.flags() & flags;
                if !had.is_empty() {
                    guard.set_pde(va, PdeSlot::Super(spte.without(flags)));
                    self.system.tlb.range(self, va, va.raw() + SUPERPAGE_SIZE);
                }
                Some(had)
            }
            PdeSlot::Table => {
                let ptp = guard.ptps.get(&va.pt_index())?;
                let index = va.leaf_index();
                let pte = ptp.load(index);
                if !pte.is_valid() || pte.pfn() != pfn {
                    return None;
                }
                let prev = ptp.fetch_clear(index, flags);
                let had = prev.flags() & flags;
                if !had.is_empty() {
                    self.system.tlb.page(self, va);
                }
                Some(had)
            }
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // destruction support
    // ------------------------------------------------------------------

    /// Releases the root table page. The tree must already be empty.
    pub(crate) fn release(&self) -> Pfn {
        assert_eq!(
            self.resident_count(),
            0,
            "destroying a pmap with resident mappings"
        );
        let guard = self.inner.lock();
        assert!(guard.ptps.is_empty(), "resident count zero but leaf pages remain");
        assert!(guard.stash.is_empty(), "stashed table pages remain");
        assert_eq!(guard.pv.chunk_count(), 0, "PV chunks remain");
        debug_assert!(guard.seg.dirs().next().is_none(), "directory pages remain");
        guard.seg.frame()
    }

    #[cfg(test)]
    pub(crate) fn count_valid_leaves(&self) -> usize {
        let guard = self.inner.lock();
        let mut count = 0;
        for (_, ptp) in guard.ptps.iter() {
            for index in 0..crate::types::PT_ENTRIES {
                if ptp.load(index).is_valid() {
                    count += 1;
                }
            }
        }
        for dir in guard.seg.dirs() {
            for index in 0..crate::types::PT_ENTRIES {
                if let PdeSlot::Super(spte) = dir.slot(index) {
                    if spte.is_valid() {
                        count += SUPERPAGE_PAGES;
                    }
                }
            }
        }
        count
    }

    #[cfg(test)]
    pub(crate) fn table_wire_of(&self, va: VirtAddr) -> Option<u16> {
        let guard = self.inner.lock();
        guard.ptps.get(&va.pt_index()).map(|ptp| ptp.wire())
    }
}

fn change_attr_leaves(guard: &PmapInner, start: usize, end: usize, attr: MemAttr) {
    let ptp = match guard.ptps.get(&va_at(start).pt_index()) {
        Some(ptp) => ptp,
        None => return,
    };
    let mut cursor = start;
    while cursor < end {
        let index = va_at(cursor).leaf_index();
        loop {
            let old = ptp.load(index);
            if !old.is_valid() {
                break;
            }
            if ptp.compare_exchange(index, old, old.with_attr(attr)).is_ok() {
                break;
            }
        }
        cursor += PAGE_SIZE;
    }
}

/// Internal cursor-to-address conversion; cursors always stay canonical
/// because public ranges are bounded by canonical end addresses.
pub(crate) fn va_at(raw: usize) -> VirtAddr {
    match VirtAddr::new(raw) {
        Some(va) => va,
        None => panic!("internal cursor left the canonical range"),
    }
}
