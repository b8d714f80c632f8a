// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Superpage promotion and demotion over the page-table tree
//! OWNERS: @kernel-mm-team
//! PUBLIC API: SuperpageStatsSnapshot; (crate) Pmap::try_promote_locked,
//! Pmap::demote_locked
//! INVARIANTS: promotion and demotion preserve resident and wired counts;
//! a promoted region's leaf page parks in the stash so the common demotion
//! never allocates; demotion secures all PV capacity before mutating, so it
//! either completes or destroys the mapping, never half-splits
//!
//! Promotion is opportunistic: it runs when an enter fills a leaf table page
//! and every entry turns out to map 512 physically contiguous, identically
//! configured frames. Demotion is the mandatory inverse whenever any
//! operation needs base-page granularity inside a promoted region.

extern crate alloc;

use core::sync::atomic::{AtomicU64, Ordering};

use crate::frames::{alloc_frame, AllocPolicy};
use crate::phys::PvRef;
use crate::pmap::{va_at, Pmap, PmapInner};
use crate::pte::PteFlags;
use crate::ptpage::{FreeQueue, PageTablePage, PdeSlot};
use crate::types::{Pfn, VirtAddr, PAGE_SIZE, PT_ENTRIES, SUPERPAGE_PAGES, SUPERPAGE_SIZE};

/// Lifetime counters, shared by every pmap in the system.
#[derive(Default)]
pub(crate) struct SuperpageStats {
    promotions: AtomicU64,
    demotions: AtomicU64,
    promotion_failures: AtomicU64,
}

impl SuperpageStats {
    pub(crate) fn snapshot(&self) -> SuperpageStatsSnapshot {
        SuperpageStatsSnapshot {
            promotions: self.promotions.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
            promotion_failures: self.promotion_failures.load(Ordering::Relaxed),
        }
    }

    fn count_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    fn count_demotion(&self) {
        self.demotions.fetch_add(1, Ordering::Relaxed);
    }

    fn count_failure(&self) {
        self.promotion_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the superpage counters.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SuperpageStatsSnapshot {
    pub promotions: u64,
    pub demotions: u64,
    pub promotion_failures: u64,
}

impl Pmap {
    /// Attempts to replace the full leaf table page covering `va` with one
    /// superpage mapping. Inspection only until every entry qualifies, so a
    /// failed attempt changes nothing but the failure counter.
    pub(crate) fn try_promote_locked(
        &self,
        inner: &mut PmapInner,
        va: VirtAddr,
        freeq: &mut FreeQueue,
    ) -> bool {
        let base_va = va.superpage_base();
        let pt_index = base_va.pt_index();
        let stats = &self.system.sp_stats;

        let first = {
            let ptp = match inner.ptps.get(&pt_index) {
                Some(ptp) if ptp.is_full() => ptp,
                _ => return false,
            };
            let first = ptp.load(0);
            if !first.is_valid()
                || !first.is_managed()
                || !first.is_referenced()
                || !first.pfn().is_superpage_aligned()
            {
                stats.count_failure();
                return false;
            }
            let attrs = first.promotion_attrs();
            let base_pfn = first.pfn();
            for index in 1..PT_ENTRIES {
                let pte = ptp.load(index);
                if !pte.is_valid()
                    || pte.pfn() != Pfn::new(base_pfn.raw() + index)
                    || pte.promotion_attrs() != attrs
                    || !pte.is_referenced()
                {
                    stats.count_failure();
                    return false;
                }
            }
            first
        };
        let base_pfn = first.pfn();

        // Collapse the 512 per-page PV entries into one superpage entry.
        // The superpage entry is published before any per-page entry goes
        // away: a page-started scan snapshotting the lists in between sees
        // a transient duplicate and re-validates it away under the pmap
        // lock, whereas a transient gap would let remove_all return with
        // the frame still mapped. Page zero's slot is recycled as the
        // superpage slot; the rest free up, possibly dissolving chunks
        // whose frames then ride the free queue.
        let first_slot = {
            let shard = self.system.pages.shard_for(base_pfn).read();
            shard.pv_slot(base_pfn, self.handle(), base_va)
        };
        {
            let mut shard = self.system.pages.super_shard_for(base_pfn).write();
            shard.supers.entry(base_pfn).or_default().pv.push(PvRef {
                pmap: self.handle(),
                va: base_va,
                slot: first_slot,
            });
        }
        for index in 0..SUPERPAGE_PAGES {
            let pfn = Pfn::new(base_pfn.raw() + index);
            let page_va = va_at(base_va.raw() + index * PAGE_SIZE);
            let slot = {
                let mut shard = self.system.pages.shard_for(pfn).write();
                shard.remove_pv(pfn, self.handle(), page_va).slot
            };
            if index == 0 {
                debug_assert_eq!(slot, first_slot);
                continue;
            }
            if let Some(frame) = inner.pv.free(slot) {
                freeq.push_frame(frame);
            }
        }

        // Park the leaf page for the demotion that usually follows a
        // promotion, and swing the directory slot over.
        if let Some(ptp) = inner.ptps.remove(&pt_index) {
            inner.stash.insert(pt_index, ptp);
        }
        inner.set_pde(base_va, PdeSlot::Super(first.with(PteFlags::SUPERPAGE)));

        // The hardware may cache the old base-page translations under this
        // ASID anywhere in the region.
        self.system.tlb.all(self);
        stats.count_promotion();
        log::debug!("promoted {:?} to a superpage at {:?}", base_pfn, base_va);
        true
    }

    /// Splits the superpage covering `va` back into 512 base-page mappings.
    /// Returns false when resources ran out, in which case the mapping has
    /// been destroyed entirely rather than left half-split.
    pub(crate) fn demote_locked(
        &self,
        inner: &mut PmapInner,
        va: VirtAddr,
        freeq: &mut FreeQueue,
    ) -> bool {
        let base_va = va.superpage_base();
        let pt_index = base_va.pt_index();
        let spte = match inner.pde(base_va) {
            PdeSlot::Super(spte) => spte,
            _ => return true,
        };
        let managed = spte.is_managed();

        // Secure every resource first. The superpage keeps one PV slot that
        // becomes page zero's entry; the other 511 must exist before any
        // state changes.
        if managed {
            while inner.pv.free_capacity() < SUPERPAGE_PAGES - 1 {
                match alloc_frame(&*self.system.frames, AllocPolicy::NoWait) {
                    Ok(frame) => inner.pv.add_chunk(frame),
                    Err(_) => {
                        if let Some(frame) = self.system.reclaim_pv_chunk(self.handle()) {
                            inner.pv.add_chunk(frame);
                            continue;
                        }
                        log::warn!("demotion at {:?} out of PV entries, destroying", base_va);
                        self.remove_superpage_locked(inner, base_va, spte, freeq);
                        return false;
                    }
                }
            }
            inner.pv.reserve(SUPERPAGE_PAGES - 1);
        }
        let mut ptp = match inner.stash.remove(&pt_index) {
            Some(ptp) => ptp,
            None => match alloc_frame(&*self.system.frames, AllocPolicy::NoWait) {
                Ok(frame) => PageTablePage::new(frame),
                Err(_) => {
                    if managed {
                        inner.pv.unreserve(SUPERPAGE_PAGES - 1);
                    }
                    log::warn!("demotion at {:?} out of table pages, destroying", base_va);
                    self.remove_superpage_locked(inner, base_va, spte, freeq);
                    return false;
                }
            },
        };

        // Infallible from here: fill the leaf page and swing the slot.
        let base_pfn = spte.pfn();
        let body = spte.without(PteFlags::SUPERPAGE);
        for index in 0..PT_ENTRIES {
            ptp.store(index, body.with_pfn(Pfn::new(base_pfn.raw() + index)));
        }
        ptp.set_wire(PT_ENTRIES as u16);
        inner.ptps.insert(pt_index, ptp);
        inner.set_pde(base_va, PdeSlot::Table);

        if managed {
            // Mirror of promotion: the base-page entries are published
            // before the superpage entry goes away, so the lists never show
            // a gap for a still-mapped frame. The superpage slot becomes
            // page zero's entry.
            let first_slot = {
                let shard = self.system.pages.super_shard_for(base_pfn).read();
                shard.super_pv_slot(base_pfn, self.handle(), base_va)
            };
            {
                let mut shard = self.system.pages.shard_for(base_pfn).write();
                shard.page_mut(base_pfn).pv.push(PvRef {
                    pmap: self.handle(),
                    va: base_va,
                    slot: first_slot,
                });
            }
            for index in 1..SUPERPAGE_PAGES {
                let pfn = Pfn::new(base_pfn.raw() + index);
                let page_va = va_at(base_va.raw() + index * PAGE_SIZE);
                let slot = inner.pv.get_reserved(page_va);
                let mut shard = self.system.pages.shard_for(pfn).write();
                shard.page_mut(pfn).pv.push(PvRef {
                    pmap: self.handle(),
                    va: page_va,
                    slot,
                });
            }
            {
                let mut shard = self.system.pages.super_shard_for(base_pfn).write();
                let evicted = shard.super_remove_pv(base_pfn, self.handle(), base_va);
                debug_assert_eq!(evicted.slot, first_slot);
            }
        }

        self.system.tlb.range(self, base_va, base_va.raw() + SUPERPAGE_SIZE);
        self.system.sp_stats.count_demotion();
        log::debug!("demoted superpage at {:?}", base_va);
        true
    }
}
