// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: System-wide pmap registry, kernel pmap, and page-started operations
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! PUBLIC API: PmapSystem, PmapHandle, SystemConfig
//! DEPENDS_ON: pmap, phys, tlb, frames
//! INVARIANTS: the kernel pmap exists for the lifetime of the system and is
//! never destroyed; a PV entry always names a live registered pmap; page
//! queries never report a bit that was not actually set
//!
//! Operations that start from a physical page (remove_all, the referenced
//! and modified queries) cannot take the owning pmap's lock first without
//! inverting the lock order. They snapshot the PV list under the shard lock,
//! drop it, lock the pmap, and re-validate each mapping before acting; a
//! mapping that changed in the window is simply skipped.

extern crate alloc;

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::num::NonZeroU32;

use spin::{Mutex, Once};

use crate::frames::{alloc_frame, AllocPolicy, FrameAllocator};
use crate::phys::{ManagedPages, PageAttrs, PvRef};
use crate::pmap::{Pmap, PmapError};
use crate::pte::PteFlags;
use crate::ptpage::{FreeQueue, PdeSlot};
use crate::superpage::{SuperpageStats, SuperpageStatsSnapshot};
use crate::tlb::{AsidAllocator, CpuLocal, TlbDispatcher, TlbMaintenance};
use crate::types::{CpuId, MemAttr, Pfn};

/// Registry identity of one pmap; index plus one, so the niche keeps
/// `Option<PmapHandle>` word-sized.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PmapHandle(NonZeroU32);

impl PmapHandle {
    fn from_index(index: usize) -> Self {
        match NonZeroU32::new(index as u32 + 1) {
            Some(raw) => Self(raw),
            None => panic!("pmap registry index overflow"),
        }
    }

    pub(crate) fn index(self) -> usize {
        self.0.get() as usize - 1
    }
}

/// Platform plumbing handed to [`PmapSystem::new`].
pub struct SystemConfig {
    pub frames: Arc<dyn FrameAllocator>,
    pub tlb: Arc<dyn TlbMaintenance>,
    pub cpu: Arc<dyn CpuLocal>,
    /// Number of processors; bounds broadcast invalidations.
    pub cpus: usize,
    /// Gates opportunistic superpage promotion (demotion always works).
    pub superpages: bool,
}

/// The pmap subsystem: registry, managed-page state and shared services.
pub struct PmapSystem {
    pub(crate) frames: Arc<dyn FrameAllocator>,
    pub(crate) tlb: TlbDispatcher,
    pub(crate) pages: ManagedPages,
    pub(crate) asids: Mutex<AsidAllocator>,
    pub(crate) sp_stats: SuperpageStats,
    pub(crate) superpages_enabled: bool,
    cpu: Arc<dyn CpuLocal>,
    cpus: usize,
    registry: Mutex<Vec<Option<Weak<Pmap>>>>,
    /// Strong reference keeping the kernel pmap immortal.
    kernel: Once<Arc<Pmap>>,
}

impl PmapSystem {
    /// Boots the subsystem and the kernel pmap. Failure to allocate the
    /// kernel root table at boot is fatal.
    pub fn new(config: SystemConfig) -> Arc<Self> {
        let system = Arc::new(Self {
            frames: config.frames,
            tlb: TlbDispatcher::new(config.tlb),
            pages: ManagedPages::new(),
            asids: Mutex::new(AsidAllocator::new()),
            sp_stats: SuperpageStats::default(),
            superpages_enabled: config.superpages,
            cpu: config.cpu,
            cpus: config.cpus,
            registry: Mutex::new(Vec::new()),
            kernel: Once::new(),
        });
        let root = match alloc_frame(&*system.frames, AllocPolicy::WaitOk) {
            Ok(root) => root,
            Err(_) => panic!("no frame for the kernel root table at boot"),
        };
        let kernel = Arc::new(Pmap::new(
            Arc::clone(&system),
            PmapHandle::from_index(0),
            true,
            root,
            config.cpus,
        ));
        system.registry.lock().push(Some(Arc::downgrade(&kernel)));
        system.kernel.call_once(|| kernel);
        log::info!("pmap system up, {} cpus", system.cpus);
        system
    }

    /// The kernel address space, active on every processor under ASID 0.
    pub fn kernel_pmap(&self) -> &Arc<Pmap> {
        match self.kernel.get() {
            Some(kernel) => kernel,
            None => panic!("kernel pmap queried before boot completed"),
        }
    }

    /// Creates an empty user address space. Blocks for the root table.
    pub fn create_pmap(self: &Arc<Self>) -> Result<Arc<Pmap>, PmapError> {
        let root = alloc_frame(&*self.frames, AllocPolicy::WaitOk)
            .map_err(|_| PmapError::ResourceShortage)?;
        let mut registry = self.registry.lock();
        let index = registry
            .iter()
            .position(|slot| slot.is_none())
            .unwrap_or(registry.len());
        let handle = PmapHandle::from_index(index);
        let pmap = Arc::new(Pmap::new(Arc::clone(self), handle, false, root, self.cpus));
        let weak = Some(Arc::downgrade(&pmap));
        if index == registry.len() {
            registry.push(weak);
        } else {
            registry[index] = weak;
        }
        drop(registry);
        log::trace!("created pmap {:?}", handle);
        Ok(pmap)
    }

    /// Retires an address space. The caller must have removed every mapping;
    /// a non-empty pmap here is a bug and fatal.
    pub fn destroy_pmap(&self, pmap: Arc<Pmap>) {
        assert!(!pmap.is_kernel(), "the kernel pmap is never destroyed");
        let root = pmap.release();
        self.registry.lock()[pmap.handle().index()] = None;
        self.frames.free(root);
        log::trace!("destroyed pmap {:?}", pmap.handle());
    }

    /// Declares a run of frames as managed, eligible for reverse mapping and
    /// referenced/modified tracking, with a default memory attribute.
    pub fn register_managed(&self, start: Pfn, count: usize, attr: MemAttr) {
        self.pages.register(start, count, attr);
    }

    pub fn superpage_stats(&self) -> SuperpageStatsSnapshot {
        self.sp_stats.snapshot()
    }

    pub(crate) fn current_cpu(&self) -> CpuId {
        self.cpu.current()
    }

    fn lookup(&self, handle: PmapHandle) -> Arc<Pmap> {
        let registry = self.registry.lock();
        let upgraded = registry
            .get(handle.index())
            .and_then(|slot| slot.as_ref())
            .and_then(Weak::upgrade);
        match upgraded {
            Some(pmap) => pmap,
            None => panic!("PV entry names a retired pmap"),
        }
    }

    // ------------------------------------------------------------------
    // page-started operations
    // ------------------------------------------------------------------

    /// Removes every mapping of the managed page `pfn`, in every address
    /// space. Superpage mappings covering it are demoted first. Hitting a
    /// wired mapping is a caller bug and fatal.
    pub fn remove_all(&self, pfn: Pfn) {
        let base = pfn.superpage_base();
        loop {
            let entry = {
                let shard = self.pages.super_shard_for(base).read();
                shard.supers.get(&base).and_then(|meta| meta.pv.first().copied())
            };
            let entry = match entry {
                Some(entry) => entry,
                None => break,
            };
            self.lookup(entry.pmap).demote_at(entry.va);
        }
        loop {
            let entry = {
                let shard = self.pages.shard_for(pfn).read();
                shard.pages.get(&pfn).and_then(|meta| meta.pv.first().copied())
            };
            let entry = match entry {
                Some(entry) => entry,
                None => break,
            };
            // Re-validated under the pmap lock; a mapping that changed in
            // the window has already dropped its PV entry.
            let _ = self.lookup(entry.pmap).remove_mapping_of(pfn, entry.va);
        }
    }

    /// Whether `pfn` has been written through any mapping, past or present.
    /// Never reports a modification that did not happen.
    pub fn page_is_modified(&self, pfn: Pfn) -> bool {
        self.page_test(pfn, PteFlags::MODIFIED, PageAttrs::MODIFIED)
    }

    /// Whether `pfn` has been accessed through any mapping, past or present.
    pub fn page_is_referenced(&self, pfn: Pfn) -> bool {
        self.page_test(pfn, PteFlags::REFERENCED, PageAttrs::REFERENCED)
    }

    fn page_test(&self, pfn: Pfn, flag: PteFlags, saved: PageAttrs) -> bool {
        let entries: Vec<PvRef> = {
            let shard = self.pages.shard_for(pfn).read();
            match shard.pages.get(&pfn) {
                Some(meta) => {
                    if meta.saved.contains(saved) {
                        return true;
                    }
                    meta.pv.clone()
                }
                None => return false,
            }
        };
        for entry in entries {
            let set = self
                .lookup(entry.pmap)
                .read_flags_of(pfn, entry.va)
                .map(|flags| flags.contains(flag))
                .unwrap_or(false);
            if set {
                return true;
            }
        }
        for entry in self.super_entries(pfn) {
            let set = self
                .lookup(entry.pmap)
                .read_flags_of(pfn, entry.va)
                .map(|flags| flags.contains(flag))
                .unwrap_or(false);
            if set {
                return true;
            }
        }
        false
    }

    /// Counts and clears the referenced state of `pfn`. Bounded: once a few
    /// references have been found the page is clearly active, and visiting
    /// the rest of a long PV list buys nothing.
    pub fn page_ts_referenced(&self, pfn: Pfn) -> usize {
        const TS_LIMIT: usize = 4;
        let mut count = 0;
        let entries: Vec<PvRef> = {
            let mut shard = self.pages.shard_for(pfn).write();
            match shard.pages.get_mut(&pfn) {
                Some(meta) => {
                    if meta.saved.contains(PageAttrs::REFERENCED) {
                        meta.saved.remove(PageAttrs::REFERENCED);
                        count += 1;
                    }
                    meta.pv.clone()
                }
                None => return 0,
            }
        };
        for entry in entries {
            if count >= TS_LIMIT {
                return count;
            }
            if let Some(had) = self
                .lookup(entry.pmap)
                .clear_flags_of(pfn, entry.va, PteFlags::REFERENCED)
            {
                if had.contains(PteFlags::REFERENCED) {
                    count += 1;
                }
            }
        }
        for entry in self.super_entries(pfn) {
            if count >= TS_LIMIT {
                return count;
            }
            if let Some(had) = self
                .lookup(entry.pmap)
                .clear_flags_of(pfn, entry.va, PteFlags::REFERENCED)
            {
                if had.contains(PteFlags::REFERENCED) {
                    count += 1;
                }
            }
        }
        count
    }

    /// Clears the modified state of `pfn` everywhere. Superpage mappings are
    /// demoted first so only base-page entries carry the bit afterwards.
    pub fn page_clear_modify(&self, pfn: Pfn) {
        loop {
            let entry = match self.super_entries(pfn).first().copied() {
                Some(entry) => entry,
                None => break,
            };
            self.lookup(entry.pmap).demote_at(entry.va);
        }
        let entries: Vec<PvRef> = {
            let mut shard = self.pages.shard_for(pfn).write();
            match shard.pages.get_mut(&pfn) {
                Some(meta) => {
                    meta.saved.remove(PageAttrs::MODIFIED);
                    meta.pv.clone()
                }
                None => return,
            }
        };
        for entry in entries {
            let _ = self
                .lookup(entry.pmap)
                .clear_flags_of(pfn, entry.va, PteFlags::MODIFIED);
        }
    }

    fn super_entries(&self, pfn: Pfn) -> Vec<PvRef> {
        let base = pfn.superpage_base();
        let shard = self.pages.super_shard_for(base).read();
        shard
            .supers
            .get(&base)
            .map(|meta| meta.pv.clone())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // PV reclamation
    // ------------------------------------------------------------------

    /// Last resort under memory pressure: finds a victim pmap whose lock is
    /// free, tears down one chunk's worth of unwired base-page mappings, and
    /// returns a frame. Victims are visited in registry order; `skip` (the
    /// caller, whose lock is or may be held) is never a victim.
    pub(crate) fn reclaim_pv_chunk(&self, skip: PmapHandle) -> Option<Pfn> {
        let candidates: Vec<Arc<Pmap>> = {
            let registry = self.registry.lock();
            registry
                .iter()
                .filter_map(|slot| slot.as_ref())
                .filter_map(Weak::upgrade)
                .filter(|pmap| pmap.handle() != skip)
                .collect()
        };
        for pmap in candidates {
            let mut guard = match pmap.inner.try_lock() {
                Some(guard) => guard,
                None => continue,
            };
            let mut freeq = FreeQueue::new();
            let mut tore_down = false;
            let mut reclaimed = None;
            let indexes: Vec<u32> = guard.pv.chunk_indexes().collect();
            'chunks: for chunk_index in indexes {
                let entries = guard.pv.chunk_entries(chunk_index);
                if entries.is_empty() {
                    continue;
                }
                // Chunks backing wired mappings or superpage entries are
                // off limits.
                for (_, va) in &entries {
                    match guard.pde(*va) {
                        PdeSlot::Table => {
                            let wired = guard
                                .ptps
                                .get(&va.pt_index())
                                .map(|ptp| ptp.load(va.leaf_index()).is_wired())
                                .unwrap_or(false);
                            if wired {
                                continue 'chunks;
                            }
                        }
                        _ => continue 'chunks,
                    }
                }
                for (_, va) in entries {
                    if pmap.remove_leaf_locked(&mut guard, va, &mut freeq) {
                        self.tlb.page(&pmap, va);
                        pmap.unlink_if_empty(&mut guard, va, &mut freeq);
                    }
                }
                reclaimed = guard.pv.take_chunk_if_unused(chunk_index);
                tore_down = true;
                break 'chunks;
            }
            drop(guard);
            freeq.drain(&*self.frames);
            if tore_down {
                log::debug!("reclaimed a PV chunk from {:?}", pmap.handle());
                if reclaimed.is_some() {
                    return reclaimed;
                }
                // The chunk dissolved into the free queue above; pull the
                // memory back out of the allocator.
                return alloc_frame(&*self.frames, AllocPolicy::NoWait).ok();
            }
        }
        None
    }
}
