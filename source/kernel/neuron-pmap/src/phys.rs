// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Managed-page registry and the physical-to-virtual reverse map
//! OWNERS: @kernel-mm-team
//! PUBLIC API (crate): ManagedPages, PageAttrs, PvRef
//! INVARIANTS: a valid managed PTE has exactly one PvRef on the owning
//! page's (or superpage's) list and vice versa; shard locks are taken after
//! the pmap lock, never before it
//!
//! Reverse-map state is guarded by a fixed pool of reader/writer locks
//! selected by hashing the frame number, so per-page lock overhead stays
//! bounded. `shard_for` is the capability through which all access flows;
//! the sharding policy is private to this module.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::RwLock;

use crate::pv::PvHandle;
use crate::system::PmapHandle;
use crate::types::{MemAttr, Pfn, VirtAddr};

/// Number of reverse-map locks; frames hash into this pool.
pub(crate) const PV_SHARD_COUNT: usize = 64;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    /// Referenced/modified state saved on the page when mappings go away.
    pub(crate) struct PageAttrs: u8 {
        const REFERENCED = 1 << 0;
        const MODIFIED = 1 << 1;
    }
}

/// Backlink from a physical page to one mapping of it. The entry body (the
/// chunk slot) lives in the owning pmap; `va` is duplicated here so list
/// scans need no pmap lock.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct PvRef {
    pub pmap: PmapHandle,
    pub va: VirtAddr,
    pub slot: PvHandle,
}

/// Reverse-map state of one managed base page.
pub(crate) struct PageMeta {
    pub pv: Vec<PvRef>,
    pub saved: PageAttrs,
    pub attr: MemAttr,
}

/// Reverse-map state of a superpage-sized run, keyed by its first frame.
#[derive(Default)]
pub(crate) struct SuperMeta {
    pub pv: Vec<PvRef>,
}

pub(crate) struct Shard {
    pub pages: BTreeMap<Pfn, PageMeta>,
    pub supers: BTreeMap<Pfn, SuperMeta>,
}

/// The registry of managed physical pages and their PV lists.
pub(crate) struct ManagedPages {
    shards: Vec<RwLock<Shard>>,
}

impl ManagedPages {
    pub(crate) fn new() -> Self {
        let mut shards = Vec::with_capacity(PV_SHARD_COUNT);
        for _ in 0..PV_SHARD_COUNT {
            shards.push(RwLock::new(Shard { pages: BTreeMap::new(), supers: BTreeMap::new() }));
        }
        Self { shards }
    }

    /// The lock guarding `pfn`'s reverse-map state.
    pub(crate) fn shard_for(&self, pfn: Pfn) -> &RwLock<Shard> {
        &self.shards[pfn.raw() % PV_SHARD_COUNT]
    }

    /// The lock guarding the superpage record whose first frame is `base`.
    /// Superpage records hash by their base frame.
    pub(crate) fn super_shard_for(&self, base: Pfn) -> &RwLock<Shard> {
        self.shard_for(base)
    }

    /// Declares `count` frames starting at `start` as managed, with the
    /// given default memory attribute.
    pub(crate) fn register(&self, start: Pfn, count: usize, attr: MemAttr) {
        for i in 0..count {
            let pfn = match start.checked_add(i) {
                Some(pfn) => pfn,
                None => break,
            };
            let mut shard = self.shard_for(pfn).write();
            shard.pages.entry(pfn).or_insert(PageMeta {
                pv: Vec::new(),
                saved: PageAttrs::empty(),
                attr,
            });
        }
    }

    pub(crate) fn is_managed(&self, pfn: Pfn) -> bool {
        self.shard_for(pfn).read().pages.contains_key(&pfn)
    }

    /// Default memory attribute for a managed frame, if it is managed.
    pub(crate) fn attr_of(&self, pfn: Pfn) -> Option<MemAttr> {
        self.shard_for(pfn).read().pages.get(&pfn).map(|m| m.attr)
    }

    #[cfg(test)]
    pub(crate) fn pv_count(&self, pfn: Pfn) -> usize {
        self.shard_for(pfn)
            .read()
            .pages
            .get(&pfn)
            .map(|m| m.pv.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn super_pv_count(&self, base: Pfn) -> usize {
        self.super_shard_for(base)
            .read()
            .supers
            .get(&base)
            .map(|m| m.pv.len())
            .unwrap_or(0)
    }
}

impl Shard {
    /// Page record for a managed frame; panics on unmanaged frames, which
    /// callers must have filtered through the MANAGED PTE bit.
    pub(crate) fn page_mut(&mut self, pfn: Pfn) -> &mut PageMeta {
        match self.pages.get_mut(&pfn) {
            Some(meta) => meta,
            None => panic!("managed PTE for an untracked frame"),
        }
    }

    /// Slot backing the PvRef matching (`pmap`, `va`) on `pfn`'s list,
    /// without removing it.
    pub(crate) fn pv_slot(&self, pfn: Pfn, pmap: PmapHandle, va: VirtAddr) -> PvHandle {
        let meta = match self.pages.get(&pfn) {
            Some(meta) => meta,
            None => panic!("managed PTE for an untracked frame"),
        };
        match meta.pv.iter().find(|r| r.pmap == pmap && r.va == va) {
            Some(entry) => entry.slot,
            None => panic!("PV entry missing for a valid managed mapping"),
        }
    }

    pub(crate) fn super_pv_slot(&self, base: Pfn, pmap: PmapHandle, va: VirtAddr) -> PvHandle {
        let meta = match self.supers.get(&base) {
            Some(meta) => meta,
            None => panic!("superpage PV record missing"),
        };
        match meta.pv.iter().find(|r| r.pmap == pmap && r.va == va) {
            Some(entry) => entry.slot,
            None => panic!("superpage PV entry missing"),
        }
    }

    /// Removes the PvRef matching (`pmap`, `va`) from `pfn`'s list.
    pub(crate) fn remove_pv(&mut self, pfn: Pfn, pmap: PmapHandle, va: VirtAddr) -> PvRef {
        let meta = self.page_mut(pfn);
        let pos = meta.pv.iter().position(|r| r.pmap == pmap && r.va == va);
        match pos {
            Some(pos) => meta.pv.swap_remove(pos),
            None => panic!("PV entry missing for a valid managed mapping"),
        }
    }

    pub(crate) fn super_remove_pv(&mut self, base: Pfn, pmap: PmapHandle, va: VirtAddr) -> PvRef {
        let meta = match self.supers.get_mut(&base) {
            Some(meta) => meta,
            None => panic!("superpage PV record missing"),
        };
        let pos = meta.pv.iter().position(|r| r.pmap == pmap && r.va == va);
        let entry = match pos {
            Some(pos) => meta.pv.swap_remove(pos),
            None => panic!("superpage PV entry missing"),
        };
        if meta.pv.is_empty() {
            self.supers.remove(&base);
        }
        entry
    }
}
