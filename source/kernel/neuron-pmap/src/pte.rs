// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-table-entry codec: pure bit arithmetic over one packed word
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Pte, PteFlags, effective_attr
//! INVARIANTS: No side effects; inputs are always words this codec produced.
//! Referenced/modified are software bits (no hardware auto-set on this
//! design), so `enter` pre-sets referenced on every new valid entry.

use bitflags::bitflags;

use crate::types::{MemAttr, Pfn, PhysAddr, Protection, PAGE_SHIFT};

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Flag bits of a packed entry word.
    pub struct PteFlags: u64 {
        const VALID = 1 << 0;
        /// Software-emulated "accessed" bit.
        const REFERENCED = 1 << 1;
        /// Software-emulated "dirty" bit.
        const MODIFIED = 1 << 2;
        /// Write permission. A valid entry without it takes a
        /// [`FaultError::ReadOnly`](crate::pmap::FaultError) on store.
        const WRITE = 1 << 3;
        const NO_EXEC = 1 << 4;
        /// Excluded from reclamation; bookkeeping only, invisible to the TLB.
        const WIRED = 1 << 5;
        /// Backed by a tracked physical page (participates in the PV map).
        const MANAGED = 1 << 6;
        /// Kernel mapping, visible under every ASID.
        const GLOBAL = 1 << 7;
        /// The word encodes a superpage directory entry, not a leaf.
        const SUPERPAGE = 1 << 8;
    }
}

const CACHE_SHIFT: u32 = 9;
const CACHE_MASK: u64 = 0b11 << CACHE_SHIFT;
const PFN_SHIFT: u32 = PAGE_SHIFT as u32;

const fn cache_bits(attr: MemAttr) -> u64 {
    let raw = match attr {
        MemAttr::WriteBack => 0,
        MemAttr::WriteCombining => 1,
        MemAttr::Uncacheable => 2,
    };
    raw << CACHE_SHIFT
}

/// Resolves the cache policy actually installed for a frame: the requested
/// attribute, unless the physical range is not cacheable-safe.
pub fn effective_attr(requested: MemAttr, cacheable: bool) -> MemAttr {
    if cacheable {
        requested
    } else {
        MemAttr::Uncacheable
    }
}

/// One packed page-table entry word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Pte(u64);

impl Pte {
    pub const EMPTY: Self = Self(0);

    /// Builds a leaf entry. Callers add [`PteFlags::REFERENCED`],
    /// [`PteFlags::MODIFIED`], wiring and managed state through `extra`.
    pub fn new_leaf(pfn: Pfn, prot: Protection, attr: MemAttr, extra: PteFlags) -> Self {
        let mut flags = PteFlags::VALID | extra;
        if prot.contains(Protection::WRITE) {
            flags |= PteFlags::WRITE;
        }
        if !prot.contains(Protection::EXECUTE) {
            flags |= PteFlags::NO_EXEC;
        }
        Self(((pfn.raw() as u64) << PFN_SHIFT) | flags.bits() | cache_bits(attr))
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    #[inline]
    pub fn contains(self, flags: PteFlags) -> bool {
        self.flags().contains(flags)
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.contains(PteFlags::VALID)
    }

    #[inline]
    pub fn is_superpage(self) -> bool {
        self.contains(PteFlags::SUPERPAGE)
    }

    #[inline]
    pub fn is_wired(self) -> bool {
        self.contains(PteFlags::WIRED)
    }

    #[inline]
    pub fn is_managed(self) -> bool {
        self.contains(PteFlags::MANAGED)
    }

    #[inline]
    pub fn is_writeable(self) -> bool {
        self.contains(PteFlags::WRITE)
    }

    #[inline]
    pub fn is_referenced(self) -> bool {
        self.contains(PteFlags::REFERENCED)
    }

    #[inline]
    pub fn is_modified(self) -> bool {
        self.contains(PteFlags::MODIFIED)
    }

    #[inline]
    pub fn is_global(self) -> bool {
        self.contains(PteFlags::GLOBAL)
    }

    /// Frame mapped by this entry (superpages: the first constituent frame).
    #[inline]
    pub fn pfn(self) -> Pfn {
        Pfn::new((self.0 >> PFN_SHIFT) as usize)
    }

    /// Physical base address of the mapped frame.
    #[inline]
    pub fn pa(self) -> PhysAddr {
        self.pfn().addr()
    }

    pub fn attr(self) -> MemAttr {
        match (self.0 & CACHE_MASK) >> CACHE_SHIFT {
            0 => MemAttr::WriteBack,
            1 => MemAttr::WriteCombining,
            _ => MemAttr::Uncacheable,
        }
    }

    /// Permissions this entry grants.
    pub fn protection(self) -> Protection {
        let mut prot = Protection::READ;
        if self.is_writeable() {
            prot |= Protection::WRITE;
        }
        if !self.contains(PteFlags::NO_EXEC) {
            prot |= Protection::EXECUTE;
        }
        prot
    }

    #[must_use]
    pub fn with(self, flags: PteFlags) -> Self {
        Self(self.0 | flags.bits())
    }

    #[must_use]
    pub fn without(self, flags: PteFlags) -> Self {
        Self(self.0 & !flags.bits())
    }

    #[must_use]
    pub fn with_attr(self, attr: MemAttr) -> Self {
        Self((self.0 & !CACHE_MASK) | cache_bits(attr))
    }

    /// Rebuilds this word for a different frame, keeping flags and cache bits.
    #[must_use]
    pub fn with_pfn(self, pfn: Pfn) -> Self {
        Self((self.0 & ((1 << PFN_SHIFT) - 1)) | ((pfn.raw() as u64) << PFN_SHIFT))
    }

    /// Attribute bits that must be uniform across a promotion candidate run:
    /// everything except the frame number and the referenced bit carried by
    /// individual entry construction.
    pub(crate) fn promotion_attrs(self) -> u64 {
        self.0 & (((1u64 << PFN_SHIFT) - 1) & !PteFlags::REFERENCED.bits())
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pte")
            .field("pfn", &self.pfn())
            .field("flags", &self.flags())
            .field("attr", &self.attr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemAttr;

    #[test]
    fn leaf_roundtrip() {
        let pte = Pte::new_leaf(
            Pfn::new(0x1234),
            Protection::RW,
            MemAttr::WriteBack,
            PteFlags::REFERENCED | PteFlags::MANAGED,
        );
        assert!(pte.is_valid());
        assert!(pte.is_writeable());
        assert!(pte.is_referenced());
        assert!(pte.is_managed());
        assert!(!pte.is_modified());
        assert!(!pte.is_wired());
        assert_eq!(pte.pfn(), Pfn::new(0x1234));
        assert_eq!(pte.attr(), MemAttr::WriteBack);
        assert_eq!(pte.protection(), Protection::RW);
    }

    #[test]
    fn flag_edits_do_not_disturb_frame() {
        let pte = Pte::new_leaf(
            Pfn::new(0xabcd),
            Protection::READ,
            MemAttr::WriteCombining,
            PteFlags::empty(),
        );
        let edited = pte.with(PteFlags::MODIFIED).without(PteFlags::VALID);
        assert_eq!(edited.pfn(), Pfn::new(0xabcd));
        assert_eq!(edited.attr(), MemAttr::WriteCombining);
        assert!(edited.is_modified());
        assert!(!edited.is_valid());
    }

    #[test]
    fn uncacheable_override() {
        assert_eq!(
            effective_attr(MemAttr::WriteBack, false),
            MemAttr::Uncacheable
        );
        assert_eq!(effective_attr(MemAttr::WriteBack, true), MemAttr::WriteBack);
    }

    #[test]
    fn execute_is_encoded_inverted() {
        let x = Pte::new_leaf(
            Pfn::new(1),
            Protection::READ | Protection::EXECUTE,
            MemAttr::WriteBack,
            PteFlags::empty(),
        );
        assert!(!x.contains(PteFlags::NO_EXEC));
        let nx = Pte::new_leaf(Pfn::new(1), Protection::READ, MemAttr::WriteBack, PteFlags::empty());
        assert!(nx.contains(PteFlags::NO_EXEC));
        assert_eq!(nx.protection(), Protection::READ);
    }

    #[test]
    fn promotion_attrs_ignore_reference_and_frame() {
        let a = Pte::new_leaf(Pfn::new(10), Protection::RW, MemAttr::WriteBack, PteFlags::REFERENCED);
        let b = Pte::new_leaf(Pfn::new(11), Protection::RW, MemAttr::WriteBack, PteFlags::empty());
        assert_eq!(a.promotion_attrs(), b.promotion_attrs());
        let c = Pte::new_leaf(Pfn::new(12), Protection::READ, MemAttr::WriteBack, PteFlags::empty());
        assert_ne!(a.promotion_attrs(), c.promotion_attrs());
    }
}
