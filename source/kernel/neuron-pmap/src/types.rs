// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address newtypes, protection flags, and the 9-9-9-12 layout
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VirtAddr, PhysAddr, Pfn, Protection, MemAttr, CpuId, CpuSet
//! INVARIANTS: VirtAddr is always canonical (below `VA_LIMIT`); index helpers
//! assume that and never mask beyond the canonical range

use core::fmt;

use bitflags::bitflags;
use static_assertions::const_assert_eq;

/// Base-page shift (4 KiB pages).
pub const PAGE_SHIFT: usize = 12;
/// Size of a base page in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Index bits consumed per translation level.
pub const PT_INDEX_BITS: usize = 9;
/// Entries per table page (all three levels).
pub const PT_ENTRIES: usize = 1 << PT_INDEX_BITS;
/// Base pages folded into one superpage.
pub const SUPERPAGE_PAGES: usize = PT_ENTRIES;
/// Superpage shift (2 MiB superpages).
pub const SUPERPAGE_SHIFT: usize = PAGE_SHIFT + PT_INDEX_BITS;
/// Size of a superpage in bytes.
pub const SUPERPAGE_SIZE: usize = 1 << SUPERPAGE_SHIFT;
/// Virtual-address bits covered by the three-level tree.
pub const VA_BITS: usize = PAGE_SHIFT + 3 * PT_INDEX_BITS;
/// First address outside the canonical range.
pub const VA_LIMIT: usize = 1 << VA_BITS;
/// Upper bound on processors tracked per address space.
pub const MAX_CPUS: usize = 64;

const_assert_eq!(SUPERPAGE_SIZE, PAGE_SIZE * SUPERPAGE_PAGES);
const_assert_eq!(VA_BITS, 39);

/// Canonical virtual address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// Wraps `raw` if it falls inside the canonical range.
    pub fn new(raw: usize) -> Option<Self> {
        if raw < VA_LIMIT {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// Wraps `raw` if it is canonical and page aligned.
    pub fn page_aligned(raw: usize) -> Option<Self> {
        Self::new(raw).filter(|va| va.is_page_aligned())
    }

    /// Returns the raw address.
    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    #[inline]
    pub const fn is_superpage_aligned(self) -> bool {
        self.0 % SUPERPAGE_SIZE == 0
    }

    /// Rounds down to the containing page boundary.
    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// Rounds down to the containing superpage boundary.
    #[inline]
    pub const fn superpage_base(self) -> Self {
        Self(self.0 & !(SUPERPAGE_SIZE - 1))
    }

    /// Top-level (segment) table index.
    #[inline]
    pub const fn seg_index(self) -> usize {
        (self.0 >> (PAGE_SHIFT + 2 * PT_INDEX_BITS)) & (PT_ENTRIES - 1)
    }

    /// Mid-level (directory) index within the segment slot.
    #[inline]
    pub const fn dir_index(self) -> usize {
        (self.0 >> SUPERPAGE_SHIFT) & (PT_ENTRIES - 1)
    }

    /// Leaf index within the table page.
    #[inline]
    pub const fn leaf_index(self) -> usize {
        (self.0 >> PAGE_SHIFT) & (PT_ENTRIES - 1)
    }

    /// Linear directory index (`seg * 512 + dir`), the radix key for the
    /// table page covering this address.
    #[inline]
    pub const fn pt_index(self) -> usize {
        self.0 >> SUPERPAGE_SHIFT
    }

    #[inline]
    pub const fn offset_in_page(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    #[inline]
    pub const fn offset_in_superpage(self) -> usize {
        self.0 & (SUPERPAGE_SIZE - 1)
    }

    /// Advances by `pages` base pages, staying canonical.
    pub fn add_pages(self, pages: usize) -> Option<Self> {
        pages
            .checked_mul(PAGE_SIZE)
            .and_then(|b| self.0.checked_add(b))
            .and_then(Self::new)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

/// Physical byte address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Frame number of the containing page.
    #[inline]
    pub const fn pfn(self) -> Pfn {
        Pfn(self.0 >> PAGE_SHIFT)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

/// Physical frame number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pfn(usize);

impl Pfn {
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Byte address of the frame base.
    #[inline]
    pub const fn addr(self) -> PhysAddr {
        PhysAddr(self.0 << PAGE_SHIFT)
    }

    /// First frame of the superpage run containing this frame.
    #[inline]
    pub const fn superpage_base(self) -> Self {
        Self(self.0 & !(SUPERPAGE_PAGES - 1))
    }

    #[inline]
    pub const fn is_superpage_aligned(self) -> bool {
        self.0 % SUPERPAGE_PAGES == 0
    }

    pub fn checked_add(self, frames: usize) -> Option<Self> {
        self.0.checked_add(frames).map(Self)
    }
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pfn({:#x})", self.0)
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Access permissions requested for a mapping.
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl Protection {
    /// Read-write, the common data-page protection.
    pub const RW: Self = Self::READ.union(Self::WRITE);
}

/// Cache policy carried by a mapping.
///
/// Requests against physical ranges the frame allocator reports as not
/// cacheable-safe are forced to [`MemAttr::Uncacheable`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemAttr {
    WriteBack,
    WriteCombining,
    Uncacheable,
}

/// Processor identifier.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct CpuId(usize);

impl CpuId {
    /// Wraps `raw` if it is below [`MAX_CPUS`].
    pub fn new(raw: usize) -> Option<Self> {
        if raw < MAX_CPUS {
            Some(Self(raw))
        } else {
            None
        }
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub(crate) const fn bit(self) -> u64 {
        1 << self.0
    }
}

/// Set of processors, one bit per [`CpuId`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct CpuSet(u64);

impl CpuSet {
    pub const EMPTY: Self = Self(0);

    /// All processors up to `count`.
    pub fn all(count: usize) -> Self {
        debug_assert!(count <= MAX_CPUS);
        if count >= 64 {
            Self(u64::MAX)
        } else {
            Self((1u64 << count) - 1)
        }
    }

    pub(crate) const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, cpu: CpuId) -> bool {
        self.0 & cpu.bit() != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn without(self, cpu: CpuId) -> Self {
        Self(self.0 & !cpu.bit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_slices_are_disjoint() {
        let va = VirtAddr::new((3 << 30) | (5 << 21) | (7 << 12) | 0x123)
            .expect("canonical");
        assert_eq!(va.seg_index(), 3);
        assert_eq!(va.dir_index(), 5);
        assert_eq!(va.leaf_index(), 7);
        assert_eq!(va.pt_index(), 3 * PT_ENTRIES + 5);
        assert_eq!(va.offset_in_page(), 0x123);
    }

    #[test]
    fn rejects_non_canonical() {
        assert!(VirtAddr::new(VA_LIMIT).is_none());
        assert!(VirtAddr::new(VA_LIMIT - 1).is_some());
        assert!(VirtAddr::page_aligned(PAGE_SIZE + 1).is_none());
    }

    #[test]
    fn superpage_rounding() {
        let va = VirtAddr::new(SUPERPAGE_SIZE + 5 * PAGE_SIZE).expect("canonical");
        assert_eq!(va.superpage_base().raw(), SUPERPAGE_SIZE);
        assert!(!va.is_superpage_aligned());
        assert_eq!(Pfn::new(513).superpage_base(), Pfn::new(512));
    }

    #[test]
    fn cpu_sets() {
        let all = CpuSet::all(4);
        let cpu2 = CpuId::new(2).expect("cpu id");
        assert!(all.contains(cpu2));
        assert!(!all.without(cpu2).contains(cpu2));
        assert!(CpuSet::EMPTY.is_empty());
    }
}
