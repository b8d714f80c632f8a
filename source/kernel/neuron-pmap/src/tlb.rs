// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: TLB invalidation dispatch and ASID bookkeeping
//! OWNERS: @kernel-mm-team
//! PUBLIC API: TlbMaintenance, UniprocessorTlb, CrossCallTlb, IpiSender, TlbShootdown
//! INVARIANTS: the core never knows whether one or many processors exist;
//! kernel-pmap invalidations broadcast to every processor; the dispatcher
//! picks the cheapest correct operation, never a weaker one
//!
//! Platform variation lives behind [`TlbMaintenance`]: a trivial
//! uniprocessor implementation and a cross-call implementation share the
//! interface, so nothing in the mapping code is conditionally compiled.

extern crate alloc;

use alloc::sync::Arc;

use crate::pmap::Pmap;
use crate::types::{CpuId, CpuSet, VirtAddr, MAX_CPUS, PAGE_SIZE};

/// Hardware ASID tag. Zero is reserved for the kernel address space.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Asid(pub u16);

impl Asid {
    pub const KERNEL: Self = Self(0);
}

/// One invalidation request as shipped to remote processors. Ranges carry a
/// start address and a page count, so a range ending exactly at the top of
/// the canonical window stays representable.
#[derive(Clone, Copy, Debug)]
pub enum TlbShootdown {
    Page(VirtAddr),
    Range(VirtAddr, usize),
    All,
}

/// Cross-processor call transport used by [`CrossCallTlb`].
pub trait IpiSender: Send + Sync {
    /// Runs `op` against the TLB of every processor in `targets`,
    /// synchronously: the call returns only once all targets have acted.
    fn cross_call(&self, targets: CpuSet, op: TlbShootdown);
}

/// Invalidation of a pmap's TLB-visible state on its active processors.
pub trait TlbMaintenance: Send + Sync {
    fn invalidate_page(&self, pmap: &Pmap, va: VirtAddr);
    fn invalidate_range(&self, pmap: &Pmap, sva: VirtAddr, pages: usize);
    fn invalidate_all(&self, pmap: &Pmap);
}

/// Identity of the processor the caller is running on. Supplied by the
/// platform so invalidation policy can tell local from remote state.
pub trait CpuLocal: Send + Sync {
    fn current(&self) -> CpuId;
}

/// Uniprocessor identity source.
pub struct SingleCpu;

impl CpuLocal for SingleCpu {
    fn current(&self) -> CpuId {
        match CpuId::new(0) {
            Some(cpu) => cpu,
            None => unreachable!(),
        }
    }
}

/// Single-processor implementation: local ASID state is the only TLB state,
/// and the mapping code already orders PTE writes before lookups, so nothing
/// needs to happen here.
pub struct UniprocessorTlb;

impl TlbMaintenance for UniprocessorTlb {
    fn invalidate_page(&self, _pmap: &Pmap, _va: VirtAddr) {}
    fn invalidate_range(&self, _pmap: &Pmap, _sva: VirtAddr, _pages: usize) {}
    fn invalidate_all(&self, _pmap: &Pmap) {}
}

/// Cross-call implementation: ships the shootdown to the pmap's active set
/// (every processor for the kernel pmap).
pub struct CrossCallTlb<S: IpiSender> {
    ipi: S,
    cpus: usize,
}

impl<S: IpiSender> CrossCallTlb<S> {
    pub fn new(ipi: S, cpus: usize) -> Self {
        debug_assert!(cpus <= MAX_CPUS);
        Self { ipi, cpus }
    }

    fn targets(&self, pmap: &Pmap) -> CpuSet {
        if pmap.is_kernel() {
            CpuSet::all(self.cpus)
        } else {
            pmap.active_cpus()
        }
    }
}

impl<S: IpiSender> TlbMaintenance for CrossCallTlb<S> {
    fn invalidate_page(&self, pmap: &Pmap, va: VirtAddr) {
        let targets = self.targets(pmap);
        if !targets.is_empty() {
            self.ipi.cross_call(targets, TlbShootdown::Page(va));
        }
    }

    fn invalidate_range(&self, pmap: &Pmap, sva: VirtAddr, pages: usize) {
        let targets = self.targets(pmap);
        if !targets.is_empty() {
            self.ipi.cross_call(targets, TlbShootdown::Range(sva, pages));
        }
    }

    fn invalidate_all(&self, pmap: &Pmap) {
        let targets = self.targets(pmap);
        if !targets.is_empty() {
            self.ipi.cross_call(targets, TlbShootdown::All);
        }
    }
}

/// Past this many pages a range invalidation degrades to one full flush of
/// the address space; enumerating more entries costs more than refilling.
const FULL_FLUSH_THRESHOLD: usize = 1024;

/// Chooses the cheapest correct operation for each request.
pub(crate) struct TlbDispatcher {
    backend: Arc<dyn TlbMaintenance>,
}

impl TlbDispatcher {
    pub(crate) fn new(backend: Arc<dyn TlbMaintenance>) -> Self {
        Self { backend }
    }

    pub(crate) fn page(&self, pmap: &Pmap, va: VirtAddr) {
        self.backend.invalidate_page(pmap, va);
    }

    /// `eva` is the exclusive raw end cursor; it may equal the top of the
    /// canonical window.
    pub(crate) fn range(&self, pmap: &Pmap, sva: VirtAddr, eva: usize) {
        debug_assert!(sva.raw() <= eva);
        let pages = (eva - sva.raw()) / PAGE_SIZE;
        match pages {
            0 => {}
            1 => self.backend.invalidate_page(pmap, sva),
            n if n > FULL_FLUSH_THRESHOLD => self.backend.invalidate_all(pmap),
            n => self.backend.invalidate_range(pmap, sva, n),
        }
    }

    pub(crate) fn all(&self, pmap: &Pmap) {
        self.backend.invalidate_all(pmap);
    }
}

/// Per-processor ASID allocation with generation rollover: when a
/// processor's 16-bit space wraps, its generation bumps and every pmap's
/// stale tag becomes invalid without touching the pmaps themselves.
pub(crate) struct AsidAllocator {
    next: [u16; MAX_CPUS],
    generation: [u64; MAX_CPUS],
}

impl AsidAllocator {
    pub(crate) fn new() -> Self {
        // ASID 0 stays reserved for the kernel on every processor.
        Self { next: [1; MAX_CPUS], generation: [1; MAX_CPUS] }
    }

    pub(crate) fn allocate(&mut self, cpu: CpuId) -> (Asid, u64) {
        let index = cpu.raw();
        let asid = self.next[index];
        if asid == u16::MAX {
            self.next[index] = 1;
            self.generation[index] += 1;
        } else {
            self.next[index] = asid + 1;
        }
        (Asid(asid), self.generation[index])
    }

    pub(crate) fn generation(&self, cpu: CpuId) -> u64 {
        self.generation[cpu.raw()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asid_generation_rolls_over() {
        let mut asids = AsidAllocator::new();
        let cpu = CpuId::new(0).expect("cpu");
        let (first, gen1) = asids.allocate(cpu);
        assert_eq!(first, Asid(1));
        assert_eq!(gen1, 1);
        for _ in 0..(u16::MAX as usize - 1) {
            asids.allocate(cpu);
        }
        let (wrapped, gen2) = asids.allocate(cpu);
        assert_eq!(wrapped, Asid(1));
        assert_eq!(gen2, 2);
    }

    #[test]
    fn kernel_asid_reserved() {
        let mut asids = AsidAllocator::new();
        let cpu = CpuId::new(3).expect("cpu");
        for _ in 0..200 {
            let (asid, _) = asids.allocate(cpu);
            assert_ne!(asid, Asid::KERNEL);
        }
    }
}
