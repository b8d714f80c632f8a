// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical-map (pmap) engine: per-address-space page-table trees,
//! physical-page reverse mapping, superpage promotion/demotion, TLB shootdown
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! PUBLIC API: PmapSystem, Pmap, Protection, MemAttr, FrameAllocator, TlbMaintenance
//! DEPENDS_ON: bitflags, spin, log
//! INVARIANTS: valid managed PTE <=> exactly one PV entry on the owning page's
//! list; resident_count equals the number of valid leaf mappings; table pages
//! are released only after the TLB traffic that could still reference them
//!
//! The crate is a library surface consumed by a VM-object/fault layer. It owns
//! no physical memory itself: frames come from a [`FrameAllocator`] and TLB
//! maintenance goes through a [`TlbMaintenance`] implementation, so the core
//! never needs to know whether it runs on one processor or many.

#![no_std]
#![forbid(clippy::unwrap_used)]

extern crate alloc;

pub mod frames;
pub mod phys;
pub mod pmap;
pub mod pte;
pub mod ptpage;
pub mod pv;
pub mod superpage;
pub mod system;
pub mod tlb;
pub mod types;

pub use frames::{AllocPolicy, FrameAllocator, FrameShortage};
pub use pmap::{EnterFlags, FaultAccess, FaultError, Pmap, PmapError, PtpHint};
pub use pte::{Pte, PteFlags};
pub use superpage::SuperpageStatsSnapshot;
pub use system::{PmapHandle, PmapSystem, SystemConfig};
pub use tlb::{Asid, CpuLocal, CrossCallTlb, IpiSender, SingleCpu, TlbMaintenance, TlbShootdown, UniprocessorTlb};
pub use types::{CpuId, CpuSet, MemAttr, Pfn, PhysAddr, Protection, VirtAddr};
pub use types::{PAGE_SIZE, PT_ENTRIES, SUPERPAGE_PAGES, SUPERPAGE_SIZE};

#[cfg(test)]
mod test_support;
#[cfg(test)]
mod tests_prop;
