// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boundary to the external physical-page allocator
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameAllocator, AllocPolicy, FrameShortage
//! INVARIANTS: `WaitOk` calls are made with no pmap lock held; `NoWait`
//! never blocks and is the only policy used on fault-time paths

use crate::types::Pfn;

/// Whether an allocation may wait for the reclamation machinery.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocPolicy {
    /// May block until a frame becomes available.
    WaitOk,
    /// Must return immediately; shortage is surfaced to the caller.
    NoWait,
}

/// No frame could be provided under the requested policy.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FrameShortage;

/// Source of physical frames for table pages and PV chunks.
///
/// Allocation policy (buddy/slab, reclamation, watermarks) lives behind this
/// trait; the pmap core only distinguishes blocking from non-blocking
/// requests. Returned frames are assumed zero-filled.
pub trait FrameAllocator: Send + Sync {
    /// Provides one frame. A `WaitOk` request may block for reclamation;
    /// whether running dry after that is fatal is the allocator's decision
    /// to make. An allocator that returns [`FrameShortage`] instead gets it
    /// surfaced to the mapping caller as a retryable error.
    fn alloc(&self, policy: AllocPolicy) -> Result<Pfn, FrameShortage>;

    fn free(&self, pfn: Pfn);

    /// Whether the frame lies in a normal, cacheable-safe region. Mappings of
    /// frames outside such regions are forced uncacheable.
    fn is_cacheable(&self, _pfn: Pfn) -> bool {
        true
    }
}

#[cfg(feature = "failpoints")]
pub mod failpoints {
    //! Deterministic denial of the next frame request, for shortage tests.

    use core::sync::atomic::{AtomicBool, Ordering};

    static DENY_NEXT_FRAME: AtomicBool = AtomicBool::new(false);

    /// Forces the next allocation routed through the pmap core to fail.
    pub fn deny_next_frame() {
        DENY_NEXT_FRAME.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_denial() -> bool {
        DENY_NEXT_FRAME.swap(false, Ordering::SeqCst)
    }
}

/// All core allocations funnel through here so failpoints see them.
pub(crate) fn alloc_frame(
    frames: &dyn FrameAllocator,
    policy: AllocPolicy,
) -> Result<Pfn, FrameShortage> {
    #[cfg(feature = "failpoints")]
    if failpoints::take_denial() {
        return Err(FrameShortage);
    }
    frames.alloc(policy)
}
