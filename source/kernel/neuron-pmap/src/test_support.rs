// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures: a counting frame allocator and a recording TLB backend.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::frames::{AllocPolicy, FrameAllocator, FrameShortage};
use crate::pmap::Pmap;
use crate::system::{PmapSystem, SystemConfig};
use crate::tlb::{SingleCpu, TlbMaintenance};
use crate::types::{Pfn, VirtAddr, PAGE_SIZE};

/// Frames handed to the core start here, far from the frame numbers tests
/// use for mapped pages, so a mix-up shows up as a wild number.
const FIRST_TEST_FRAME: usize = 1 << 20;

struct TestFramesInner {
    next: usize,
    free: Vec<Pfn>,
    outstanding: usize,
    limit: usize,
}

/// Infallible-by-default allocator with an optional outstanding-frame limit
/// for shortage scenarios. `WaitOk` cannot block in tests, so past the limit
/// both policies fail.
pub(crate) struct TestFrames {
    inner: Mutex<TestFramesInner>,
}

impl TestFrames {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_limit(usize::MAX)
    }

    pub(crate) fn with_limit(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TestFramesInner {
                next: FIRST_TEST_FRAME,
                free: Vec::new(),
                outstanding: 0,
                limit,
            }),
        })
    }

    /// Frames currently held by the core; zero once everything is torn down.
    pub(crate) fn outstanding(&self) -> usize {
        self.inner.lock().outstanding
    }

    pub(crate) fn set_limit(&self, limit: usize) {
        self.inner.lock().limit = limit;
    }
}

impl FrameAllocator for TestFrames {
    fn alloc(&self, _policy: AllocPolicy) -> Result<Pfn, FrameShortage> {
        let mut inner = self.inner.lock();
        if inner.outstanding >= inner.limit {
            return Err(FrameShortage);
        }
        inner.outstanding += 1;
        let pfn = match inner.free.pop() {
            Some(pfn) => pfn,
            None => {
                let pfn = Pfn::new(inner.next);
                inner.next += 1;
                pfn
            }
        };
        Ok(pfn)
    }

    fn free(&self, pfn: Pfn) {
        let mut inner = self.inner.lock();
        assert!(!inner.free.contains(&pfn), "double free of {pfn:?}");
        assert!(inner.outstanding > 0, "free without a matching alloc");
        inner.outstanding -= 1;
        inner.free.push(pfn);
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum TlbEvent {
    Page(VirtAddr),
    Range(VirtAddr, usize),
    All,
}

/// TLB backend that records every maintenance request in order.
#[derive(Default)]
pub(crate) struct RecordingTlb {
    events: Mutex<Vec<TlbEvent>>,
}

impl RecordingTlb {
    pub(crate) fn take(&self) -> Vec<TlbEvent> {
        core::mem::take(&mut *self.events.lock())
    }

    pub(crate) fn clear(&self) {
        self.events.lock().clear();
    }
}

impl TlbMaintenance for RecordingTlb {
    fn invalidate_page(&self, _pmap: &Pmap, va: VirtAddr) {
        self.events.lock().push(TlbEvent::Page(va));
    }

    fn invalidate_range(&self, _pmap: &Pmap, sva: VirtAddr, pages: usize) {
        self.events.lock().push(TlbEvent::Range(sva, pages));
    }

    fn invalidate_all(&self, _pmap: &Pmap) {
        self.events.lock().push(TlbEvent::All);
    }
}

pub(crate) struct Fixture {
    pub frames: Arc<TestFrames>,
    pub tlb: Arc<RecordingTlb>,
    pub system: Arc<PmapSystem>,
}

pub(crate) fn fixture() -> Fixture {
    fixture_with(TestFrames::new(), true)
}

pub(crate) fn fixture_with(frames: Arc<TestFrames>, superpages: bool) -> Fixture {
    let tlb = Arc::new(RecordingTlb::default());
    let system = PmapSystem::new(SystemConfig {
        frames: frames.clone(),
        tlb: tlb.clone(),
        cpu: Arc::new(SingleCpu),
        cpus: 1,
        superpages,
    });
    Fixture { frames, tlb, system }
}

/// Page-aligned canonical address `n` pages up.
pub(crate) fn va(n: usize) -> VirtAddr {
    match VirtAddr::page_aligned(n * PAGE_SIZE) {
        Some(va) => va,
        None => panic!("test address out of range"),
    }
}
