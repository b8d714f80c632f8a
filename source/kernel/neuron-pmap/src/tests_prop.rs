// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Property tests: random operation sequences against a reference model,
//! checking the accounting invariants the rest of the kernel relies on.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use proptest::prelude::*;

use crate::pmap::{EnterFlags, FaultAccess};
use crate::pv::{PvChunkList, PV_PER_CHUNK};
use crate::test_support::{fixture, va};
use crate::types::{MemAttr, Pfn, Protection, PAGE_SIZE, VirtAddr};

const PAGES: usize = 16;
const FRAMES: usize = 8;
const MODEL_BASE: usize = 0x2000;

#[derive(Clone, Debug)]
enum Op {
    Enter { page: usize, frame: usize, write: bool, wired: bool },
    Remove { page: usize },
    Protect { page: usize },
    FaultStore { page: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..PAGES, 0..FRAMES, any::<bool>(), any::<bool>())
            .prop_map(|(page, frame, write, wired)| Op::Enter { page, frame, write, wired }),
        (0..PAGES).prop_map(|page| Op::Remove { page }),
        (0..PAGES).prop_map(|page| Op::Protect { page }),
        (0..PAGES).prop_map(|page| Op::FaultStore { page }),
    ]
}

#[derive(Clone, Copy)]
struct ModelEntry {
    frame: usize,
    write: bool,
    wired: bool,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever sequence of operations runs, the counters match the tree,
    /// the reverse map matches the mappings, and teardown returns every
    /// frame.
    #[test]
    fn accounting_matches_a_reference_model(ops in prop::collection::vec(op_strategy(), 1..48)) {
        let fix = fixture();
        fix.system.register_managed(Pfn::new(MODEL_BASE), FRAMES, MemAttr::WriteBack);
        let pmap = fix.system.create_pmap().expect("pmap");
        let mut model: BTreeMap<usize, ModelEntry> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Enter { page, frame, write, wired } => {
                    let mut prot = Protection::READ;
                    if write {
                        prot |= Protection::WRITE;
                    }
                    let flags = if wired { EnterFlags::WIRED } else { EnterFlags::empty() };
                    pmap.enter(va(page), Pfn::new(MODEL_BASE + frame), prot, Protection::READ, flags)
                        .expect("enter");
                    model.insert(page, ModelEntry { frame, write, wired });
                }
                Op::Remove { page } => {
                    pmap.remove(va(page), va(page + 1));
                    model.remove(&page);
                }
                Op::Protect { page } => {
                    pmap.protect(va(page), va(page + 1), Protection::READ);
                    if let Some(entry) = model.get_mut(&page) {
                        entry.write = false;
                    }
                }
                Op::FaultStore { page } => {
                    let outcome = pmap.emulate_fault(va(page), FaultAccess::Store);
                    let expected = model.get(&page).map(|e| e.write).unwrap_or(false);
                    prop_assert_eq!(outcome.is_ok(), expected);
                }
            }

            prop_assert_eq!(pmap.resident_count(), model.len());
            prop_assert_eq!(pmap.resident_count(), pmap.count_valid_leaves());
            let wired = model.values().filter(|e| e.wired).count();
            prop_assert_eq!(pmap.wired_count(), wired);
        }

        for page in 0..PAGES {
            let mapped = pmap.extract(va(page)).map(|pa| pa.pfn());
            let expected = model.get(&page).map(|e| Pfn::new(MODEL_BASE + e.frame));
            prop_assert_eq!(mapped, expected);
        }
        for frame in 0..FRAMES {
            let expected = model.values().filter(|e| e.frame == frame).count();
            prop_assert_eq!(fix.system.pages.pv_count(Pfn::new(MODEL_BASE + frame)), expected);
        }

        pmap.remove(va(0), va(PAGES));
        prop_assert_eq!(pmap.resident_count(), 0);
        fix.system.destroy_pmap(pmap);
        // only the kernel root table remains held
        prop_assert_eq!(fix.frames.outstanding(), 1);
    }

    /// Slot alloc/free churn never loses capacity and always hands back the
    /// backing frame of a chunk that empties out completely.
    #[test]
    fn pv_chunk_capacity_is_conserved(takes in prop::collection::vec(0..(2 * PV_PER_CHUNK), 1..64)) {
        let mut list = PvChunkList::new();
        list.add_chunk(Pfn::new(1));
        list.add_chunk(Pfn::new(2));
        let mut live: Vec<_> = Vec::new();
        let address = |n: usize| -> VirtAddr {
            match VirtAddr::page_aligned((n + 1) * PAGE_SIZE) {
                Some(va) => va,
                None => panic!("test address out of range"),
            }
        };

        for (step, take) in takes.into_iter().enumerate() {
            if take % 3 == 0 && !live.is_empty() {
                let handle = live.swap_remove(take % live.len());
                let _ = list.free(handle);
            } else if list.free_capacity() > 0 {
                let handle = match list.get(address(step)) {
                    Some(handle) => handle,
                    None => panic!("capacity reported but no slot"),
                };
                prop_assert_eq!(list.va(handle), address(step));
                live.push(handle);
            }
            let chunks = list.chunk_count();
            prop_assert_eq!(list.free_capacity(), chunks * PV_PER_CHUNK - live.len());
        }
    }
}
