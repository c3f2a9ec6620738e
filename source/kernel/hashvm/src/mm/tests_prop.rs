// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the hashed page table and the frame allocator
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic. Tiny tables force long, merged collision chains.
//!
//! TEST_SCOPE:
//!   - Page table agrees with a map model under random insert/remove sequences
//!   - Chain structure stays valid after every mutation
//!   - Frames handed out are distinct and never in the reserved range
//!
//! TEST_SCENARIOS:
//!   - table_matches_model(): every key resolves exactly as the model says
//!   - full_table_rejects_then_recovers(): OutOfMemory at capacity, inserts succeed after a remove
//!   - frames_are_injective(): random alloc/free never yields a live frame twice

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;

use proptest::prelude::*;

use super::boot_alloc::BootAllocator;
use super::frame::FrameAllocator;
use super::hpt::{HashedPageTable, PteFlags};
use super::PAGE_SIZE;
use crate::error::VmError;
use crate::hal::{HostRam, PhysWindow};
use crate::types::{AsId, PhysAddr, VirtAddr};

#[derive(Clone, Debug)]
enum Op {
    Insert { owner: usize, page: usize },
    Remove { owner: usize, page: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..3, 0usize..40).prop_map(|(owner, page)| Op::Insert { owner, page }),
        2 => (0usize..3, 0usize..40).prop_map(|(owner, page)| Op::Remove { owner, page }),
    ]
}

fn small_table(ram: &HostRam, size: usize) -> HashedPageTable {
    let mut bump = BootAllocator::new(0, ram.ram_size());
    HashedPageTable::new(&mut bump, ram, size).expect("table")
}

fn va(page: usize) -> VirtAddr {
    VirtAddr::new(page * PAGE_SIZE)
}

proptest! {
    #[test]
    fn table_matches_model(
        size in 1usize..12,
        ops in proptest::collection::vec(arb_op(), 1..120),
    ) {
        let ram = HostRam::new(2).expect("ram");
        let mut table = small_table(&ram, size);
        let owners = [AsId::allocate(), AsId::allocate(), AsId::allocate()];
        let mut model: BTreeMap<(usize, usize), usize> = BTreeMap::new();
        let mut next_frame = 1;

        for op in ops {
            match op {
                Op::Insert { owner, page } => {
                    let frame = PhysAddr::from_frame(next_frame);
                    let result = table.insert(owners[owner], va(page), frame, PteFlags::READ);
                    if model.contains_key(&(owner, page)) {
                        prop_assert_eq!(result, Err(VmError::InvalidArgument));
                    } else if model.len() == size {
                        prop_assert_eq!(result, Err(VmError::OutOfMemory));
                    } else {
                        prop_assert_eq!(result, Ok(()));
                        model.insert((owner, page), next_frame);
                        next_frame += 1;
                    }
                }
                Op::Remove { owner, page } => {
                    let removed = table
                        .remove(owners[owner], va(page))
                        .map(|pte| pte.frame.frame());
                    prop_assert_eq!(removed, model.remove(&(owner, page)));
                }
            }
            prop_assert_eq!(table.verify(), Ok(()));
            prop_assert_eq!(table.occupied(), model.len());
        }

        for owner in 0..3 {
            for page in 0..40 {
                let found = table
                    .lookup(owners[owner], va(page))
                    .map(|pte| pte.frame.frame());
                prop_assert_eq!(found, model.get(&(owner, page)).copied());
            }
            let modelled = model.keys().filter(|(o, _)| *o == owner).count();
            prop_assert_eq!(table.count_of(owners[owner]), modelled);
        }
    }

    #[test]
    fn full_table_rejects_then_recovers(size in 1usize..10, victim in 0usize..10) {
        let ram = HostRam::new(2).expect("ram");
        let mut table = small_table(&ram, size);
        let owner = AsId::allocate();
        for page in 0..size {
            table
                .insert(owner, va(page), PhysAddr::from_frame(page + 1), PteFlags::READ)
                .expect("fits");
        }
        prop_assert_eq!(
            table.insert(owner, va(size), PhysAddr::from_frame(99), PteFlags::READ),
            Err(VmError::OutOfMemory)
        );
        let victim = victim % size;
        prop_assert!(table.remove(owner, va(victim)).is_some());
        prop_assert_eq!(
            table.insert(owner, va(size), PhysAddr::from_frame(99), PteFlags::READ),
            Ok(())
        );
        prop_assert_eq!(table.verify(), Ok(()));
    }

    #[test]
    fn frames_are_injective(
        steps in proptest::collection::vec(any::<Option<prop::sample::Index>>(), 1..200),
    ) {
        let ram = HostRam::new(24).expect("ram");
        let frames = FrameAllocator::new(PhysAddr::from_frame(1), ram.ram_size());
        frames.init(&ram).expect("init");
        let reserved = frames.stats().reserved;
        let mut live: Vec<PhysAddr> = Vec::new();

        for step in steps {
            match step {
                None => {
                    if let Ok(pa) = frames.alloc_frames(1) {
                        prop_assert!(pa.frame() >= reserved);
                        prop_assert!(!live.contains(&pa));
                        live.push(pa);
                    } else {
                        prop_assert_eq!(live.len(), 24 - reserved);
                    }
                }
                Some(index) if !live.is_empty() => {
                    let pa = live.swap_remove(index.index(live.len()));
                    frames.free_frame(pa);
                }
                Some(_) => {}
            }
            let unique: BTreeSet<usize> = live.iter().map(|pa| pa.raw()).collect();
            prop_assert_eq!(unique.len(), live.len());
            prop_assert_eq!(frames.stats().free, 24 - reserved - live.len());
        }
    }
}
