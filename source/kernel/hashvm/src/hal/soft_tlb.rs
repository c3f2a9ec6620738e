// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Software-refilled translation cache with random replacement.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use spin::Mutex;

use super::{Tlb, TlbEntry};
use crate::types::VirtAddr;

/// Slots in the translation cache.
pub const NUM_TLB: usize = 64;

struct State {
    slots: [Option<TlbEntry>; NUM_TLB],
    rng: SmallRng,
}

/// Translation cache model matching a MIPS-style `tlbwr`: each install picks
/// an arbitrary slot, nothing tracks recency.
pub struct SoftTlb {
    state: Mutex<State>,
}

impl SoftTlb {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(State {
                slots: [None; NUM_TLB],
                rng: SmallRng::seed_from_u64(seed),
            }),
        }
    }

    /// Number of valid slots.
    pub fn occupied(&self) -> usize {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }
}

impl Tlb for SoftTlb {
    fn flush_all(&self) {
        self.state.lock().slots = [None; NUM_TLB];
    }

    fn write_random(&self, entry: TlbEntry) {
        let mut state = self.state.lock();
        // Two valid slots for one page would be a machine check on real hardware.
        let existing = state
            .slots
            .iter()
            .position(|slot| matches!(slot, Some(e) if e.vpn == entry.vpn));
        let index = match existing {
            Some(index) => index,
            None => state.rng.gen_range(0..NUM_TLB),
        };
        state.slots[index] = Some(entry);
    }

    fn lookup(&self, va: VirtAddr) -> Option<TlbEntry> {
        let vpn = va.vpn();
        self.state
            .lock()
            .slots
            .iter()
            .flatten()
            .find(|entry| entry.vpn == vpn)
            .copied()
    }

    fn capacity(&self) -> usize {
        NUM_TLB
    }
}
