// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process-wide hashed page table keyed by (address space, virtual page)
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! PUBLIC API: HashedPageTable::{new, lookup, insert, remove, entries_of, set_flags, verify}
//! DEPENDS_ON: boot_alloc::StolenSlice, bitflags, static_assertions
//! INVARIANTS: At most one entry per (owner, page); every entry is reachable by
//!             following `next` links from its home slot; every slot has at most
//!             one incoming link, and an entry sitting in its own home slot has none
//!
//! Collisions use coalesced chaining: a colliding entry is placed in the first
//! empty slot found by linear probing and linked from the tail of the chain that
//! starts at its home slot. Chains of different home slots may merge; walks skip
//! entries that do not match. Removal re-homes the chain suffix behind the
//! removed slot so nothing behind it becomes unreachable.

use alloc::vec::Vec;

use bitflags::bitflags;
use static_assertions::const_assert;

use super::boot_alloc::{BootAllocator, StolenSlice};
use super::PAGE_SIZE;
use crate::error::VmError;
use crate::hal::PhysWindow;
use crate::types::{AsId, PhysAddr, VirtAddr};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Permission bits stored with each mapping.
    pub struct PteFlags: u32 {
        const READ = 1 << 0;
        /// Write enable; installed as the TLB "dirty" bit.
        const DIRTY = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

const NIL: u32 = u32::MAX;
/// Owner value of an unused slot.
const EMPTY: usize = 0;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Slot {
    owner: usize,
    vpn: usize,
    pfn: usize,
    flags: u32,
    next: u32,
}

const_assert!(core::mem::size_of::<Slot>() <= PAGE_SIZE);
const_assert!(core::mem::align_of::<Slot>() <= PAGE_SIZE);

impl Slot {
    const FREE: Self = Self {
        owner: EMPTY,
        vpn: 0,
        pfn: 0,
        flags: 0,
        next: NIL,
    };

    fn is_free(&self) -> bool {
        self.owner == EMPTY
    }

    fn matches(&self, owner: AsId, vpn: usize) -> bool {
        self.owner == owner.raw() && self.vpn == vpn
    }

    fn to_pte(self) -> Option<Pte> {
        let owner = AsId::from_raw(self.owner)?;
        Some(Pte {
            owner,
            page: VirtAddr::new(self.vpn << super::PAGE_SHIFT),
            frame: PhysAddr::from_frame(self.pfn),
            flags: PteFlags::from_bits_truncate(self.flags),
        })
    }
}

/// Copy of a page-table entry handed to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pte {
    pub owner: AsId,
    /// Page-aligned virtual address.
    pub page: VirtAddr,
    pub frame: PhysAddr,
    pub flags: PteFlags,
}

impl Pte {
    pub fn writable(&self) -> bool {
        self.flags.contains(PteFlags::DIRTY)
    }
}

/// Structural problem found by [`HashedPageTable::verify`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HptCorruption {
    /// Entry at this slot cannot be reached from its home slot.
    Unreachable(usize),
    /// Two entries share an (owner, page) key; slots given.
    Duplicate(usize, usize),
    /// A slot is the target of more than one link.
    SharedLink(usize),
    /// A live slot links to a free slot or outside the table.
    DanglingLink(usize),
    /// Occupancy counter disagrees with the slots.
    Count { counted: usize, recorded: usize },
}

/// Fixed-size open hash table shared by every address space.
pub struct HashedPageTable {
    slots: StolenSlice<Slot>,
    occupied: usize,
}

impl HashedPageTable {
    /// Builds a table of `size` slots in pages stolen from the boot allocator.
    pub fn new<P: PhysWindow + ?Sized>(
        bump: &mut BootAllocator,
        window: &P,
        size: usize,
    ) -> Result<Self, VmError> {
        if size == 0 || size >= NIL as usize {
            return Err(VmError::InvalidArgument);
        }
        let slots = StolenSlice::steal(bump, window, size, Slot::FREE)?;
        log_info!(target: "hpt", "hashed page table at {:#x}: {} slots", slots.base(), size);
        Ok(Self { slots, occupied: 0 })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn occupied(&self) -> usize {
        self.occupied
    }

    /// `(owner ^ vpn) mod size`.
    pub fn hash(&self, owner: AsId, vpn: usize) -> usize {
        (owner.raw() ^ vpn) % self.slots.len()
    }

    fn find(&self, owner: AsId, vpn: usize) -> Option<usize> {
        let mut index = self.hash(owner, vpn);
        for _ in 0..self.slots.len() {
            let slot = &self.slots[index];
            if slot.is_free() {
                return None;
            }
            if slot.matches(owner, vpn) {
                return Some(index);
            }
            if slot.next == NIL {
                return None;
            }
            index = slot.next as usize;
        }
        log_error!(target: "hpt", "chain walk from {} exceeded table size", self.hash(owner, vpn));
        None
    }

    /// Returns the entry mapping the page containing `va` for `owner`.
    pub fn lookup(&self, owner: AsId, va: VirtAddr) -> Option<Pte> {
        self.find(owner, va.vpn())
            .and_then(|index| self.slots[index].to_pte())
    }

    /// Records a new mapping for the page containing `va`.
    ///
    /// Returns `InvalidArgument` if the page is already mapped for `owner` and
    /// `OutOfMemory` if every slot is taken.
    pub fn insert(
        &mut self,
        owner: AsId,
        va: VirtAddr,
        frame: PhysAddr,
        flags: PteFlags,
    ) -> Result<(), VmError> {
        let vpn = va.vpn();
        if self.find(owner, vpn).is_some() {
            return Err(VmError::InvalidArgument);
        }
        let slot = Slot {
            owner: owner.raw(),
            vpn,
            pfn: frame.frame(),
            flags: flags.bits(),
            next: NIL,
        };
        self.place(slot)
    }

    fn place(&mut self, slot: Slot) -> Result<(), VmError> {
        let size = self.slots.len();
        let home = (slot.owner ^ slot.vpn) % size;
        if self.slots[home].is_free() {
            self.slots[home] = slot;
            self.occupied += 1;
            return Ok(());
        }

        let tail = self.chain_tail(home);
        let free = (1..size)
            .map(|step| (home + step) % size)
            .find(|&index| self.slots[index].is_free());
        let Some(free) = free else {
            log_warn!(target: "hpt", "table full ({} slots)", size);
            return Err(VmError::OutOfMemory);
        };
        self.slots[free] = slot;
        self.slots[tail].next = free as u32;
        self.occupied += 1;
        Ok(())
    }

    fn chain_tail(&self, start: usize) -> usize {
        let mut index = start;
        for _ in 0..self.slots.len() {
            let next = self.slots[index].next;
            if next == NIL {
                break;
            }
            index = next as usize;
        }
        index
    }

    /// Removes the mapping of the page containing `va` and returns it.
    ///
    /// The caller owns the returned frame.
    pub fn remove(&mut self, owner: AsId, va: VirtAddr) -> Option<Pte> {
        let index = self.find(owner, va.vpn())?;
        let removed = self.slots[index];

        if let Some(pred) = self.predecessor(index) {
            self.slots[pred].next = NIL;
        }

        // Detach the suffix, then re-home it in chain order.
        let mut suffix = Vec::new();
        let mut cursor = removed.next;
        while cursor != NIL && suffix.len() < self.slots.len() {
            let at = cursor as usize;
            if self.slots[at].is_free() {
                break;
            }
            let mut entry = self.slots[at];
            cursor = entry.next;
            entry.next = NIL;
            self.slots[at] = Slot::FREE;
            suffix.push(entry);
        }
        self.slots[index] = Slot::FREE;
        self.occupied -= 1 + suffix.len();

        for entry in suffix {
            self.reinsert(entry);
        }
        removed.to_pte()
    }

    /// Places an entry detached during chain repair. At least one more slot
    /// is free than there are detached entries, so this only fails on a
    /// corrupted table.
    fn reinsert(&mut self, entry: Slot) {
        let placed = self.place(entry);
        if placed.is_err() {
            log_error!(target: "hpt", "lost entry vpn={:#x} while repairing chain", entry.vpn);
        }
        debug_assert!(placed.is_ok(), "chain repair lost vpn {:#x}", entry.vpn);
    }

    /// Slot whose `next` link points at `index`, if any.
    fn predecessor(&self, index: usize) -> Option<usize> {
        let slot = &self.slots[index];
        let mut cursor = (slot.owner ^ slot.vpn) % self.slots.len();
        let mut prev = None;
        for _ in 0..self.slots.len() {
            if cursor == index {
                return prev;
            }
            let next = self.slots[cursor].next;
            if next == NIL {
                break;
            }
            prev = Some(cursor);
            cursor = next as usize;
        }
        None
    }

    /// Replaces the permission bits of an existing mapping.
    pub fn set_flags(&mut self, owner: AsId, va: VirtAddr, flags: PteFlags) -> bool {
        match self.find(owner, va.vpn()) {
            Some(index) => {
                self.slots[index].flags = flags.bits();
                true
            }
            None => false,
        }
    }

    /// Every mapping owned by `owner`, in slot order.
    pub fn entries_of(&self, owner: AsId) -> impl Iterator<Item = Pte> + '_ {
        self.slots
            .iter()
            .filter(move |slot| slot.owner == owner.raw())
            .filter_map(|slot| slot.to_pte())
    }

    /// Number of mappings owned by `owner`.
    pub fn count_of(&self, owner: AsId) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.owner == owner.raw())
            .count()
    }

    /// Checks the structural invariants of the table.
    pub fn verify(&self) -> Result<(), HptCorruption> {
        let size = self.slots.len();
        let mut incoming = alloc::vec![0u8; size];
        let mut counted = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.is_free() {
                continue;
            }
            counted += 1;
            if slot.next != NIL {
                let next = slot.next as usize;
                if next >= size || self.slots[next].is_free() {
                    return Err(HptCorruption::DanglingLink(index));
                }
                incoming[next] = incoming[next].saturating_add(1);
                if incoming[next] > 1 {
                    return Err(HptCorruption::SharedLink(next));
                }
            }
            let Some(owner) = AsId::from_raw(slot.owner) else {
                continue;
            };
            match self.find(owner, slot.vpn) {
                Some(found) if found == index => {}
                Some(found) => return Err(HptCorruption::Duplicate(found, index)),
                None => return Err(HptCorruption::Unreachable(index)),
            }
        }
        if counted != self.occupied {
            return Err(HptCorruption::Count {
                counted,
                recorded: self.occupied,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::HostRam;

    fn fixture(size: usize) -> (HashedPageTable, HostRam) {
        let ram = HostRam::new(16).expect("ram");
        let mut bump = BootAllocator::new(0, ram.ram_size());
        let table = HashedPageTable::new(&mut bump, &ram, size).expect("table");
        (table, ram)
    }

    fn va(page: usize) -> VirtAddr {
        VirtAddr::new(page * PAGE_SIZE)
    }

    fn rw() -> PteFlags {
        PteFlags::READ | PteFlags::DIRTY
    }

    fn map(table: &mut HashedPageTable, owner: AsId, page: usize, frame: usize) {
        table
            .insert(owner, va(page), PhysAddr::from_frame(frame), rw())
            .expect("insert");
    }

    fn frame_at(table: &HashedPageTable, owner: AsId, page: usize) -> Option<usize> {
        table.lookup(owner, va(page)).map(|pte| pte.frame.frame())
    }

    #[test]
    fn insert_then_lookup() {
        let (mut table, _ram) = fixture(8);
        let owner = AsId::allocate();
        let frame = PhysAddr::from_frame(9);
        table
            .insert(owner, VirtAddr::new(0x3abc), frame, rw())
            .expect("insert");
        let pte = table.lookup(owner, VirtAddr::new(0x3000)).expect("mapped");
        assert_eq!(pte.frame, frame);
        assert_eq!(pte.page, VirtAddr::new(0x3000));
        assert!(pte.writable());
        assert!(table.lookup(owner, VirtAddr::new(0x4000)).is_none());
        assert!(table.lookup(AsId::allocate(), VirtAddr::new(0x3000)).is_none());
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let (mut table, _ram) = fixture(8);
        let owner = AsId::allocate();
        map(&mut table, owner, 1, 1);
        assert_eq!(
            table.insert(owner, va(1), PhysAddr::from_frame(2), rw()),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(table.occupied(), 1);
    }

    #[test]
    fn collisions_chain_and_stay_reachable() {
        let (mut table, _ram) = fixture(4);
        let owner = AsId::allocate();
        // Pages 4 apart share a home slot in a 4-slot table.
        for i in 0..4 {
            map(&mut table, owner, i * 4, i + 1);
        }
        assert_eq!(table.verify(), Ok(()));
        for i in 0..4 {
            assert_eq!(frame_at(&table, owner, i * 4), Some(i + 1));
        }
        assert_eq!(
            table.insert(owner, va(100), PhysAddr::from_frame(9), rw()),
            Err(VmError::OutOfMemory)
        );
    }

    #[test]
    fn removing_chain_head_promotes_successor() {
        let (mut table, _ram) = fixture(4);
        let owner = AsId::allocate();
        for i in 0..3 {
            map(&mut table, owner, i * 4, i + 1);
        }
        let removed = table.remove(owner, va(0)).expect("removed");
        assert_eq!(removed.frame, PhysAddr::from_frame(1));
        assert_eq!(table.verify(), Ok(()));
        assert_eq!(frame_at(&table, owner, 0), None);
        assert_eq!(frame_at(&table, owner, 4), Some(2));
        assert_eq!(frame_at(&table, owner, 8), Some(3));
        // The next member now sits in the vacated home slot.
        let home = table.hash(owner, 4);
        assert!(table.slots[home].matches(owner, 4));
    }

    #[test]
    fn removing_middle_keeps_foreign_homes_reachable() {
        let (mut table, _ram) = fixture(5);
        let owner = AsId::allocate();
        let home = table.hash(owner, 0);
        let spill = (home + 1) % 5;
        let colliding: Vec<usize> = (1..256)
            .filter(|&p| table.hash(owner, p) == home)
            .take(2)
            .collect();
        let foreign = (1..256)
            .find(|&p| table.hash(owner, p) == spill)
            .expect("key");
        // Chain 0 -> a -> b spills into the slots after `home`; `foreign`
        // hashes onto the first spilled slot and joins that chain.
        map(&mut table, owner, 0, 1);
        map(&mut table, owner, colliding[0], 2);
        map(&mut table, owner, colliding[1], 3);
        map(&mut table, owner, foreign, 4);
        assert_eq!(table.verify(), Ok(()));

        table.remove(owner, va(colliding[0])).expect("removed");
        assert_eq!(table.verify(), Ok(()));
        for (page, frame) in [(0, 1), (colliding[1], 3), (foreign, 4)] {
            assert_eq!(frame_at(&table, owner, page), Some(frame));
        }
        assert_eq!(frame_at(&table, owner, colliding[0]), None);
        assert_eq!(table.occupied(), 3);
    }

    #[test]
    fn removal_stops_at_a_cut_chain() {
        let (mut table, _ram) = fixture(4);
        let owner = AsId::allocate();
        for i in 0..3 {
            map(&mut table, owner, i * 4, i + 1);
        }
        // Point the tail back into the chain, as a stray write would.
        let tail = table.chain_tail(table.hash(owner, 0));
        let second = table.slots[table.hash(owner, 0)].next;
        table.slots[tail].next = second;

        table.remove(owner, va(0)).expect("removed");
        assert_eq!(table.verify(), Ok(()));
        assert_eq!(frame_at(&table, owner, 4), Some(2));
        assert_eq!(frame_at(&table, owner, 8), Some(3));
        assert_eq!(table.occupied(), 2);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "chain repair lost vpn")]
    fn failed_chain_repair_is_loud() {
        let (mut table, _ram) = fixture(2);
        let owner = AsId::allocate();
        map(&mut table, owner, 0, 1);
        map(&mut table, owner, 1, 2);
        let mut stray = Slot::FREE;
        stray.owner = owner.raw();
        stray.vpn = 2;
        table.reinsert(stray);
    }

    #[test]
    fn owners_are_disambiguated() {
        let (mut table, _ram) = fixture(16);
        let a = AsId::allocate();
        let b = AsId::allocate();
        map(&mut table, a, 7, 1);
        table
            .insert(b, va(7), PhysAddr::from_frame(2), PteFlags::READ)
            .expect("insert");
        assert_eq!(frame_at(&table, a, 7), Some(1));
        assert_eq!(frame_at(&table, b, 7), Some(2));
        assert_eq!(table.count_of(a), 1);
        assert_eq!(table.entries_of(b).count(), 1);
        table.remove(a, va(7)).expect("removed");
        assert!(table.lookup(b, va(7)).is_some());
    }

    #[test]
    fn set_flags_updates_existing_only() {
        let (mut table, _ram) = fixture(8);
        let owner = AsId::allocate();
        map(&mut table, owner, 2, 1);
        assert!(table.set_flags(owner, va(2), PteFlags::READ));
        assert!(!table.lookup(owner, va(2)).expect("hit").writable());
        assert!(!table.set_flags(owner, va(3), PteFlags::READ));
    }
}
