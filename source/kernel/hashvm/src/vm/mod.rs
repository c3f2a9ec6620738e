// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: VM layer entry points: bootstrap, fault handling, address-space lifecycle
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below; tests/{fault, fork, teardown, global, concurrency}.rs
//! PUBLIC API: Vm::{bootstrap, with_tlb, fault, as_create, as_copy, as_destroy, as_activate,
//!             as_deactivate, unmap, complete_load, lookup, resident_pages, verify_table,
//!             copy_in, copy_out}
//! DEPENDS_ON: mm::{frame, hpt, address_space}, hal::{PhysWindow, Tlb}, arch::without_interrupts
//! INVARIANTS: Lock order is page table, then frame allocator; the page-table lock is
//!             never held while touching the translation cache

pub mod copy;
pub mod fault;
pub mod global;
mod user;

use alloc::vec::Vec;

use spin::Mutex;

use crate::arch;
use crate::config::VmConfig;
use crate::error::VmError;
use crate::hal::{PhysWindow, SoftTlb, Tlb};
use crate::mm::address_space::AddressSpace;
use crate::mm::frame::{FrameAllocator, FrameStats};
use crate::mm::hpt::{HashedPageTable, HptCorruption, Pte, PteFlags};
use crate::mm::region::Region;
use crate::mm::PAGE_SIZE;
use crate::types::{PhysAddr, VirtAddr};

/// The virtual-memory system: frame pool, shared page table and translation cache.
pub struct Vm<P: PhysWindow, T: Tlb = SoftTlb> {
    window: P,
    frames: FrameAllocator,
    hpt: Mutex<HashedPageTable>,
    tlb: T,
    config: VmConfig,
}

impl<P: PhysWindow> Vm<P, SoftTlb> {
    /// Brings up the VM layer over all of `window`'s RAM.
    ///
    /// Physical memory below `first_free` belongs to the kernel image. The
    /// page table and the frame table are carved from the pages after it.
    pub fn bootstrap(window: P, first_free: PhysAddr, config: VmConfig) -> Result<Self, VmError> {
        let tlb = SoftTlb::new(config.tlb_seed);
        Self::with_tlb(window, first_free, config, tlb)
    }
}

impl<P: PhysWindow, T: Tlb> Vm<P, T> {
    /// Like [`Vm::bootstrap`] with a caller-supplied translation cache.
    pub fn with_tlb(
        window: P,
        first_free: PhysAddr,
        config: VmConfig,
        tlb: T,
    ) -> Result<Self, VmError> {
        config.validate()?;
        let ram_size = window.ram_size();
        let total = ram_size / PAGE_SIZE;
        if first_free.raw() >= ram_size {
            return Err(VmError::OutOfMemory);
        }
        let slots = total
            .checked_mul(config.hpt_factor)
            .ok_or(VmError::InvalidArgument)?;

        let frames = FrameAllocator::new(first_free, ram_size);
        let hpt = frames
            .with_boot(|bump| HashedPageTable::new(bump, &window, slots))?;
        frames.init(&window)?;

        let stats = frames.stats();
        log_info!(
            target: "vm",
            "bootstrap: {} frames, {} reserved, {} page-table slots",
            stats.total,
            stats.reserved,
            hpt.size()
        );
        Ok(Self {
            window,
            frames,
            hpt: Mutex::new(hpt),
            tlb,
            config,
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn window(&self) -> &P {
        &self.window
    }

    pub fn tlb(&self) -> &T {
        &self.tlb
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.frames.stats()
    }

    /// `(occupied, size)` of the shared page table.
    pub fn table_usage(&self) -> (usize, usize) {
        let table = self.hpt.lock();
        (table.occupied(), table.size())
    }

    pub fn as_create(&self) -> AddressSpace {
        let space = AddressSpace::new();
        log_debug!(target: "vm", "created {}", space.id());
        space
    }

    /// Invalidates the translation cache before `space` runs.
    ///
    /// Cached entries are not tagged by address space, so everything goes.
    pub fn as_activate(&self, space: &AddressSpace) {
        log_trace!(target: "vm", "activate {}", space.id());
        self.flush_tlb();
    }

    pub fn as_deactivate(&self, space: &AddressSpace) {
        log_trace!(target: "vm", "deactivate {}", space.id());
        self.flush_tlb();
    }

    fn flush_tlb(&self) {
        arch::without_interrupts(|| self.tlb.flush_all());
    }

    /// Drops the mapping of the page containing `va` and frees its frame.
    pub fn unmap(&self, space: &AddressSpace, va: VirtAddr) -> Result<(), VmError> {
        let removed = {
            let mut table = self.hpt.lock();
            let pte = table
                .remove(space.id(), va.page_base())
                .ok_or(VmError::InvalidArgument)?;
            self.frames.free_frame(pte.frame);
            pte
        };
        log_debug!(
            target: "vm",
            "{}: unmapped {:#x} (frame {:#x})",
            space.id(),
            removed.page,
            removed.frame
        );
        self.flush_tlb();
        Ok(())
    }

    /// Restores declared region permissions after an image load and revokes
    /// write access from pages resident in regions that are not writable.
    pub fn complete_load(&self, space: &mut AddressSpace) -> Result<(), VmError> {
        space.complete_load();
        let owner = space.id();
        let in_writable = |va: VirtAddr| space.find_region(va).is_some_and(Region::is_writable);
        let mut table = self.hpt.lock();
        let mut revoke = Vec::new();
        revoke
            .try_reserve(table.count_of(owner))
            .map_err(|_| VmError::OutOfMemory)?;
        let stale = table
            .entries_of(owner)
            .filter(|pte| pte.writable() && !in_writable(pte.page));
        revoke.extend(stale);
        for pte in &revoke {
            table.set_flags(owner, pte.page, pte.flags - PteFlags::DIRTY);
        }
        drop(table);
        if !revoke.is_empty() {
            log_debug!(target: "vm", "{}: {} loaded pages now read-only", owner, revoke.len());
        }
        self.flush_tlb();
        Ok(())
    }

    /// Copy of the page-table entry mapping `va` in `space`.
    pub fn lookup(&self, space: &AddressSpace, va: VirtAddr) -> Option<Pte> {
        self.hpt.lock().lookup(space.id(), va.page_base())
    }

    /// Number of pages currently mapped for `space`.
    pub fn resident_pages(&self, space: &AddressSpace) -> usize {
        self.hpt.lock().count_of(space.id())
    }

    /// Runs the page table's structural self-check.
    pub fn verify_table(&self) -> Result<(), HptCorruption> {
        self.hpt.lock().verify()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::HostRam;
    use crate::mm::region::RegionFlags;
    use crate::vm::fault::FaultType;

    const RW: RegionFlags = RegionFlags::READ.union(RegionFlags::WRITE);
    const RX: RegionFlags = RegionFlags::READ.union(RegionFlags::EXECUTE);

    fn boot(frames: usize) -> Vm<HostRam> {
        let ram = HostRam::new(frames).expect("ram");
        Vm::bootstrap(ram, PhysAddr::from_frame(2), VmConfig::default()).expect("bootstrap")
    }

    fn touch(vm: &Vm<HostRam>, space: &AddressSpace, kind: FaultType, va: usize) {
        let va = VirtAddr::new(va);
        vm.fault(kind.code(), va, Some(space)).expect("fault");
    }

    fn cached(vm: &Vm<HostRam>, va: usize) -> Option<bool> {
        vm.tlb()
            .lookup(VirtAddr::new(va))
            .map(|entry| entry.writable)
    }

    fn mapped_writable(vm: &Vm<HostRam>, space: &AddressSpace, va: usize) -> bool {
        let pte = vm.lookup(space, VirtAddr::new(va)).expect("mapped");
        pte.writable()
    }

    #[test]
    fn bootstrap_reserves_kernel_and_tables() {
        let vm = boot(64);
        let stats = vm.frame_stats();
        // Kernel image (2) + page table (128 slots) + frame table (1 page).
        let table_pages = (128 * core::mem::size_of::<usize>() * 4).div_ceil(PAGE_SIZE);
        assert_eq!(stats.reserved, 2 + table_pages + 1);
        assert_eq!(stats.free, 64 - stats.reserved);
        assert_eq!(vm.table_usage(), (0, 128));
        assert_eq!(vm.verify_table(), Ok(()));
    }

    #[test]
    fn bootstrap_rejects_bad_input() {
        let ram = HostRam::new(4).expect("ram");
        let err = Vm::bootstrap(ram, PhysAddr::from_frame(8), VmConfig::default()).err();
        assert_eq!(err, Some(VmError::OutOfMemory));
        let ram = HostRam::new(4).expect("ram");
        let config = VmConfig {
            hpt_factor: 0,
            ..VmConfig::default()
        };
        let err = Vm::bootstrap(ram, PhysAddr::new(0), config).err();
        assert_eq!(err, Some(VmError::InvalidArgument));
    }

    #[test]
    fn unmap_frees_and_flushes() {
        let vm = boot(64);
        let mut space = vm.as_create();
        space
            .define_region(VirtAddr::new(0x1000), PAGE_SIZE, RW)
            .expect("region");
        let free = vm.frame_stats().free;
        touch(&vm, &space, FaultType::Read, 0x1000);
        assert_eq!(vm.frame_stats().free, free - 1);
        assert!(cached(&vm, 0x1000).is_some());

        vm.unmap(&space, VirtAddr::new(0x1234)).expect("unmap");
        assert_eq!(vm.frame_stats().free, free);
        assert_eq!(cached(&vm, 0x1000), None);
        assert_eq!(
            vm.unmap(&space, VirtAddr::new(0x1000)),
            Err(VmError::InvalidArgument)
        );
        vm.as_destroy(space);
    }

    #[test]
    fn complete_load_revokes_write_on_text() {
        let vm = boot(64);
        let mut space = vm.as_create();
        space
            .define_region(VirtAddr::new(0x1000), PAGE_SIZE, RX)
            .expect("text");
        space
            .define_region(VirtAddr::new(0x4000), PAGE_SIZE, RW)
            .expect("data");
        space.prepare_load();
        touch(&vm, &space, FaultType::Write, 0x1000);
        touch(&vm, &space, FaultType::Write, 0x4000);
        assert!(mapped_writable(&vm, &space, 0x1000));

        vm.complete_load(&mut space).expect("complete");
        assert!(!mapped_writable(&vm, &space, 0x1000));
        assert!(mapped_writable(&vm, &space, 0x4000));
        assert_eq!(cached(&vm, 0x1000), None);

        touch(&vm, &space, FaultType::Read, 0x1000);
        assert_eq!(cached(&vm, 0x1000), Some(false));
        vm.as_destroy(space);
    }

    #[test]
    fn activate_flushes_previous_translations() {
        let vm = boot(64);
        let mut space = vm.as_create();
        space
            .define_region(VirtAddr::new(0x1000), 4 * PAGE_SIZE, RegionFlags::READ)
            .expect("region");
        for page in 1..5 {
            touch(&vm, &space, FaultType::Read, page * PAGE_SIZE);
        }
        vm.as_deactivate(&space);
        assert_eq!(cached(&vm, 0x2000), None);
        touch(&vm, &space, FaultType::Read, 0x2000);
        vm.as_activate(&space);
        assert_eq!(cached(&vm, 0x2000), None);
        assert_eq!(vm.resident_pages(&space), 4);
        vm.as_destroy(space);
    }
}
