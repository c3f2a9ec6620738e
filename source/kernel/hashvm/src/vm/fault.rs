// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Translation-fault kinds raised by the trap layer and the fault handler.

use super::Vm;
use crate::arch;
use crate::error::VmError;
use crate::hal::{PhysWindow, Tlb, TlbEntry};
use crate::mm::address_space::AddressSpace;
use crate::mm::hpt::{Pte, PteFlags};
use crate::mm::region::RegionFlags;
use crate::mm::zero_frame;
use crate::types::{PhysAddr, VirtAddr};

/// Kind of translation fault, as encoded by the trap layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum FaultType {
    /// Load from a page with no cached translation.
    Read = 0,
    /// Store to a page with no cached translation.
    Write = 1,
    /// Store through a cached translation without write permission.
    ReadOnly = 2,
}

impl FaultType {
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub const fn from_raw(code: u32) -> Result<Self, VmError> {
        match code {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            2 => Ok(Self::ReadOnly),
            _ => Err(VmError::InvalidArgument),
        }
    }
}

/// Translation found or created for a faulting page.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Resolved {
    pub frame: PhysAddr,
    pub writable: bool,
    /// A frame was allocated to satisfy the fault.
    pub fresh: bool,
}

impl Resolved {
    fn existing(pte: Pte) -> Self {
        Self {
            frame: pte.frame,
            writable: pte.writable(),
            fresh: false,
        }
    }
}

pub(crate) fn pte_flags(flags: RegionFlags) -> PteFlags {
    let mut pte = PteFlags::empty();
    pte.set(PteFlags::READ, flags.contains(RegionFlags::READ));
    pte.set(PteFlags::DIRTY, flags.contains(RegionFlags::WRITE));
    pte.set(PteFlags::EXECUTE, flags.contains(RegionFlags::EXECUTE));
    pte
}

impl<P: PhysWindow, T: Tlb> Vm<P, T> {
    /// Handles a translation fault at `va` for the running address space.
    ///
    /// Read-only faults are always protection violations. Otherwise an
    /// existing mapping is loaded into the translation cache, or a zeroed
    /// frame is mapped if `va` lies inside one of `current`'s regions.
    pub fn fault(
        &self,
        code: u32,
        va: VirtAddr,
        current: Option<&AddressSpace>,
    ) -> Result<(), VmError> {
        let kind = FaultType::from_raw(code).map_err(|err| {
            log_error!(target: "fault", "unknown fault code {} at {:#x}", code, va);
            err
        })?;
        if kind == FaultType::ReadOnly {
            log_warn!(target: "fault", "write to read-only page {:#x}", va);
            return Err(VmError::ProtectionViolation);
        }
        let Some(space) = current else {
            log_warn!(target: "fault", "{:?} fault at {:#x} with no address space", kind, va);
            return Err(VmError::ProtectionViolation);
        };

        let page = va.page_base();
        let resolved = self.resolve(space, page)?;
        log_trace!(
            target: "fault",
            "{} {:?} {:#x} -> {:#x}{}",
            space.id(),
            kind,
            page,
            resolved.frame,
            if resolved.fresh { " (new)" } else { "" }
        );
        self.install(page, resolved.frame, resolved.writable);
        Ok(())
    }

    /// Finds the mapping for `page`, creating a zero-filled one on a miss.
    pub(crate) fn resolve(
        &self,
        space: &AddressSpace,
        page: VirtAddr,
    ) -> Result<Resolved, VmError> {
        let owner = space.id();
        let hit = self.hpt.lock().lookup(owner, page);
        if let Some(pte) = hit {
            return Ok(Resolved::existing(pte));
        }

        let region = space.find_region(page).ok_or_else(|| {
            log_warn!(target: "fault", "{}: {:#x} outside every region", owner, page);
            VmError::ProtectionViolation
        })?;
        let flags = pte_flags(region.flags());

        let mut table = self.hpt.lock();
        // Another thread of this process may have mapped the page meanwhile.
        if let Some(pte) = table.lookup(owner, page) {
            return Ok(Resolved::existing(pte));
        }
        let frame = self.frames.alloc_frames(1)?;
        zero_frame(&self.window, frame);
        if let Err(err) = table.insert(owner, page, frame, flags) {
            self.frames.free_frame(frame);
            return Err(err);
        }
        Ok(Resolved {
            frame,
            writable: flags.contains(PteFlags::DIRTY),
            fresh: true,
        })
    }

    fn install(&self, page: VirtAddr, frame: PhysAddr, writable: bool) {
        let entry = TlbEntry::new(page, frame, writable);
        arch::without_interrupts(|| self.tlb.write_random(entry));
    }
}
