// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process address space: an identity plus its region list
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace::{new, id, define_region, define_stack, prepare_load, complete_load}
//! DEPENDS_ON: region::RegionList, types::AsId
//! INVARIANTS: The identity is fixed for the lifetime of the value and never reused;
//!             page mappings live in the shared table, so dropping an address space
//!             without `Vm::as_destroy` leaks its frames

use super::region::{Region, RegionFlags, RegionList};
use super::{pages_for, PAGE_SIZE};
use crate::config::VmConfig;
use crate::error::VmError;
use crate::types::{AsId, VirtAddr};

/// Virtual-memory context of one process.
#[derive(Debug)]
pub struct AddressSpace {
    id: AsId,
    regions: RegionList,
}

impl AddressSpace {
    /// Creates an empty address space with a fresh identity.
    pub fn new() -> Self {
        Self {
            id: AsId::allocate(),
            regions: RegionList::new(),
        }
    }

    pub(crate) fn with_regions(regions: RegionList) -> Self {
        Self {
            id: AsId::allocate(),
            regions,
        }
    }

    /// Key under which this address space's pages are stored in the page table.
    pub fn id(&self) -> AsId {
        self.id
    }

    pub fn regions(&self) -> &RegionList {
        &self.regions
    }

    /// Region containing `va`, if any.
    pub fn find_region(&self, va: VirtAddr) -> Option<&Region> {
        self.regions.find(va)
    }

    /// Defines a region covering `[vaddr, vaddr + memsize)`, widened to whole pages.
    pub fn define_region(
        &mut self,
        vaddr: VirtAddr,
        memsize: usize,
        flags: RegionFlags,
    ) -> Result<(), VmError> {
        let span = memsize
            .checked_add(vaddr.page_offset())
            .ok_or(VmError::InvalidArgument)?;
        let pages = pages_for(span);
        let base = vaddr.page_base();
        let end = pages
            .checked_mul(PAGE_SIZE)
            .and_then(|len| base.raw().checked_add(len));
        if pages == 0 || end.is_none() {
            return Err(VmError::InvalidArgument);
        }
        log_debug!(
            target: "as",
            "{}: region {:#x} pages={} flags={:?}",
            self.id,
            base,
            pages,
            flags
        );
        self.regions.push(Region::new(base, pages, flags))
    }

    /// Defines the user stack and returns the initial stack pointer.
    pub fn define_stack(&mut self, config: &VmConfig) -> Result<VirtAddr, VmError> {
        config.validate()?;
        let top = config.user_stack_top;
        let base = top - config.user_stack_pages * PAGE_SIZE;
        self.regions.push(Region::new(
            VirtAddr::new(base),
            config.user_stack_pages,
            RegionFlags::READ | RegionFlags::WRITE,
        ))?;
        Ok(VirtAddr::new(top))
    }

    /// Temporarily makes every region writable for image loading.
    pub fn prepare_load(&mut self) {
        self.regions.prepare_load();
    }

    /// Restores declared permissions. Use `Vm::complete_load` so resident
    /// pages lose write access too.
    pub fn complete_load(&mut self) {
        self.regions.complete_load();
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}
