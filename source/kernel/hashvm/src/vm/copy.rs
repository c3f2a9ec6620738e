// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Address-space duplication (fork) and teardown.

use alloc::vec::Vec;

use super::Vm;
use crate::error::VmError;
use crate::hal::{PhysWindow, Tlb};
use crate::mm::address_space::AddressSpace;
use crate::mm::copy_frame;
use crate::types::{AsId, VirtAddr};

impl<P: PhysWindow, T: Tlb> Vm<P, T> {
    /// Duplicates `old` eagerly: same regions, and a private copy of every
    /// resident page.
    ///
    /// On failure nothing of the new address space survives.
    pub fn as_copy(&self, old: &AddressSpace) -> Result<AddressSpace, VmError> {
        let new = AddressSpace::with_regions(old.regions().duplicate()?);
        match self.copy_pages(old.id(), new.id()) {
            Ok(copied) => {
                log_debug!(target: "fork", "{} -> {}: copied {} pages", old.id(), new.id(), copied);
                Ok(new)
            }
            Err(err) => {
                log_warn!(target: "fork", "{} -> {} failed: {}", old.id(), new.id(), err);
                self.as_destroy(new);
                Err(err)
            }
        }
    }

    fn copy_pages(&self, from: AsId, to: AsId) -> Result<usize, VmError> {
        let mut table = self.hpt.lock();
        let mut parent = Vec::new();
        parent
            .try_reserve_exact(table.count_of(from))
            .map_err(|_| VmError::OutOfMemory)?;
        parent.extend(table.entries_of(from));

        for pte in &parent {
            let frame = self.frames.alloc_frames(1)?;
            copy_frame(&self.window, pte.frame, frame);
            if let Err(err) = table.insert(to, pte.page, frame, pte.flags) {
                self.frames.free_frame(frame);
                return Err(err);
            }
        }
        Ok(parent.len())
    }

    /// Releases every page `space` maps, then drops its regions.
    pub fn as_destroy(&self, space: AddressSpace) {
        let owner = space.id();
        let released = {
            let mut table = self.hpt.lock();
            let pages: Vec<VirtAddr> = table.entries_of(owner).map(|pte| pte.page).collect();
            for page in &pages {
                if let Some(pte) = table.remove(owner, *page) {
                    self.frames.free_frame(pte.frame);
                }
            }
            pages.len()
        };
        log_debug!(target: "vm", "destroyed {}: released {} frames", owner, released);
        drop(space);
    }
}
