// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-address-space virtual regions.

use alloc::vec::Vec;

use bitflags::bitflags;

use super::PAGE_SIZE;
use crate::error::VmError;
use crate::types::VirtAddr;

bitflags! {
    /// Access permitted within a region.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Contiguous page-aligned range with uniform permissions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    base: VirtAddr,
    pages: usize,
    flags: RegionFlags,
    /// Declared permissions while a load has widened `flags`.
    saved: Option<RegionFlags>,
}

impl Region {
    pub fn new(base: VirtAddr, pages: usize, flags: RegionFlags) -> Self {
        debug_assert_eq!(base.page_offset(), 0);
        Self {
            base,
            pages,
            flags,
            saved: None,
        }
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Permissions currently in force.
    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    /// Permissions the region was defined with, ignoring any load-time widening.
    pub fn declared_flags(&self) -> RegionFlags {
        self.saved.unwrap_or(self.flags)
    }

    pub fn is_writable(&self) -> bool {
        self.flags.contains(RegionFlags::WRITE)
    }

    /// `base <= va < base + pages * PAGE_SIZE`.
    pub fn contains(&self, va: VirtAddr) -> bool {
        let offset = match va.raw().checked_sub(self.base.raw()) {
            Some(offset) => offset,
            None => return false,
        };
        offset / PAGE_SIZE < self.pages
    }
}

/// Ordered list of regions; definition order is preserved.
///
/// Overlap is not checked. The loader is trusted to define disjoint regions.
#[derive(Debug, Default)]
pub struct RegionList {
    regions: Vec<Region>,
}

impl RegionList {
    pub const fn new() -> Self {
        Self { regions: Vec::new() }
    }

    pub fn push(&mut self, region: Region) -> Result<(), VmError> {
        self.regions
            .try_reserve(1)
            .map_err(|_| VmError::OutOfMemory)?;
        self.regions.push(region);
        Ok(())
    }

    /// First region containing `va`.
    pub fn find(&self, va: VirtAddr) -> Option<&Region> {
        self.regions.iter().find(|region| region.contains(va))
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Region> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Structural copy with the same bases, sizes and permissions.
    pub fn duplicate(&self) -> Result<Self, VmError> {
        let mut regions = Vec::new();
        regions
            .try_reserve_exact(self.regions.len())
            .map_err(|_| VmError::OutOfMemory)?;
        regions.extend_from_slice(&self.regions);
        Ok(Self { regions })
    }

    /// Makes every region writable so a loader can copy segment images in.
    pub fn prepare_load(&mut self) {
        for region in &mut self.regions {
            if region.saved.is_none() {
                region.saved = Some(region.flags);
            }
            region.flags |= RegionFlags::WRITE;
        }
    }

    /// Restores the permissions saved by [`prepare_load`](Self::prepare_load).
    pub fn complete_load(&mut self) {
        for region in &mut self.regions {
            if let Some(saved) = region.saved.take() {
                region.flags = saved;
            }
        }
    }
}
