// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.

pub mod ram;
pub mod soft_tlb;

pub use ram::{DirectMap, HostRam};
pub use soft_tlb::SoftTlb;

use crate::mm::PAGE_SHIFT;
use crate::types::{PhysAddr, VirtAddr};

/// Kernel-visible window onto physical RAM.
pub trait PhysWindow: Send + Sync {
    /// Bytes of physical RAM starting at physical address zero.
    fn ram_size(&self) -> usize;
    /// Kernel pointer to the byte at `pa`. `pa` must lie below `ram_size()`.
    fn kva(&self, pa: PhysAddr) -> *mut u8;
}

/// One translation held by the hardware translation cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlbEntry {
    pub vpn: usize,
    pub pfn: usize,
    /// Writes are permitted (the "dirty" bit on software-refilled TLBs).
    pub writable: bool,
}

impl TlbEntry {
    pub const fn new(va: VirtAddr, pa: PhysAddr, writable: bool) -> Self {
        Self {
            vpn: va.vpn(),
            pfn: pa.frame(),
            writable,
        }
    }

    pub const fn frame_addr(&self) -> PhysAddr {
        PhysAddr::new(self.pfn << PAGE_SHIFT)
    }
}

/// TLB management operations.
pub trait Tlb: Send + Sync {
    /// Invalidates every cached translation.
    fn flush_all(&self);
    /// Installs `entry` in a slot chosen by the replacement policy.
    fn write_random(&self, entry: TlbEntry);
    /// Returns the cached translation covering `va`, if any.
    fn lookup(&self, va: VirtAddr) -> Option<TlbEntry>;
    /// Number of slots.
    fn capacity(&self) -> usize;
}

/// Cross-core invalidation request.
#[derive(Clone, Copy, Debug)]
pub struct TlbShootdown {
    pub va: VirtAddr,
}

/// Remote translation-cache invalidation is not supported on this kernel.
pub fn tlb_shootdown(ts: &TlbShootdown) -> ! {
    log_error!(target: "tlb", "shootdown requested for {:#x}", ts.va);
    panic!("vm tried to do tlb shootdown");
}
