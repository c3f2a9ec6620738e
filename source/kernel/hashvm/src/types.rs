// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes for addresses and address-space identity
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VirtAddr, PhysAddr, AsId
//! INVARIANTS: AsId values are never reused and never zero (zero is the empty-slot owner)

use core::fmt;
use core::num::NonZeroUsize;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::mm::{PAGE_SHIFT, PAGE_SIZE};

/// User virtual address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Address of the first byte of the containing page.
    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// Virtual page number.
    #[inline]
    pub const fn vpn(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Physical address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn from_frame(frame: usize) -> Self {
        Self(frame << PAGE_SHIFT)
    }

    /// Physical frame number.
    #[inline]
    pub const fn frame(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Identity of an address space as seen by the page table.
///
/// The page table only compares these by value; it never owns or reaches the
/// address space through one. Values come from a global counter and are not
/// recycled, so a stale entry can never be mistaken for a newer address space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct AsId(NonZeroUsize);

impl AsId {
    pub(crate) fn allocate() -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(1);
        let raw = NEXT.fetch_add(1, Ordering::Relaxed);
        match NonZeroUsize::new(raw) {
            Some(id) => Self(id),
            None => panic!("address-space identifiers exhausted"),
        }
    }

    /// Reconstructs an identity from its raw value; zero is the empty sentinel.
    #[inline]
    pub fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0.get()
    }
}

impl fmt::Display for AsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as:{}", self.0)
    }
}
