// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical RAM windows: the kernel direct map and a heap-backed stand-in.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::ptr::NonNull;

use super::PhysWindow;
use crate::error::VmError;
use crate::mm::PAGE_SIZE;
use crate::types::PhysAddr;

/// Direct-mapped window: physical address `pa` is visible at `pa + offset`.
#[derive(Debug)]
pub struct DirectMap {
    offset: usize,
    ram_size: usize,
}

impl DirectMap {
    /// # Safety
    ///
    /// `[offset, offset + ram_size)` must map all of physical RAM, read/write,
    /// for as long as the window is in use.
    pub const unsafe fn new(offset: usize, ram_size: usize) -> Self {
        Self { offset, ram_size }
    }
}

impl PhysWindow for DirectMap {
    fn ram_size(&self) -> usize {
        self.ram_size
    }

    fn kva(&self, pa: PhysAddr) -> *mut u8 {
        debug_assert!(
            pa.raw() < self.ram_size,
            "physical address {:#x} beyond RAM",
            pa
        );
        pa.raw().wrapping_add(self.offset) as *mut u8
    }
}

/// Page-aligned, zero-initialised heap buffer standing in for physical RAM.
pub struct HostRam {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is uniquely owned; concurrent access to frames is
// serialised by the frame allocator and page-table locks.
unsafe impl Send for HostRam {}
unsafe impl Sync for HostRam {}

impl HostRam {
    /// Allocates `frames` pages of zeroed RAM.
    pub fn new(frames: usize) -> Result<Self, VmError> {
        let size = frames
            .checked_mul(PAGE_SIZE)
            .ok_or(VmError::InvalidArgument)?;
        if size == 0 {
            return Err(VmError::InvalidArgument);
        }
        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|_| VmError::InvalidArgument)?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw).ok_or(VmError::OutOfMemory)?;
        Ok(Self { base, layout })
    }
}

impl PhysWindow for HostRam {
    fn ram_size(&self) -> usize {
        self.layout.size()
    }

    fn kva(&self, pa: PhysAddr) -> *mut u8 {
        debug_assert!(
            pa.raw() < self.layout.size(),
            "physical address {:#x} beyond RAM",
            pa
        );
        self.base.as_ptr().wrapping_add(pa.raw())
    }
}

impl Drop for HostRam {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}
