// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical frames, the shared hashed page table, and per-process regions.

pub mod address_space;
pub mod boot_alloc;
pub mod frame;
pub mod hpt;
pub mod region;

use crate::hal::PhysWindow;
use crate::types::PhysAddr;

/// log2 of the page size.
pub const PAGE_SHIFT: usize = 12;
/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask selecting the page-number bits of an address.
pub const PAGE_FRAME: usize = !(PAGE_SIZE - 1);

pub const fn align_down(addr: usize) -> usize {
    addr & PAGE_FRAME
}

pub fn align_up(addr: usize) -> Option<usize> {
    addr.checked_add(PAGE_SIZE - 1).map(align_down)
}

/// Number of pages needed to hold `bytes`.
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

/// Fills the frame at `pa` with zeroes.
pub fn zero_frame<P: PhysWindow + ?Sized>(window: &P, pa: PhysAddr) {
    debug_assert!(pa.is_page_aligned());
    // SAFETY: `pa` is an allocated frame inside the window; the caller owns it.
    unsafe { core::ptr::write_bytes(window.kva(pa), 0, PAGE_SIZE) };
}

/// Copies the whole frame at `src` into the frame at `dst`.
pub fn copy_frame<P: PhysWindow + ?Sized>(window: &P, src: PhysAddr, dst: PhysAddr) {
    debug_assert!(src.is_page_aligned() && dst.is_page_aligned());
    debug_assert_ne!(src, dst);
    // SAFETY: both are distinct allocated frames inside the window.
    unsafe { core::ptr::copy_nonoverlapping(window.kva(src), window.kva(dst), PAGE_SIZE) };
}

#[cfg(test)]
mod tests_prop;
