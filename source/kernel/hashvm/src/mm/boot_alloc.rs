// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-time bump allocator over raw physical memory
//! OWNERS: @kernel-mm-team
//! PUBLIC API: BootAllocator, StolenSlice
//! INVARIANTS: Monotonic; page granular; nothing handed out is ever returned

use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use super::PAGE_SIZE;
use crate::error::VmError;
use crate::hal::PhysWindow;
use crate::types::PhysAddr;

/// Steals pages from the bottom of free RAM before the frame table exists.
#[derive(Debug)]
pub struct BootAllocator {
    cursor: usize,
    end: usize,
}

impl BootAllocator {
    /// `first_free` is rounded up to a page; `end` is the top of RAM.
    pub const fn new(first_free: usize, end: usize) -> Self {
        let cursor = (first_free + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        Self { cursor, end }
    }

    /// Returns `npages` physically contiguous pages or `None` if RAM is exhausted.
    pub fn steal(&mut self, npages: usize) -> Option<PhysAddr> {
        if npages == 0 {
            return None;
        }
        let len = npages.checked_mul(PAGE_SIZE)?;
        let next = self.cursor.checked_add(len)?;
        if next > self.end {
            return None;
        }
        let base = self.cursor;
        self.cursor = next;
        Some(PhysAddr::new(base))
    }

    /// First byte not yet handed out.
    pub const fn cursor(&self) -> PhysAddr {
        PhysAddr::new(self.cursor)
    }
}

/// Typed array living in pages stolen from the boot allocator.
///
/// Backs the frame table and the hashed page table, which must exist before
/// any frame can be handed out through the free list.
pub struct StolenSlice<T> {
    ptr: NonNull<T>,
    len: usize,
    base: PhysAddr,
    _marker: PhantomData<T>,
}

// SAFETY: the slice is the sole owner of its pages; all access goes through
// the lock guarding the owning table.
unsafe impl<T: Send> Send for StolenSlice<T> {}
unsafe impl<T: Sync> Sync for StolenSlice<T> {}

impl<T: Copy> StolenSlice<T> {
    /// Steals enough pages for `len` elements and fills each with `fill`.
    pub fn steal<P: PhysWindow + ?Sized>(
        bump: &mut BootAllocator,
        window: &P,
        len: usize,
        fill: T,
    ) -> Result<Self, VmError> {
        debug_assert!(core::mem::align_of::<T>() <= PAGE_SIZE);
        if len == 0 {
            return Err(VmError::InvalidArgument);
        }
        let bytes = len
            .checked_mul(core::mem::size_of::<T>())
            .ok_or(VmError::OutOfMemory)?;
        let base = bump
            .steal(bytes.div_ceil(PAGE_SIZE))
            .ok_or(VmError::OutOfMemory)?;
        let ptr = NonNull::new(window.kva(base).cast::<T>())
            .ok_or(VmError::OutOfMemory)?;
        for index in 0..len {
            // SAFETY: the stolen pages cover `len` elements and are page aligned.
            unsafe { ptr.as_ptr().add(index).write(fill) };
        }
        Ok(Self {
            ptr,
            len,
            base,
            _marker: PhantomData,
        })
    }

    /// Physical address of the first element.
    pub fn base(&self) -> PhysAddr {
        self.base
    }
}

impl<T> Deref for StolenSlice<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: initialised in `steal`, exclusively owned by `self`.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for StolenSlice<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: as above; `&mut self` guarantees uniqueness.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}
