// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel access to user memory through the page table.

use super::Vm;
use crate::error::VmError;
use crate::hal::{PhysWindow, Tlb};
use crate::mm::address_space::AddressSpace;
use crate::mm::region::Region;
use crate::mm::PAGE_SIZE;
use crate::types::VirtAddr;

impl<P: PhysWindow, T: Tlb> Vm<P, T> {
    /// Copies `data` into `space` at `va`, faulting pages in as needed.
    ///
    /// Fails with `ProtectionViolation` on a page that is outside every region
    /// or not writable. Pages before the failing one stay written; the failing
    /// page is never mapped.
    pub fn copy_out(&self, space: &AddressSpace, va: VirtAddr, data: &[u8]) -> Result<(), VmError> {
        self.walk_user(space, va, data.len(), true, |kva, offset, len| {
            // SAFETY: `kva` points at a mapped frame of at least `len` bytes.
            unsafe { core::ptr::copy_nonoverlapping(data[offset..].as_ptr(), kva, len) };
        })
    }

    /// Copies bytes from `space` at `va` into `buf`, faulting pages in as needed.
    pub fn copy_in(
        &self,
        space: &AddressSpace,
        va: VirtAddr,
        buf: &mut [u8],
    ) -> Result<(), VmError> {
        let len = buf.len();
        self.walk_user(space, va, len, false, |kva, offset, len| {
            // SAFETY: as in `copy_out`, with the copy running the other way.
            unsafe { core::ptr::copy_nonoverlapping(kva, buf[offset..].as_mut_ptr(), len) };
        })
    }

    fn walk_user(
        &self,
        space: &AddressSpace,
        va: VirtAddr,
        len: usize,
        write: bool,
        mut chunk: impl FnMut(*mut u8, usize, usize),
    ) -> Result<(), VmError> {
        va.raw()
            .checked_add(len)
            .ok_or(VmError::ProtectionViolation)?;
        let mut done = 0;
        while done < len {
            let at = VirtAddr::new(va.raw() + done);
            let take = (PAGE_SIZE - at.page_offset()).min(len - done);
            if write && !space.find_region(at).is_some_and(Region::is_writable) {
                log_warn!(target: "uio", "{}: copy to unwritable page {:#x}", space.id(), at);
                return Err(VmError::ProtectionViolation);
            }
            let resolved = self.resolve(space, at.page_base())?;
            if write && !resolved.writable {
                log_warn!(target: "uio", "{}: copy to read-only page {:#x}", space.id(), at);
                return Err(VmError::ProtectionViolation);
            }
            let base = self.window.kva(resolved.frame);
            // SAFETY: the offset stays inside the frame.
            chunk(unsafe { base.add(at.page_offset()) }, done, take);
            done += take;
        }
        Ok(())
    }
}
