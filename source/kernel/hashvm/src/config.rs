// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot-time tunables for the VM layer.

use crate::error::VmError;
use crate::mm::PAGE_SIZE;

/// Configuration handed to [`crate::Vm::bootstrap`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// Page-table slots per physical frame. Over-provisioning keeps chains short.
    pub hpt_factor: usize,
    /// Seed for the software translation cache's replacement choices.
    pub tlb_seed: u64,
    /// One past the highest user stack address.
    pub user_stack_top: usize,
    pub user_stack_pages: usize,
}

impl VmConfig {
    pub const fn new() -> Self {
        Self {
            hpt_factor: 2,
            tlb_seed: 0x5eed_7b1d,
            user_stack_top: 0x8000_0000,
            user_stack_pages: 16,
        }
    }

    pub fn validate(&self) -> Result<(), VmError> {
        if self.hpt_factor == 0
            || self.user_stack_pages == 0
            || self.user_stack_top % PAGE_SIZE != 0
            || self.user_stack_pages.saturating_mul(PAGE_SIZE) > self.user_stack_top
        {
            return Err(VmError::InvalidArgument);
        }
        Ok(())
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}
