// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel-wide VM instance used by the boot sequence and the trap layer.

use spin::Once;

use super::Vm;
use crate::config::VmConfig;
use crate::error::VmError;
use crate::hal::DirectMap;
use crate::mm::address_space::AddressSpace;
use crate::types::{PhysAddr, VirtAddr};

static VM: Once<Vm<DirectMap>> = Once::new();

/// Brings up the kernel's VM layer. Later calls return the existing instance.
///
/// # Panics
///
/// Panics if bootstrap fails; the kernel cannot run without its page table.
pub fn vm_bootstrap(
    window: DirectMap,
    first_free: PhysAddr,
    config: VmConfig,
) -> &'static Vm<DirectMap> {
    VM.call_once(|| match Vm::bootstrap(window, first_free, config) {
        Ok(vm) => vm,
        Err(err) => panic!("vm bootstrap failed: {}", err),
    })
}

/// The kernel VM, once bootstrapped.
pub fn vm() -> Option<&'static Vm<DirectMap>> {
    VM.get()
}

/// Trap-layer entry point for translation faults.
///
/// `VmError::errno` gives the code handed back to the faulting process.
pub fn vm_fault(code: u32, va: usize, current: Option<&AddressSpace>) -> Result<(), VmError> {
    match VM.get() {
        Some(vm) => vm.fault(code, VirtAddr::new(va), current),
        None => {
            log_error!(target: "fault", "fault at {:#x} before vm bootstrap", va);
            Err(VmError::ProtectionViolation)
        }
    }
}
