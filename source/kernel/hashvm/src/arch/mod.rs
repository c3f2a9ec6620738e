// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Architecture hooks needed by the VM layer.

/// Runs `f` with interrupts masked on the current hart, restoring the prior state.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[inline]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    use riscv::register::sstatus;

    let was_enabled = sstatus::read().sie();
    // SAFETY: only toggles SIE on this hart; restored below.
    unsafe { sstatus::clear_sie() };
    let result = f();
    if was_enabled {
        // SAFETY: interrupts were enabled on entry.
        unsafe { sstatus::set_sie() };
    }
    result
}

/// Hosted builds have no interrupts to mask.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
#[inline]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    f()
}
