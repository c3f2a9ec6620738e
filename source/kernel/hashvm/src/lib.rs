// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hashed-page-table virtual memory for a small teaching kernel
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module, proptests for the page table, tests/ for
//!                fault, fork, teardown and concurrent access
//! PUBLIC API: Vm, AddressSpace, FaultType, VmError, VmConfig, hal::{PhysWindow, Tlb, SoftTlb}
//! DEPENDS_ON: spin, bitflags, static_assertions, rand (SoftTlb), riscv (interrupt masking)
//! INVARIANTS: One page-table entry per live (address space, page); a frame is owned by
//!             exactly one entry or by the free list; regions are read-only outside
//!             load/fork/destroy

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

#[macro_use]
mod diag;

mod arch;
pub mod config;
pub mod error;
pub mod hal;
pub mod mm;
pub mod types;
pub mod vm;

pub use diag::log;

pub use config::VmConfig;
pub use error::VmError;
pub use mm::address_space::AddressSpace;
pub use mm::region::{Region, RegionFlags};
pub use types::{AsId, PhysAddr, VirtAddr};
pub use vm::fault::FaultType;
pub use vm::Vm;
