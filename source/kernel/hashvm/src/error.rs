// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Errors reported by the VM layer to the trap and process layers.

use core::fmt;

/// POSIX error numbers used when reporting to the trap layer.
pub mod errno {
    pub const ENOMEM: i32 = 12;
    pub const EFAULT: i32 = 14;
    pub const EINVAL: i32 = 22;
}

/// Error returned by fault handling and address-space operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmError {
    /// No free frame or no free page-table slot.
    OutOfMemory,
    /// Write through a read-only translation, or an address outside every region.
    ProtectionViolation,
    /// Unrecognised fault kind or malformed request.
    InvalidArgument,
}

impl VmError {
    /// Returns the errno the trap layer hands back to the faulting process.
    pub const fn errno(self) -> i32 {
        match self {
            VmError::OutOfMemory => errno::ENOMEM,
            VmError::ProtectionViolation => errno::EFAULT,
            VmError::InvalidArgument => errno::EINVAL,
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            VmError::OutOfMemory => "out of memory",
            VmError::ProtectionViolation => "protection violation",
            VmError::InvalidArgument => "invalid argument",
        };
        f.write_str(msg)
    }
}
