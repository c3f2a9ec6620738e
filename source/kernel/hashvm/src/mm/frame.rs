// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame allocator (boot bump path, then an embedded free list)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameAllocator::{new, with_boot, init, alloc_frames, free_frame, stats}
//! DEPENDS_ON: boot_alloc::{BootAllocator, StolenSlice}, spin::Mutex
//! INVARIANTS: A frame is either on the free list or in use, never both;
//!             frames below the pool start (kernel image, stolen tables) are never freed;
//!             all state changes happen under one allocator-wide lock

#[cfg(feature = "failpoints")]
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;
use static_assertions::const_assert_eq;

use super::boot_alloc::{BootAllocator, StolenSlice};
use super::PAGE_SIZE;
use crate::error::VmError;
use crate::hal::PhysWindow;
use crate::types::PhysAddr;

/// Terminates the free list.
const NIL: u32 = u32::MAX;

/// Per-frame bookkeeping stored in the stolen frame-table pages.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct FrameEntry {
    in_use: u32,
    /// Index of the next free frame; only meaningful while the frame is free.
    next_free: u32,
}

const_assert_eq!(core::mem::size_of::<FrameEntry>(), 8);

impl FrameEntry {
    const RESERVED: Self = Self {
        in_use: 1,
        next_free: NIL,
    };
}

struct FrameTable {
    entries: StolenSlice<FrameEntry>,
    head: u32,
    free: usize,
    /// Frames below this index belong to the kernel or to the boot tables.
    pool_start: usize,
}

enum Phase {
    Boot(BootAllocator),
    Ready(FrameTable),
}

/// Snapshot of frame usage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameStats {
    pub total: usize,
    pub free: usize,
    /// Frames permanently held by the kernel image and boot-time tables.
    pub reserved: usize,
}

/// Hands out and reclaims single physical frames.
pub struct FrameAllocator {
    phase: Mutex<Phase>,
    total: usize,
    #[cfg(feature = "failpoints")]
    fail_countdown: AtomicUsize,
}

impl FrameAllocator {
    /// Creates an allocator in boot mode, stealing from `[first_free, ram_size)`.
    pub const fn new(first_free: PhysAddr, ram_size: usize) -> Self {
        Self {
            phase: Mutex::new(Phase::Boot(BootAllocator::new(first_free.raw(), ram_size))),
            total: ram_size / PAGE_SIZE,
            #[cfg(feature = "failpoints")]
            fail_countdown: AtomicUsize::new(0),
        }
    }

    /// Builds the frame table in stolen RAM and switches to free-list allocation.
    ///
    /// Everything the boot allocator has handed out so far, plus the table
    /// itself, stays reserved.
    pub fn init<P: PhysWindow + ?Sized>(&self, window: &P) -> Result<(), VmError> {
        let mut phase = self.phase.lock();
        let Phase::Boot(bump) = &mut *phase else {
            log_warn!(target: "frames", "frame table already initialised");
            return Err(VmError::InvalidArgument);
        };
        if self.total == 0 || self.total >= NIL as usize {
            return Err(VmError::InvalidArgument);
        }

        let mut entries = StolenSlice::steal(bump, window, self.total, FrameEntry::RESERVED)?;
        let pool_start = bump.cursor().frame().min(self.total);

        let mut free = 0;
        for index in pool_start..self.total {
            let next = if index + 1 < self.total {
                (index + 1) as u32
            } else {
                NIL
            };
            entries[index] = FrameEntry {
                in_use: 0,
                next_free: next,
            };
            free += 1;
        }
        let head = if pool_start < self.total {
            pool_start as u32
        } else {
            NIL
        };

        log_info!(
            target: "frames",
            "frame table at {:#x}: total={} reserved={} free={}",
            entries.base(),
            self.total,
            pool_start,
            free
        );
        *phase = Phase::Ready(FrameTable {
            entries,
            head,
            free,
            pool_start,
        });
        Ok(())
    }

    /// Runs `f` against the boot allocator so other boot-time tables can steal
    /// pages ahead of [`init`](Self::init).
    pub fn with_boot<R>(
        &self,
        f: impl FnOnce(&mut BootAllocator) -> Result<R, VmError>,
    ) -> Result<R, VmError> {
        match &mut *self.phase.lock() {
            Phase::Boot(bump) => f(bump),
            Phase::Ready(_) => Err(VmError::InvalidArgument),
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(*self.phase.lock(), Phase::Ready(_))
    }

    /// Allocates `count` frames.
    ///
    /// Before [`init`](Self::init) this steals contiguous pages from the boot
    /// allocator. Afterwards only single frames are supported; larger requests
    /// report `OutOfMemory`.
    pub fn alloc_frames(&self, count: usize) -> Result<PhysAddr, VmError> {
        if count == 0 {
            return Err(VmError::InvalidArgument);
        }
        let mut phase = self.phase.lock();
        match &mut *phase {
            Phase::Boot(bump) => bump.steal(count).ok_or(VmError::OutOfMemory),
            Phase::Ready(table) => {
                if count != 1 {
                    log_debug!(target: "frames", "multi-frame request ({}) after boot", count);
                    return Err(VmError::OutOfMemory);
                }
                #[cfg(feature = "failpoints")]
                if self.take_failpoint() {
                    return Err(VmError::OutOfMemory);
                }
                table.pop().ok_or_else(|| {
                    log_warn!(target: "frames", "out of frames");
                    VmError::OutOfMemory
                })
            }
        }
    }

    /// Returns a frame to the free list.
    ///
    /// Addresses outside the tracked range, reserved frames, and frames that
    /// are already free are ignored.
    pub fn free_frame(&self, pa: PhysAddr) {
        let mut phase = self.phase.lock();
        let Phase::Ready(table) = &mut *phase else {
            log_debug!(target: "frames", "free of {:#x} before frame table init", pa);
            return;
        };
        if !table.push(pa) {
            log_debug!(target: "frames", "ignored free of {:#x}", pa);
        }
    }

    pub fn stats(&self) -> FrameStats {
        match &*self.phase.lock() {
            Phase::Boot(bump) => {
                let stolen = bump.cursor().frame().min(self.total);
                FrameStats {
                    total: self.total,
                    free: self.total - stolen,
                    reserved: stolen,
                }
            }
            Phase::Ready(table) => FrameStats {
                total: self.total,
                free: table.free,
                reserved: table.pool_start,
            },
        }
    }

    /// Makes the `nth` next free-list allocation (1-based) fail with `OutOfMemory`.
    #[cfg(feature = "failpoints")]
    pub fn fail_after(&self, nth: usize) {
        self.fail_countdown.store(nth, Ordering::SeqCst);
    }

    #[cfg(feature = "failpoints")]
    fn take_failpoint(&self) -> bool {
        let previous = self
            .fail_countdown
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        matches!(previous, Ok(1))
    }
}

impl FrameTable {
    fn pop(&mut self) -> Option<PhysAddr> {
        if self.head == NIL {
            return None;
        }
        let index = self.head as usize;
        let entry = &mut self.entries[index];
        debug_assert_eq!(entry.in_use, 0);
        entry.in_use = 1;
        self.head = entry.next_free;
        entry.next_free = NIL;
        self.free -= 1;
        Some(PhysAddr::from_frame(index))
    }

    fn push(&mut self, pa: PhysAddr) -> bool {
        let index = pa.frame();
        if !pa.is_page_aligned() || index >= self.entries.len() || index < self.pool_start {
            return false;
        }
        let entry = &mut self.entries[index];
        if entry.in_use == 0 {
            return false;
        }
        entry.in_use = 0;
        entry.next_free = self.head;
        self.head = index as u32;
        self.free += 1;
        true
    }
}
