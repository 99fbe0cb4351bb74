// SPDX-License-Identifier: MPL-2.0

//! Memory management.
//!
//! Physical frames live in an emulated RAM arena; page tables are real
//! two-level x86 structures stored inside that arena and manipulated
//! through the same primitives a bare-metal port would use.

pub mod context;
pub mod io;
pub mod kva;
pub mod page_fault;
pub mod page_table;
pub mod physical;

use crate::config::PAGE_SIZE;

use bitflags::bitflags;

/// A virtual address.
pub type Vaddr = usize;
/// A physical address.
pub type Paddr = usize;
/// An index into the physical frame table.
pub type FrameNumber = usize;

bitflags! {
    /// Access flags of a virtual memory region.
    pub struct RegionFlags: u32 {
        const READABLE      = 1 << 0;
        const WRITABLE      = 1 << 1;
        const EXECUTABLE    = 1 << 2;
        const CACHE_DISABLE = 1 << 3;
    }
}

pub const fn is_page_aligned(addr: usize) -> bool {
    addr % PAGE_SIZE == 0
}

pub(crate) fn init() {
    physical::init();
    context::init();
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::{Mutex, MutexGuard};

    static MM_TEST_LOCK: Mutex<()> = Mutex::new(());

    /// Serializes tests that touch the crate-wide memory and scheduler
    /// singletons, initializing the frame on first use.
    pub(crate) fn mm_lock() -> MutexGuard<'static, ()> {
        let guard = MM_TEST_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        crate::init();
        guard
    }
}
