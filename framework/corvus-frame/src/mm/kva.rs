// SPDX-License-Identifier: MPL-2.0

//! The kernel virtual allocator.
//!
//! Manages a page-granular arena of kernel virtual space as a linear
//! allocation map with a first-page-of-run marker. Reserved-but-unmapped
//! pages are a legal intermediate state.

use alloc::vec;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use log::{error, warn};

use super::page_table;
use super::physical::{self, MemZone};
use super::Vaddr;
use crate::config::{KVA_BASE, KVA_PAGES, PAGE_SIZE};
use crate::error::Error;
use crate::prelude::Result;
use crate::sync::SpinLock;

#[derive(Debug, Clone, Copy, Default)]
struct PageInfo {
    allocated: bool,
    first_page: bool,
}

lazy_static! {
    static ref PAGES: SpinLock<Vec<PageInfo>> = SpinLock::new(vec![PageInfo::default(); KVA_PAGES]);
}

/// Reserves virtual space for at least `bytes` bytes without mapping
/// anything, returning the start address of the run.
pub fn reserve(bytes: usize) -> Result<Vaddr> {
    if bytes == 0 {
        error!("kva::reserve: request for 0 bytes");
        return Err(Error::InvalidArgs);
    }
    let pages = (bytes + PAGE_SIZE - 1) / PAGE_SIZE;

    let mut table = PAGES.lock();
    let mut run = 0;
    let mut first = 0;

    for i in 0..KVA_PAGES {
        if table[i].allocated {
            run = 0;
            continue;
        }
        if run == 0 {
            first = i;
        }
        run += 1;
        if run == pages {
            table[first].allocated = true;
            table[first].first_page = true;
            for page in &mut table[first + 1..=i] {
                page.allocated = true;
            }
            return Ok(KVA_BASE + first * PAGE_SIZE);
        }
    }

    error!("kva::reserve: out of kernel virtual memory");
    Err(Error::NoMemory)
}

/// Reserves virtual space and maps every page to a fresh physical frame.
pub fn alloc(bytes: usize) -> Result<Vaddr> {
    let base = reserve(bytes)?;
    let mut offset = 0;
    while offset < bytes {
        let frame = physical::alloc_contiguous(1, MemZone::High);
        physical::zero_frame(frame);
        page_table::map_kernel(base + offset, frame);
        offset += PAGE_SIZE;
    }
    Ok(base)
}

fn do_unreserve(addr: Vaddr, free_frames: bool) {
    if addr < KVA_BASE || addr >= KVA_BASE + KVA_PAGES * PAGE_SIZE {
        warn!("kva: attempt to release an address outside the arena");
        return;
    }
    let mut index = (addr - KVA_BASE) / PAGE_SIZE;

    let mut table = PAGES.lock();
    if !table[index].first_page {
        error!("kva: invalid pointer provided");
        return;
    }
    table[index].first_page = false;

    // Walk forward until the next run or an unallocated slot.
    while index < KVA_PAGES {
        if table[index].first_page || !table[index].allocated {
            break;
        }
        table[index].allocated = false;

        if free_frames {
            if let Some(frame) = page_table::unmap_kernel(KVA_BASE + index * PAGE_SIZE) {
                physical::free(frame, 1);
            }
        }
        index += 1;
    }
}

/// Releases a reservation made with [`reserve`]. Mappings, if any, are
/// left to the caller.
pub fn unreserve(addr: Vaddr) {
    do_unreserve(addr, false);
}

/// Releases an allocation made with [`alloc`], unmapping and freeing the
/// physical frames backing it.
pub fn free(addr: Vaddr) {
    do_unreserve(addr, true);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mm::test_util::mm_lock;

    #[test]
    fn reserve_returns_distinct_runs() {
        let _guard = mm_lock();
        let a = reserve(3 * PAGE_SIZE).unwrap();
        let b = reserve(PAGE_SIZE).unwrap();
        assert!(b >= a + 3 * PAGE_SIZE || b + PAGE_SIZE <= a);
        unreserve(a);
        unreserve(b);
    }

    #[test]
    fn rounds_up_to_pages() {
        let _guard = mm_lock();
        let a = reserve(1).unwrap();
        let b = reserve(1).unwrap();
        assert_ne!(a, b);
        unreserve(a);
        unreserve(b);
    }

    #[test]
    fn alloc_maps_and_free_releases() {
        let _guard = mm_lock();
        let free_before = physical::free_pages();
        let base = alloc(2 * PAGE_SIZE).unwrap();
        assert!(page_table::translate_kernel(base).is_some());
        assert!(page_table::translate_kernel(base + PAGE_SIZE).is_some());
        assert_eq!(physical::free_pages(), free_before - 2);

        free(base);
        assert!(page_table::translate_kernel(base).is_none());
        assert_eq!(physical::free_pages(), free_before);
    }

    #[test]
    fn freed_space_is_reusable() {
        let _guard = mm_lock();
        let a = reserve(PAGE_SIZE).unwrap();
        unreserve(a);
        let b = reserve(PAGE_SIZE).unwrap();
        assert_eq!(a, b);
        unreserve(b);
    }

    #[test]
    fn zero_byte_reserve_is_rejected() {
        let _guard = mm_lock();
        assert!(reserve(0).is_err());
    }
}
