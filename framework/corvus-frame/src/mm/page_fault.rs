// SPDX-License-Identifier: MPL-2.0

//! The page-fault handler: demand paging and copy-on-write.

use bitflags::bitflags;

use super::context::MemContext;
use super::page_table::{self, PageTableEntry, PteFlags};
use super::physical::{self, MemZone};
use super::{RegionFlags, Vaddr};
use crate::config::{PAGE_SIZE, SCRATCH_VADDR};
use crate::error::Error;
use crate::prelude::Result;

bitflags! {
    /// The hardware error code pushed by a page fault.
    pub struct PageFaultCode: u32 {
        /// Set for protection violations, unset for non-present pages.
        const PRESENT    = 1 << 0;
        /// Set when the access was a write.
        const WRITE      = 1 << 1;
        /// Set when the fault originated in user mode.
        const USER       = 1 << 2;
        /// Set when reserved page-table bits were observed.
        const RESERVED   = 1 << 3;
        /// Set when the fault was caused by an instruction fetch.
        const INSN_FETCH = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    pub addr: Vaddr,
    pub code: PageFaultCode,
}

/// Handles a page fault against the current context.
///
/// Returns `Err(Error::PageFault)` for an unhandled user-mode fault (the
/// kernel layer above turns it into a signal). Unhandled kernel-mode
/// faults and reserved-bit faults are fatal.
pub fn handle_page_fault(info: &PageFaultInfo) -> Result<()> {
    if info.code.contains(PageFaultCode::RESERVED) {
        panic!("page fault: reserved bits set in a page table");
    }

    let ctx = MemContext::current();
    let region = if ctx.is_kernel() {
        None
    } else {
        ctx.find_region(info.addr)
    };

    if let Some(region) = region {
        let page = info.addr & !(PAGE_SIZE - 1);
        let dir = ctx.dir();

        if info.code.contains(PageFaultCode::PRESENT) {
            // Protection violation: a write to a read-only page of a
            // writable region is a copy-on-write page.
            if info.code.contains(PageFaultCode::WRITE)
                && region.flags().contains(RegionFlags::WRITABLE)
            {
                if let Some(pte) = page_table::translate(dir, page) {
                    if !pte.flags().contains(PteFlags::WRITABLE) {
                        break_cow(dir, page, pte);
                        return Ok(());
                    }
                }
            }
        } else {
            // Non-present page: demand paging.
            let frame = physical::alloc_contiguous(1, MemZone::High);
            page_table::map_user(dir, page, frame, region.flags());
            physical::zero_frame(frame);
            return Ok(());
        }
    }

    if info.code.contains(PageFaultCode::USER) {
        return Err(Error::PageFault);
    }

    if info.addr < 0x1000 {
        panic!("unable to handle kernel NULL pointer dereference");
    }
    panic!("unable to handle kernel page fault at {:#x}", info.addr);
}

/// Makes a shared page privately writable.
fn break_cow(dir: super::FrameNumber, page: Vaddr, pte: PageTableEntry) {
    let old_frame = pte.frame();

    let frame = if physical::ref_count(old_frame) > 1 {
        // Duplicate through the scratch window first.
        let new_frame = physical::alloc_contiguous(1, MemZone::High);
        assert!(page_table::map_kernel(SCRATCH_VADDR, new_frame));
        let dst = page_table::translate_kernel(SCRATCH_VADDR).unwrap().frame();
        physical::copy_frame(dst, old_frame);
        page_table::unmap_kernel(SCRATCH_VADDR);

        physical::delete_ref(old_frame, 1);
        new_frame
    } else {
        old_frame
    };

    let (dir_idx, table_idx) = ((page >> 22) & 0x3FF, (page >> 12) & 0x3FF);
    let table = page_table::read_entry(dir, dir_idx).frame();
    page_table::write_entry(
        table,
        table_idx,
        PageTableEntry::new(frame, pte.flags() | PteFlags::WRITABLE),
    );
    page_table::tlb_flush(page);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mm::test_util::mm_lock;

    fn write_fault(addr: Vaddr) -> PageFaultInfo {
        PageFaultInfo {
            addr,
            code: PageFaultCode::USER | PageFaultCode::WRITE,
        }
    }

    #[test]
    fn demand_paging_zero_fills() {
        let _guard = mm_lock();
        let ctx = MemContext::new_blank();
        ctx.switch_to();
        ctx.create_region(0x2000, 0x2000, RegionFlags::READABLE | RegionFlags::WRITABLE)
            .unwrap();

        handle_page_fault(&write_fault(0x3000)).unwrap();

        let pte = page_table::translate(ctx.dir(), 0x3000).unwrap();
        assert_eq!(physical::ref_count(pte.frame()), 1);
        let mut bytes = [0xFFu8; 16];
        physical::copy_from_frame(pte.frame(), 0, &mut bytes);
        assert_eq!(bytes, [0u8; 16]);

        MemContext::kernel().switch_to();
    }

    #[test]
    fn fault_outside_regions_is_unhandled() {
        let _guard = mm_lock();
        let ctx = MemContext::new_blank();
        ctx.switch_to();
        assert_eq!(
            handle_page_fault(&write_fault(0x9000)),
            Err(Error::PageFault)
        );
        MemContext::kernel().switch_to();
    }

    #[test]
    fn cow_with_single_ref_marks_writable() {
        let _guard = mm_lock();
        let ctx = MemContext::new_blank();
        ctx.switch_to();
        ctx.create_region(0x4000, 0x1000, RegionFlags::READABLE | RegionFlags::WRITABLE)
            .unwrap();

        // Map the page read-only, as a fork would leave it.
        let frame = physical::alloc_zeroed(MemZone::High);
        page_table::map_user(ctx.dir(), 0x4000, frame, RegionFlags::READABLE);

        handle_page_fault(&PageFaultInfo {
            addr: 0x4000,
            code: PageFaultCode::USER | PageFaultCode::WRITE | PageFaultCode::PRESENT,
        })
        .unwrap();

        let pte = page_table::translate(ctx.dir(), 0x4000).unwrap();
        assert_eq!(pte.frame(), frame);
        assert!(pte.flags().contains(PteFlags::WRITABLE));

        MemContext::kernel().switch_to();
    }

    #[test]
    fn cow_with_shared_frame_duplicates() {
        let _guard = mm_lock();
        let ctx = MemContext::new_blank();
        ctx.switch_to();
        ctx.create_region(0x5000, 0x1000, RegionFlags::READABLE | RegionFlags::WRITABLE)
            .unwrap();

        let shared = physical::alloc_zeroed(MemZone::High);
        physical::copy_into_frame(shared, 0, &[0xAA, 0xBB, 0xCC]);
        physical::add_ref(shared, 1); // someone else holds it too
        page_table::map_user(ctx.dir(), 0x5000, shared, RegionFlags::READABLE);

        handle_page_fault(&PageFaultInfo {
            addr: 0x5000,
            code: PageFaultCode::USER | PageFaultCode::WRITE | PageFaultCode::PRESENT,
        })
        .unwrap();

        let pte = page_table::translate(ctx.dir(), 0x5000).unwrap();
        assert_ne!(pte.frame(), shared);
        assert!(pte.flags().contains(PteFlags::WRITABLE));
        // The copy carries the pre-fault contents.
        let mut bytes = [0u8; 3];
        physical::copy_from_frame(pte.frame(), 0, &mut bytes);
        assert_eq!(bytes, [0xAA, 0xBB, 0xCC]);
        // The old frame lost the mapping's reference.
        assert_eq!(physical::ref_count(shared), 1);

        physical::delete_ref(shared, 1);
        MemContext::kernel().switch_to();
    }
}
