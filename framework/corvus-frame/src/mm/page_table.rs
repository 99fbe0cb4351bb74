// SPDX-License-Identifier: MPL-2.0

//! The two-level page-table manager.
//!
//! Directories and page tables are frames holding 1024 little-endian
//! 32-bit entries. Each user page table carries a 15-bit occupancy
//! counter packed into the OS-available bits of its first five entries;
//! when the counter drops to zero the table's backing frame is freed and
//! the directory entry cleared.

use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;
use log::warn;
use spin::Once;

use super::physical::{self, MemZone};
use super::{FrameNumber, RegionFlags, Vaddr};
use crate::config::{ENTRY_COUNT, KERNEL_BASE, PAGE_SIZE};

bitflags! {
    pub struct PteFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const GLOBAL        = 1 << 8;
    }
}

/// OS-available bits 9..12 of an entry.
const AVAIL_SHIFT: u32 = 9;
const AVAIL_MASK: u32 = 0x7 << AVAIL_SHIFT;

/// Entries whose available bits hold the occupancy counter digits.
const COUNTER_DIGITS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub fn new(frame: FrameNumber, flags: PteFlags) -> Self {
        Self(((frame as u32) << 12) | flags.bits())
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn frame(&self) -> FrameNumber {
        (self.0 >> 12) as FrameNumber
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }
}

fn entry_indices(vaddr: Vaddr) -> (usize, usize) {
    ((vaddr >> 22) & 0x3FF, (vaddr >> 12) & 0x3FF)
}

pub(crate) fn read_entry(table: FrameNumber, index: usize) -> PageTableEntry {
    PageTableEntry(physical::read_word(table, index))
}

/// Writes an entry, preserving the available bits already stored there
/// (they may be occupancy-counter digits).
pub(crate) fn write_entry(table: FrameNumber, index: usize, pte: PageTableEntry) {
    let old = physical::read_word(table, index);
    physical::write_word(table, index, (pte.0 & !AVAIL_MASK) | (old & AVAIL_MASK));
}

/// Reads the 15-bit occupancy counter of a page table.
pub(crate) fn occupancy(table: FrameNumber) -> u32 {
    let mut value = 0;
    for digit in (0..COUNTER_DIGITS).rev() {
        let raw = physical::read_word(table, digit);
        value = (value << 3) | ((raw & AVAIL_MASK) >> AVAIL_SHIFT);
    }
    value
}

fn set_occupancy(table: FrameNumber, mut value: u32) {
    for digit in 0..COUNTER_DIGITS {
        let raw = physical::read_word(table, digit);
        let bits = (value & 0x7) << AVAIL_SHIFT;
        physical::write_word(table, digit, (raw & !AVAIL_MASK) | bits);
        value >>= 3;
    }
}

// TLB shadow: mapping changes count invalidations so that tests can
// assert the flush happened.
static TLB_FLUSHES: AtomicUsize = AtomicUsize::new(0);

pub fn tlb_flush(_vaddr: Vaddr) {
    TLB_FLUSHES.fetch_add(1, Ordering::Relaxed);
}

pub fn tlb_flush_all() {
    TLB_FLUSHES.fetch_add(1, Ordering::Relaxed);
}

pub fn tlb_flush_count() -> usize {
    TLB_FLUSHES.load(Ordering::Relaxed)
}

/// Maps a user page, allocating the page table on demand.
///
/// Requests carrying no access flags are ignored. Overwriting an
/// existing mapping is permitted but logged, and does not double-count
/// table occupancy.
pub(crate) fn map_user(dir: FrameNumber, vaddr: Vaddr, frame: FrameNumber, flags: RegionFlags) {
    if !flags.intersects(RegionFlags::READABLE | RegionFlags::WRITABLE | RegionFlags::EXECUTABLE) {
        return;
    }
    if vaddr >= KERNEL_BASE {
        panic!("map_user: cannot map kernel pages");
    }

    let (dir_idx, table_idx) = entry_indices(vaddr);
    let mut pde = read_entry(dir, dir_idx);

    if !pde.is_present() {
        let table = physical::alloc_zeroed(MemZone::Kernel);
        pde = PageTableEntry::new(
            table,
            PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER,
        );
        write_entry(dir, dir_idx, pde);
    }
    let table = pde.frame();

    let old = read_entry(table, table_idx);
    if old.is_present() {
        warn!("map_user: overwriting mapping at {:#x}", vaddr);
    } else {
        set_occupancy(table, occupancy(table) + 1);
    }

    let mut pte_flags = PteFlags::PRESENT | PteFlags::USER;
    if flags.contains(RegionFlags::WRITABLE) {
        pte_flags |= PteFlags::WRITABLE;
    }
    if flags.contains(RegionFlags::CACHE_DISABLE) {
        pte_flags |= PteFlags::CACHE_DISABLE;
    }
    write_entry(table, table_idx, PageTableEntry::new(frame, pte_flags));
    tlb_flush(vaddr);
}

/// Unmaps a user page, returning the frame that was mapped so the caller
/// can manage its reference count. Frees the page table once its
/// occupancy counter reaches zero.
pub(crate) fn unmap_user(dir: FrameNumber, vaddr: Vaddr) -> Option<FrameNumber> {
    if vaddr >= KERNEL_BASE {
        panic!("unmap_user: cannot unmap kernel pages");
    }

    let (dir_idx, table_idx) = entry_indices(vaddr);
    let pde = read_entry(dir, dir_idx);
    if !pde.is_present() {
        return None;
    }
    let table = pde.frame();

    let pte = read_entry(table, table_idx);
    if !pte.is_present() {
        return None;
    }
    let frame = pte.frame();

    let count = occupancy(table) - 1;
    if count == 0 {
        // No mappings left in this table.
        physical::free(table, 1);
        physical::write_word(dir, dir_idx, 0);
    } else {
        set_occupancy(table, count);
        write_entry(table, table_idx, PageTableEntry(0));
    }

    tlb_flush(vaddr);
    Some(frame)
}

static KERNEL_DIR: Once<FrameNumber> = Once::new();

/// Creates the kernel page directory. All page tables of the kernel half
/// are allocated up front so that every address space can share them by
/// copying directory entries.
pub(crate) fn init_kernel_dir() -> FrameNumber {
    *KERNEL_DIR.call_once(|| {
        let dir = physical::alloc_zeroed(MemZone::Kernel);
        for dir_idx in (KERNEL_BASE >> 22)..ENTRY_COUNT {
            let table = physical::alloc_zeroed(MemZone::Kernel);
            write_entry(
                dir,
                dir_idx,
                PageTableEntry::new(table, PteFlags::PRESENT | PteFlags::WRITABLE),
            );
        }
        dir
    })
}

pub(crate) fn kernel_dir() -> FrameNumber {
    *KERNEL_DIR.get().expect("kernel page directory is not initialized")
}

/// Maps a page into the kernel half, visible to every address space.
pub(crate) fn map_kernel(vaddr: Vaddr, frame: FrameNumber) -> bool {
    let addr = vaddr & !(PAGE_SIZE - 1);
    if addr < KERNEL_BASE {
        return false;
    }

    let (dir_idx, table_idx) = entry_indices(addr);
    let table = read_entry(kernel_dir(), dir_idx).frame();

    let old = read_entry(table, table_idx);
    if old.is_present() {
        return false;
    }
    write_entry(
        table,
        table_idx,
        PageTableEntry::new(
            frame,
            PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::GLOBAL,
        ),
    );
    tlb_flush(addr);
    true
}

/// Unmaps a kernel page, returning the frame that was mapped.
pub(crate) fn unmap_kernel(vaddr: Vaddr) -> Option<FrameNumber> {
    let addr = vaddr & !(PAGE_SIZE - 1);
    if addr < KERNEL_BASE {
        return None;
    }

    let (dir_idx, table_idx) = entry_indices(addr);
    let table = read_entry(kernel_dir(), dir_idx).frame();

    let pte = read_entry(table, table_idx);
    if !pte.is_present() {
        return None;
    }
    write_entry(table, table_idx, PageTableEntry(0));
    tlb_flush(addr);
    Some(pte.frame())
}

/// Walks the tables under `dir` without side effects.
pub(crate) fn translate(dir: FrameNumber, vaddr: Vaddr) -> Option<PageTableEntry> {
    let (dir_idx, table_idx) = entry_indices(vaddr);
    let pde = read_entry(dir, dir_idx);
    if !pde.is_present() {
        return None;
    }
    let pte = read_entry(pde.frame(), table_idx);
    if !pte.is_present() {
        return None;
    }
    Some(pte)
}

/// Translates a kernel virtual address through the kernel directory.
pub(crate) fn translate_kernel(vaddr: Vaddr) -> Option<PageTableEntry> {
    translate(kernel_dir(), vaddr)
}
