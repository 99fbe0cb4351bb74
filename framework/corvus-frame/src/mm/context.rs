// SPDX-License-Identifier: MPL-2.0

//! Address-space contexts and regions.
//!
//! A context is a page-directory frame plus an ordered list of regions.
//! The kernel half of every directory is shared by entry-wise copy from
//! the kernel directory. Contexts are reference counted through `Arc`;
//! dropping the last reference tears down the user mappings, the page
//! tables and the directory itself.

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use lazy_static::lazy_static;
use log::error;

use super::page_table::{self, PageTableEntry, PteFlags};
use super::physical::{self, MemZone};
use super::{is_page_aligned, FrameNumber, Paddr, RegionFlags, Vaddr};
use crate::config::{ENTRY_COUNT, KERNEL_BASE, PAGE_SIZE};
use crate::error::Error;
use crate::prelude::Result;
use crate::sync::SpinLock;

/// Index of the first kernel-half directory entry.
const KERNEL_DIR_START: usize = KERNEL_BASE >> 22;

/// A contiguous virtual range with uniform access flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    start: Vaddr,
    length: usize,
    flags: RegionFlags,
}

impl Region {
    pub fn start(&self) -> Vaddr {
        self.start
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn end(&self) -> Vaddr {
        self.start + self.length
    }

    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    pub fn contains(&self, vaddr: Vaddr) -> bool {
        vaddr >= self.start && vaddr < self.end()
    }
}

struct ContextInner {
    dir: FrameNumber,
    regions: BTreeMap<Vaddr, Region>,
}

/// An address space.
pub struct MemContext {
    inner: SpinLock<ContextInner>,
    is_kernel: bool,
}

lazy_static! {
    static ref KERNEL_CONTEXT: Arc<MemContext> = Arc::new(MemContext {
        inner: SpinLock::new(ContextInner {
            dir: page_table::kernel_dir(),
            regions: BTreeMap::new(),
        }),
        is_kernel: true,
    });
    static ref CURRENT: SpinLock<Arc<MemContext>> = SpinLock::new(KERNEL_CONTEXT.clone());
}

/// Shadow of the page-directory-base register.
static CR3: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn init() {
    page_table::init_kernel_dir();
    lazy_static::initialize(&KERNEL_CONTEXT);
    lazy_static::initialize(&CURRENT);
    CR3.store(KERNEL_CONTEXT.dir() * PAGE_SIZE, Ordering::Relaxed);
}

/// The physical address currently loaded in the page-directory-base
/// register shadow.
pub fn cr3() -> Paddr {
    CR3.load(Ordering::Relaxed)
}

impl MemContext {
    /// The kernel context singleton. It is a privileged sentinel:
    /// only `switch_to` and reference management accept it.
    pub fn kernel() -> Arc<MemContext> {
        KERNEL_CONTEXT.clone()
    }

    /// The context currently installed on the processor.
    pub fn current() -> Arc<MemContext> {
        CURRENT.lock().clone()
    }

    /// Creates a blank context: an empty user half and the kernel half
    /// shared from the kernel directory.
    pub fn new_blank() -> Arc<MemContext> {
        let dir = physical::alloc_zeroed(MemZone::Kernel);
        copy_kernel_half(dir);
        Arc::new(MemContext {
            inner: SpinLock::new(ContextInner {
                dir,
                regions: BTreeMap::new(),
            }),
            is_kernel: false,
        })
    }

    /// Clones the current context copy-on-write.
    ///
    /// Every mapped user page loses its writable bit in both the parent
    /// and the clone, and gains one physical reference. Region records
    /// are deep copied.
    pub fn clone_current() -> Arc<MemContext> {
        let parent = Self::current();
        debug_assert!(!parent.is_kernel, "cannot clone the kernel context");

        let parent_inner = parent.inner.lock();
        let dir = physical::alloc_zeroed(MemZone::Kernel);
        copy_kernel_half(dir);

        for dir_idx in 0..KERNEL_DIR_START {
            let pde = page_table::read_entry(parent_inner.dir, dir_idx);
            if !pde.is_present() {
                continue;
            }
            let table = pde.frame();

            // Share every mapped page read-only and bump its refcount.
            for table_idx in 0..ENTRY_COUNT {
                let pte = page_table::read_entry(table, table_idx);
                if pte.is_present() {
                    physical::add_ref(pte.frame(), 1);
                    let demoted = PageTableEntry::new(
                        pte.frame(),
                        pte.flags() - PteFlags::WRITABLE,
                    );
                    page_table::write_entry(table, table_idx, demoted);
                }
            }

            // Duplicate the page table for the clone.
            let new_table = physical::alloc_contiguous(1, MemZone::Kernel);
            physical::copy_frame(new_table, table);
            physical::write_word(
                dir,
                dir_idx,
                PageTableEntry::new(new_table, pde.flags()).raw(),
            );
        }

        let regions = parent_inner.regions.clone();
        drop(parent_inner);

        // The parent's write permissions changed under it.
        page_table::tlb_flush_all();

        Arc::new(MemContext {
            inner: SpinLock::new(ContextInner { dir, regions }),
            is_kernel: false,
        })
    }

    /// Installs this context on the processor.
    pub fn switch_to(self: &Arc<Self>) {
        let dir = self.inner.lock().dir;
        CR3.store(dir * PAGE_SIZE, Ordering::Relaxed);
        *CURRENT.lock() = self.clone();
    }

    pub fn is_kernel(&self) -> bool {
        self.is_kernel
    }

    pub(crate) fn dir(&self) -> FrameNumber {
        self.inner.lock().dir
    }

    /// Creates a region. No pages are mapped until a fault arrives.
    pub fn create_region(&self, start: Vaddr, length: usize, flags: RegionFlags) -> Result<Region> {
        if self.is_kernel {
            error!("create_region: not valid on the kernel context");
            return Err(Error::InvalidArgs);
        }
        if !is_page_aligned(start) || !is_page_aligned(length) {
            error!("create_region: start and length must be page aligned");
            return Err(Error::InvalidArgs);
        }
        if length == 0 {
            error!("create_region: length must be nonzero");
            return Err(Error::InvalidArgs);
        }
        let end = match start.checked_add(length) {
            Some(end) if start != 0 && end < KERNEL_BASE => end,
            _ => {
                error!("create_region: region outside valid range");
                return Err(Error::InvalidArgs);
            }
        };

        let region = Region {
            start,
            length,
            flags: flags & RegionFlags::all(),
        };

        let mut inner = self.inner.lock();
        if let Some((_, prev)) = inner.regions.range(..=start).next_back() {
            if prev.end() > start {
                error!("create_region: region overlaps with another region");
                return Err(Error::InvalidArgs);
            }
        }
        if let Some((_, next)) = inner.regions.range(start..).next() {
            if end > next.start {
                error!("create_region: region overlaps with another region");
                return Err(Error::InvalidArgs);
            }
        }

        inner.regions.insert(start, region);
        Ok(region)
    }

    /// Finds the region containing `vaddr`.
    pub fn find_region(&self, vaddr: Vaddr) -> Option<Region> {
        if self.is_kernel {
            error!("find_region: not valid on the kernel context");
            return None;
        }
        let inner = self.inner.lock();
        let (_, region) = inner.regions.range(..=vaddr).next_back()?;
        region.contains(vaddr).then(|| *region)
    }

    /// Resizes the region starting at `start`. Shrinking unmaps and
    /// releases every page beyond the new bounds; growing checks only
    /// the successor region.
    pub fn resize_region(&self, start: Vaddr, new_length: usize) -> Result<()> {
        if !is_page_aligned(new_length) {
            error!("resize_region: new length must be page aligned");
            return Err(Error::InvalidArgs);
        }

        let mut inner = self.inner.lock();
        let dir = inner.dir;
        let region = *inner.regions.get(&start).ok_or(Error::NotFound)?;

        if new_length < region.length {
            for page in (start + new_length..region.end()).step_by(PAGE_SIZE) {
                unmap_and_release(dir, page);
            }
        } else if new_length > region.length {
            let end = match start.checked_add(new_length) {
                Some(end) if end < KERNEL_BASE => end,
                _ => {
                    error!("resize_region: region outside valid range");
                    return Err(Error::InvalidArgs);
                }
            };
            if let Some((_, next)) = inner.regions.range(start + 1..).next() {
                if end > next.start {
                    error!("resize_region: region overlaps with another region");
                    return Err(Error::InvalidArgs);
                }
            }
        }

        inner.regions.get_mut(&start).unwrap().length = new_length;
        Ok(())
    }

    /// Deletes a region: resize to zero, then unlink.
    pub fn delete_region(&self, start: Vaddr) -> Result<()> {
        self.resize_region(start, 0)?;
        self.inner.lock().regions.remove(&start);
        Ok(())
    }

    /// Releases whole pages inside `[addr, addr + length)` of the region
    /// starting at `region_start`, without resizing the region. Partial
    /// pages at the edges are left mapped.
    pub fn free_region_pages(&self, region_start: Vaddr, addr: Vaddr, length: usize) -> Result<()> {
        use align_ext::AlignExt;

        let inner = self.inner.lock();
        let region = *inner.regions.get(&region_start).ok_or(Error::NotFound)?;
        if !region.contains(addr) {
            log::warn!("free_region_pages: range outside region limits");
            return Err(Error::InvalidArgs);
        }
        let dir = inner.dir;
        drop(inner);

        let first = addr.align_up(PAGE_SIZE);
        let last = (addr + length).min(region.end()).align_down(PAGE_SIZE);
        for page in (first..last).step_by(PAGE_SIZE) {
            unmap_and_release(dir, page);
        }
        Ok(())
    }

    /// Walks the page tables for `vaddr`, returning the mapped frame and
    /// whether the mapping is writable.
    pub fn translate(&self, vaddr: Vaddr) -> Option<(FrameNumber, bool)> {
        let dir = self.inner.lock().dir;
        let pte = page_table::translate(dir, vaddr)?;
        Some((pte.frame(), pte.flags().contains(PteFlags::WRITABLE)))
    }

    /// Number of regions, for diagnostics.
    pub fn region_count(&self) -> usize {
        self.inner.lock().regions.len()
    }

    /// Calls `f` on each region in ascending start order.
    pub fn for_each_region(&self, mut f: impl FnMut(&Region)) {
        let inner = self.inner.lock();
        for region in inner.regions.values() {
            f(region);
        }
    }
}

impl Drop for MemContext {
    fn drop(&mut self) {
        // The kernel context lives in a static and the current context is
        // pinned by the `CURRENT` reference, so a dropped context is
        // never installed.
        if self.is_kernel {
            return;
        }
        let inner = self.inner.lock();
        for dir_idx in 0..KERNEL_DIR_START {
            let pde = page_table::read_entry(inner.dir, dir_idx);
            if !pde.is_present() {
                continue;
            }
            let table = pde.frame();
            for table_idx in 0..ENTRY_COUNT {
                let pte = page_table::read_entry(table, table_idx);
                if pte.is_present() {
                    physical::delete_ref(pte.frame(), 1);
                }
            }
            physical::free(table, 1);
        }
        physical::free(inner.dir, 1);
    }
}

/// Unmaps one user page and drops the frame reference it held.
pub(crate) fn unmap_and_release(dir: FrameNumber, vaddr: Vaddr) {
    if let Some(frame) = page_table::unmap_user(dir, vaddr) {
        physical::delete_ref(frame, 1);
    }
}

fn copy_kernel_half(dir: FrameNumber) {
    let kernel_dir = page_table::kernel_dir();
    for dir_idx in KERNEL_DIR_START..ENTRY_COUNT {
        let pde = page_table::read_entry(kernel_dir, dir_idx);
        physical::write_word(dir, dir_idx, pde.raw());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mm::test_util::mm_lock;

    #[test]
    fn blank_context_shares_kernel_half() {
        let _guard = mm_lock();
        let ctx = MemContext::new_blank();
        let dir = ctx.dir();
        let kernel_dir = page_table::kernel_dir();
        for dir_idx in KERNEL_DIR_START..ENTRY_COUNT {
            assert_eq!(
                page_table::read_entry(dir, dir_idx),
                page_table::read_entry(kernel_dir, dir_idx),
            );
        }
        for dir_idx in 0..KERNEL_DIR_START {
            assert!(!page_table::read_entry(dir, dir_idx).is_present());
        }
    }

    #[test]
    fn create_region_rejects_bad_ranges() {
        let _guard = mm_lock();
        let ctx = MemContext::new_blank();
        assert!(ctx.create_region(0x1001, 0x1000, RegionFlags::READABLE).is_err());
        assert!(ctx.create_region(0x1000, 0x123, RegionFlags::READABLE).is_err());
        assert!(ctx.create_region(0x1000, 0, RegionFlags::READABLE).is_err());
        assert!(ctx.create_region(0, 0x1000, RegionFlags::READABLE).is_err());
        // Must stay strictly below the kernel half.
        assert!(ctx
            .create_region(KERNEL_BASE - 0x1000, 0x1000, RegionFlags::READABLE)
            .is_err());
        assert!(MemContext::kernel()
            .create_region(0x1000, 0x1000, RegionFlags::READABLE)
            .is_err());
    }

    #[test]
    fn regions_never_overlap() {
        let _guard = mm_lock();
        let ctx = MemContext::new_blank();
        ctx.create_region(0x10000, 0x3000, RegionFlags::READABLE).unwrap();
        ctx.create_region(0x20000, 0x1000, RegionFlags::READABLE).unwrap();

        assert!(ctx.create_region(0x11000, 0x1000, RegionFlags::READABLE).is_err());
        assert!(ctx.create_region(0xF000, 0x2000, RegionFlags::READABLE).is_err());
        assert!(ctx.create_region(0x1F000, 0x2000, RegionFlags::READABLE).is_err());
        // Snug fit between the two is fine.
        ctx.create_region(0x13000, 0xD000, RegionFlags::READABLE).unwrap();

        let mut last_end = 0;
        ctx.for_each_region(|region| {
            assert!(region.start() >= last_end);
            last_end = region.end();
        });
    }

    #[test]
    fn find_region_locates_containing_range() {
        let _guard = mm_lock();
        let ctx = MemContext::new_blank();
        ctx.create_region(0x40000, 0x2000, RegionFlags::READABLE | RegionFlags::WRITABLE)
            .unwrap();
        assert_eq!(ctx.find_region(0x40000).unwrap().start(), 0x40000);
        assert_eq!(ctx.find_region(0x41FFF).unwrap().start(), 0x40000);
        assert!(ctx.find_region(0x42000).is_none());
        assert!(ctx.find_region(0x3FFFF).is_none());
    }

    #[test]
    fn resize_grow_checks_successor() {
        let _guard = mm_lock();
        let ctx = MemContext::new_blank();
        ctx.create_region(0x50000, 0x1000, RegionFlags::READABLE).unwrap();
        ctx.create_region(0x53000, 0x1000, RegionFlags::READABLE).unwrap();

        assert!(ctx.resize_region(0x50000, 0x4000).is_err());
        ctx.resize_region(0x50000, 0x3000).unwrap();
        assert_eq!(ctx.find_region(0x52000).unwrap().length(), 0x3000);
    }

    #[test]
    fn delete_region_releases_pages() {
        let _guard = mm_lock();
        let ctx = MemContext::new_blank();
        ctx.create_region(0x60000, 0x2000, RegionFlags::READABLE | RegionFlags::WRITABLE)
            .unwrap();

        // Hand-map a page the way the fault handler would.
        let frame = physical::alloc_contiguous(1, MemZone::High);
        page_table::map_user(
            ctx.dir(),
            0x60000,
            frame,
            RegionFlags::READABLE | RegionFlags::WRITABLE,
        );

        ctx.delete_region(0x60000).unwrap();
        assert_eq!(physical::ref_count(frame), 0);
        assert!(ctx.find_region(0x60000).is_none());
    }

    #[test]
    fn drop_releases_everything() {
        let _guard = mm_lock();
        let free_before = physical::free_pages();
        {
            let ctx = MemContext::new_blank();
            ctx.create_region(0x70000, 0x1000, RegionFlags::READABLE | RegionFlags::WRITABLE)
                .unwrap();
            let frame = physical::alloc_contiguous(1, MemZone::High);
            page_table::map_user(
                ctx.dir(),
                0x70000,
                frame,
                RegionFlags::READABLE | RegionFlags::WRITABLE,
            );
        }
        assert_eq!(physical::free_pages(), free_before);
    }
}
