// SPDX-License-Identifier: MPL-2.0

#![allow(unused)]

use log::Level;

pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_SIZE_BITS: usize = 0xc;

/// Entries per page directory or page table.
pub const ENTRY_COUNT: usize = 1024;

/// Size of the emulated physical memory, in frames (32 MiB).
pub const RAM_PAGES: usize = 0x2000;

/// First frame above the DMA zone (16 MiB).
pub const ZONE_DMA_LIMIT: usize = 0x1000;
/// First frame above the kernel zone (24 MiB); the rest is high memory.
pub const ZONE_KERNEL_LIMIT: usize = 0x1800;

/// Start of the kernel half of every address space.
pub const KERNEL_BASE: usize = 0xC000_0000;

/// End of the fixed kernel mappings; the kernel virtual arena follows.
pub const KFIXED_MAX: usize = 0xF000_0000;

/// Kernel virtual arena: `KVA_PAGES` pages starting at `KVA_BASE`.
pub const KVA_BASE: usize = KFIXED_MAX;
pub const KVA_PAGES: usize = 0xFFFC;

/// Scratch page used for copies through a temporary kernel mapping.
pub const SCRATCH_VADDR: usize = 0xFFFF_C000;

/// Kernel stacks are a single page.
pub const KERNEL_STACK_SIZE: usize = PAGE_SIZE;

/// Timer ticks a thread may run before it is requeued.
pub const INITIAL_QUANTUM: u32 = 20;

/// FPU switches after which a task is promoted from lazy to eager swap.
pub const FPU_EAGER_THRESHOLD: u8 = 5;

pub const DEFAULT_LOG_LEVEL: Level = Level::Warn;

const_assert!(ZONE_DMA_LIMIT <= ZONE_KERNEL_LIMIT);
const_assert!(ZONE_KERNEL_LIMIT <= RAM_PAGES);
const_assert!(KVA_BASE + KVA_PAGES * PAGE_SIZE <= SCRATCH_VADDR);
