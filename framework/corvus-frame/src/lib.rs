// SPDX-License-Identifier: MPL-2.0

//! The framework part of Corvus.
//!
//! This crate owns the privileged core of the kernel: physical memory
//! and the page-table machinery, address-space contexts, the kernel
//! virtual allocator, the scheduler and task records, the FPU switch,
//! wait queues and spin locks, and the console/logging backend.
//!
//! The hardware surface (control registers, the TLB, the FPU register
//! file, RAM itself) is modeled in software so that the whole core can
//! be driven by hosted tests; see `mm` and `cpu` for the shadow state.

#![cfg_attr(not(test), no_std)]
#![allow(dead_code)]

extern crate alloc;
#[macro_use]
extern crate static_assertions;

pub mod config;
pub mod console;
pub mod cpu;
mod error;
pub mod logger;
pub mod mm;
pub mod prelude;
pub mod sync;
pub mod task;

pub use self::error::Error;
pub use self::prelude::Result;

use spin::Once;

static INIT: Once<()> = Once::new();

/// Initializes the frame in its fixed bring-up order: console/logger,
/// physical memory, the kernel address space, the kernel virtual
/// allocator, the processor (with its idle task) and the FPU.
///
/// Idempotent so that tests may call it freely.
pub fn init() {
    INIT.call_once(|| {
        logger::init();
        mm::init();
        task::init();
        cpu::fpu::init();
    });
}
