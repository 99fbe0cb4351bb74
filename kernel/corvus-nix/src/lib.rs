// SPDX-License-Identifier: MPL-2.0

//! The POSIX-like service layer of Corvus.
//!
//! Built on `corvus-frame`, this crate implements processes and threads,
//! signals, the virtual filesystem (path resolution, mounts, devfs), the
//! block cache, I/O contexts and the kernel module loader.

#![cfg_attr(not(test), no_std)]
#![allow(dead_code)]

extern crate alloc;

pub mod error;
pub mod fs;
pub mod loader;
pub mod prelude;
pub mod process;
pub mod time;
pub mod vm;

use spin::Once;

static INIT: Once<()> = Once::new();

/// Initializes the service layer in its fixed bring-up order: the frame,
/// the process table with the kernel process and the idle and reaper
/// threads, the signal hook, the filesystem registry and devfs.
///
/// Idempotent so that tests may call it freely.
pub fn init() {
    corvus_frame::init();
    INIT.call_once(|| {
        process::init();
        fs::init();
    });
}
