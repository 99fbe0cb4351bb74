// SPDX-License-Identifier: MPL-2.0

//! The virtual filesystem: path resolution, mounts, file descriptions,
//! I/O contexts, the block cache and devfs.

pub mod bcache;
pub mod device;
pub mod devfs;
pub mod file;
pub mod io_context;
pub mod lookup;
pub mod mode;
pub mod vfs;

pub(crate) fn init() {
    vfs::init();
    devfs::init();
}
