// SPDX-License-Identifier: MPL-2.0

use super::vfs::{FileOps, Filesystem, InodeNum};
use crate::prelude::*;

bitflags! {
    pub struct OpenFlags: u32 {
        const RDONLY    = 1 << 0;
        const WRONLY    = 1 << 1;
        const CREATE    = 1 << 2;
        const TRUNCATE  = 1 << 3;
        const APPEND    = 1 << 4;
        const EXCLUSIVE = 1 << 5;
        const CLOEXEC   = 1 << 6;
        const DIRECTORY = 1 << 7;
    }
}

impl OpenFlags {
    pub const RDWR: OpenFlags = OpenFlags::from_bits_truncate(0b11);

    /// The subset that survives on an open file description.
    pub(crate) fn persistent(self) -> OpenFlags {
        self & (OpenFlags::RDWR | OpenFlags::APPEND | OpenFlags::DIRECTORY)
    }
}

/// An open file: the mutable state of an opened inode, independent of
/// any descriptor slot. Shared between descriptors via `Arc`.
pub struct FileDescription {
    fs: Arc<Filesystem>,
    inode: InodeNum,
    ops: Arc<dyn FileOps>,
    flags: SpinLock<OpenFlags>,
    offset: SpinLock<u64>,
}

impl core::fmt::Debug for FileDescription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileDescription")
            .field("inode", &self.inode)
            .field("flags", &self.flags)
            .field("offset", &self.offset)
            .finish()
    }
}

impl FileDescription {
    pub(crate) fn new(
        fs: Arc<Filesystem>,
        inode: InodeNum,
        ops: Arc<dyn FileOps>,
        flags: OpenFlags,
    ) -> Arc<Self> {
        fs.inc_open_files();
        Arc::new(Self {
            fs,
            inode,
            ops,
            flags: SpinLock::new(flags),
            offset: SpinLock::new(0),
        })
    }

    pub fn fs(&self) -> &Arc<Filesystem> {
        &self.fs
    }

    pub fn inode(&self) -> InodeNum {
        self.inode
    }

    pub fn ops(&self) -> &Arc<dyn FileOps> {
        &self.ops
    }

    pub fn flags(&self) -> OpenFlags {
        *self.flags.lock()
    }

    pub(crate) fn add_flags(&self, flags: OpenFlags) {
        *self.flags.lock() |= flags;
    }

    pub fn offset(&self) -> u64 {
        *self.offset.lock()
    }

    pub fn set_offset(&self, offset: u64) {
        *self.offset.lock() = offset;
    }

    pub(crate) fn advance_offset(&self, by: u64) {
        *self.offset.lock() += by;
    }
}

impl Drop for FileDescription {
    fn drop(&mut self) {
        self.fs.dec_open_files();
    }
}
