// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use corvus_frame::mm::io::{VmReader, VmWriter};

use super::bcache::BlockCache;
use super::mode::FileMode;
use super::vfs::InodeNum;
use crate::prelude::*;

/// The operations a device driver provides.
pub trait DeviceOps: Send + Sync {
    fn open(&self, _device: &Device) -> Result<()> {
        Ok(())
    }

    fn close(&self, _device: &Device) -> Result<()> {
        Ok(())
    }

    fn read(&self, _device: &Device, _offset: u64, _writer: &mut VmWriter) -> Result<usize> {
        return_errno!(Errno::ENOSYS)
    }

    fn write(&self, _device: &Device, _offset: u64, _reader: &mut VmReader) -> Result<usize> {
        return_errno!(Errno::ENOSYS)
    }

    fn ioctl(&self, _device: &Device, _request: u32, _arg: usize) -> Result<i32> {
        return_errno!(Errno::ENOTTY)
    }
}

/// A registered device.
pub struct Device {
    name: String,
    mode: FileMode,
    uid: u32,
    gid: u32,
    ops: Arc<dyn DeviceOps>,
    block_cache: Option<BlockCache>,
    /// Devfs inode (slot + 1); zero while unregistered.
    devfs_inode: AtomicU32,
    mounted: AtomicBool,
}

impl Device {
    /// A device without a block cache (character devices).
    pub fn new(name: &str, mode: FileMode, ops: Arc<dyn DeviceOps>) -> Arc<Device> {
        Arc::new(Device {
            name: name.to_string(),
            mode,
            uid: 0,
            gid: 0,
            ops,
            block_cache: None,
            devfs_inode: AtomicU32::new(0),
            mounted: AtomicBool::new(false),
        })
    }

    /// A block device whose reads and writes go through a block cache.
    pub fn new_with_cache(
        name: &str,
        mode: FileMode,
        ops: Arc<dyn DeviceOps>,
        block_size: usize,
    ) -> Result<Arc<Device>> {
        Ok(Arc::new(Device {
            name: name.to_string(),
            mode,
            uid: 0,
            gid: 0,
            ops,
            block_cache: Some(BlockCache::new(block_size)?),
            devfs_inode: AtomicU32::new(0),
            mounted: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn ops(&self) -> &Arc<dyn DeviceOps> {
        &self.ops
    }

    pub fn block_cache(&self) -> Option<&BlockCache> {
        self.block_cache.as_ref()
    }

    pub fn devfs_inode(&self) -> InodeNum {
        self.devfs_inode.load(Ordering::Relaxed)
    }

    pub(crate) fn set_devfs_inode(&self, inode: InodeNum) {
        self.devfs_inode.store(inode, Ordering::Relaxed);
    }

    /// Claims the device for a mount; a device backs at most one.
    pub(crate) fn claim_for_mount(&self) -> bool {
        !self.mounted.swap(true, Ordering::Relaxed)
    }

    pub(crate) fn release_from_mount(&self) {
        self.mounted.store(false, Ordering::Relaxed);
    }
}
