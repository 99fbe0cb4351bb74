// SPDX-License-Identifier: MPL-2.0

//! devfs: a singleton filesystem type exporting the registered devices.
//!
//! Devices register by name and receive a dense per-fs inode number;
//! inode 0 is the root directory. Block devices with an attached block
//! cache route their reads and writes through it, character devices go
//! straight to the driver.

use corvus_frame::mm::io::{VmReader, VmWriter};
use corvus_util::HashTable;

use super::device::Device;
use super::file::FileDescription;
use super::mode::FileMode;
use super::vfs::{
    self, DirentVisitor, FileOps, Filesystem, FilesystemOps, FsType, INode, InodeNum,
};
use crate::prelude::*;

/// Size of the device table.
pub const MAX_DEVICES: usize = 1024;

struct DevRegistry {
    slots: Vec<Option<Arc<Device>>>,
    /// Device name -> slot index.
    names: HashTable<usize>,
    next_free: usize,
}

lazy_static! {
    static ref DEVICES: SpinLock<DevRegistry> = SpinLock::new(DevRegistry {
        slots: vec![None; MAX_DEVICES],
        names: HashTable::new(),
        next_free: 0,
    });
}

pub(crate) fn init() {
    vfs::register_fs_type(Arc::new(DevFsType)).expect("devfs registers first");
}

/// Registers a device, assigning it the lowest free inode. Two devices
/// cannot share a name.
pub fn register(device: &Arc<Device>) -> Result<InodeNum> {
    let mut registry = DEVICES.lock();

    let mut slot = registry.next_free;
    while slot < MAX_DEVICES && registry.slots[slot].is_some() {
        slot += 1;
    }
    if slot == MAX_DEVICES {
        return_errno_with_message!(Errno::ENOSPC, "device table is full");
    }

    if !registry.names.insert(device.name().as_bytes(), slot) {
        return_errno_with_message!(Errno::EEXIST, "device name is taken");
    }
    registry.slots[slot] = Some(device.clone());
    registry.next_free = slot + 1;

    let inode = (slot + 1) as InodeNum;
    device.set_devfs_inode(inode);
    Ok(inode)
}

/// Unregisters a device.
pub fn unregister(device: &Arc<Device>) -> Result<()> {
    let mut registry = DEVICES.lock();

    let inode = device.devfs_inode() as usize;
    if inode == 0 || inode > MAX_DEVICES {
        return_errno!(Errno::ENOENT);
    }
    let slot = inode - 1;
    match registry.slots[slot].as_ref() {
        Some(registered) if Arc::ptr_eq(registered, device) => {}
        _ => return_errno!(Errno::ENOENT),
    }

    registry.names.remove(device.name().as_bytes());
    registry.slots[slot] = None;
    if slot < registry.next_free {
        registry.next_free = slot;
    }
    device.set_devfs_inode(0);
    Ok(())
}

fn device_by_inode(inode: InodeNum) -> Result<Arc<Device>> {
    let registry = DEVICES.lock();
    let number = inode as usize;
    if number == 0 || number > MAX_DEVICES {
        return_errno!(Errno::ENXIO);
    }
    registry.slots[number - 1]
        .clone()
        .ok_or_else(|| Error::with_message(Errno::ENXIO, "no such device"))
}

struct DevFsType;

impl FsType for DevFsType {
    fn name(&self) -> &'static str {
        "devfs"
    }

    fn mount(&self, _device: Option<&Arc<Device>>) -> Result<(Arc<dyn FilesystemOps>, InodeNum)> {
        Ok((Arc::new(DevFsOps), 0))
    }
}

struct DevFsOps;

impl FilesystemOps for DevFsOps {
    fn read_inode(&self, fs: &Arc<Filesystem>, number: InodeNum) -> Result<INode> {
        if number == 0 {
            return Ok(INode {
                fs: fs.clone(),
                number,
                mode: FileMode::from_type_and_perms(super::mode::InodeType::Directory, 0o555),
                uid: 0,
                gid: 0,
                size: 0,
                ops: Arc::new(DevRootOps),
            });
        }

        let device = device_by_inode(number)?;
        Ok(INode {
            fs: fs.clone(),
            number,
            mode: device.mode(),
            uid: device.uid(),
            gid: device.gid(),
            size: 0,
            ops: Arc::new(DevFileOps),
        })
    }

    fn find_inode(&self, _fs: &Arc<Filesystem>, parent: &INode, name: &str) -> Result<InodeNum> {
        // Only the root directory has children.
        if parent.number != 0 {
            return_errno!(Errno::ENOENT);
        }
        let registry = DEVICES.lock();
        match registry.names.find(name.as_bytes()) {
            Some(slot) => Ok((slot + 1) as InodeNum),
            None => return_errno!(Errno::ENOENT),
        }
    }
}

struct DevRootOps;

impl FileOps for DevRootOps {
    fn readdir(
        &self,
        file: &FileDescription,
        visitor: &mut dyn DirentVisitor,
        count: usize,
    ) -> Result<usize> {
        if file.inode() != 0 {
            return_errno!(Errno::ENOTDIR);
        }

        // Enumerate live devices in inode order, honoring the directory
        // offset stored in the file.
        let entries: Vec<(InodeNum, String)> = {
            let registry = DEVICES.lock();
            registry
                .slots
                .iter()
                .enumerate()
                .filter_map(|(slot, device)| {
                    device
                        .as_ref()
                        .map(|device| ((slot + 1) as InodeNum, device.name().to_string()))
                })
                .collect()
        };

        let mut read_so_far = 0;
        for (inode, name) in entries.into_iter().skip(file.offset() as usize) {
            if read_so_far >= count {
                break;
            }
            visitor.visit(inode, &name)?;
            read_so_far += 1;
        }

        file.advance_offset(read_so_far as u64);
        Ok(read_so_far)
    }
}

struct DevFileOps;

impl FileOps for DevFileOps {
    fn open(&self, inode: &INode, _file: &FileDescription) -> Result<()> {
        let device = device_by_inode(inode.number)?;
        let ops = device.ops().clone();
        ops.open(&device)
    }

    fn close(&self, file: &FileDescription) -> Result<()> {
        // A device that disappeared while open is not an error here.
        if let Ok(device) = device_by_inode(file.inode()) {
            let ops = device.ops().clone();
            ops.close(&device)?;
        }
        Ok(())
    }

    fn read(&self, file: &FileDescription, writer: &mut VmWriter) -> Result<usize> {
        let device = device_by_inode(file.inode())?;
        match device.block_cache() {
            Some(cache) if device.mode().is_block_device() => {
                cache.read_buffer(&device, file.offset(), writer.remaining(), writer)
            }
            _ => {
                let ops = device.ops().clone();
                ops.read(&device, file.offset(), writer)
            }
        }
    }

    fn write(&self, file: &FileDescription, reader: &mut VmReader) -> Result<usize> {
        let device = device_by_inode(file.inode())?;
        match device.block_cache() {
            Some(cache) if device.mode().is_block_device() => {
                cache.write_buffer(&device, file.offset(), reader.remaining(), reader)
            }
            _ => {
                let ops = device.ops().clone();
                ops.write(&device, file.offset(), reader)
            }
        }
    }

    fn ioctl(&self, file: &FileDescription, request: u32, arg: usize) -> Result<i32> {
        let device = device_by_inode(file.inode())?;
        let ops = device.ops().clone();
        ops.ioctl(&device, request, arg)
    }
}

#[cfg(test)]
pub(crate) fn reset_for_test() {
    let mut registry = DEVICES.lock();
    registry.slots = vec![None; MAX_DEVICES];
    registry.names = HashTable::new();
    registry.next_free = 0;
}
