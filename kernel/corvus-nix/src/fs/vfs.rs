// SPDX-License-Identifier: MPL-2.0

//! Filesystem instances, the type registry and the mount graph.

use core::sync::atomic::{AtomicUsize, Ordering};

use corvus_frame::mm::io::{VmReader, VmWriter};
use corvus_util::HashTable;

use super::device::Device;
use super::file::FileDescription;
use super::mode::FileMode;
use crate::prelude::*;

/// An inode number, scoped to one filesystem.
pub type InodeNum = u32;

bitflags! {
    pub struct MountFlags: u32 {
        const RDONLY = 1;
    }
}

/// A filesystem-scoped identity for a file-like object.
pub struct INode {
    pub fs: Arc<Filesystem>,
    pub number: InodeNum,
    pub mode: FileMode,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub ops: Arc<dyn FileOps>,
}

impl core::fmt::Debug for INode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("INode")
            .field("number", &self.number)
            .field("mode", &self.mode)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("size", &self.size)
            .finish()
    }
}

/// The operations a filesystem implementation provides.
pub trait FilesystemOps: Any + Send + Sync {
    /// Fills in an inode's metadata and file-operations table.
    fn read_inode(&self, fs: &Arc<Filesystem>, number: InodeNum) -> Result<INode>;

    /// Looks `name` up in the directory `parent`.
    fn find_inode(&self, fs: &Arc<Filesystem>, parent: &INode, name: &str) -> Result<InodeNum>;

    /// Creates a regular file named `name` in the directory `parent`.
    fn create(
        &self,
        _fs: &Arc<Filesystem>,
        _parent: &INode,
        _name: &str,
        _mode: FileMode,
    ) -> Result<InodeNum> {
        return_errno!(Errno::ENOSYS)
    }
}

impl dyn FilesystemOps {
    pub fn downcast_ref<T: FilesystemOps>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref::<T>()
    }
}

/// Receives directory entries during a `readdir`.
pub trait DirentVisitor {
    fn visit(&mut self, inode: InodeNum, name: &str) -> Result<()>;
}

/// The operations an open file supports.
pub trait FileOps: Send + Sync {
    fn open(&self, _inode: &INode, _file: &FileDescription) -> Result<()> {
        Ok(())
    }

    fn close(&self, _file: &FileDescription) -> Result<()> {
        Ok(())
    }

    fn read(&self, _file: &FileDescription, _writer: &mut VmWriter) -> Result<usize> {
        return_errno!(Errno::ENOSYS)
    }

    fn write(&self, _file: &FileDescription, _reader: &mut VmReader) -> Result<usize> {
        return_errno!(Errno::ENOSYS)
    }

    fn ioctl(&self, _file: &FileDescription, _request: u32, _arg: usize) -> Result<i32> {
        return_errno!(Errno::ENOTTY)
    }

    fn truncate(&self, _file: &FileDescription, _size: u64) -> Result<()> {
        return_errno!(Errno::ENOSYS)
    }

    fn readdir(
        &self,
        _file: &FileDescription,
        _visitor: &mut dyn DirentVisitor,
        _count: usize,
    ) -> Result<usize> {
        return_errno!(Errno::ENOSYS)
    }
}

/// A mounted filesystem instance.
pub struct Filesystem {
    fstype: &'static str,
    ops: Arc<dyn FilesystemOps>,
    root_inode: InodeNum,
    flags: MountFlags,
    device: Option<Arc<Device>>,
    /// Inode number -> filesystem mounted on it.
    mounts: SpinLock<HashTable<Arc<Filesystem>>>,
    /// The (filesystem, inode) this instance is mounted on.
    parent: SpinLock<Option<(Weak<Filesystem>, InodeNum)>>,
    open_files: AtomicUsize,
}

impl core::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Filesystem")
            .field("fstype", &self.fstype)
            .field("root_inode", &self.root_inode)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Filesystem {
    pub fn fstype(&self) -> &'static str {
        self.fstype
    }

    pub fn root_inode(&self) -> InodeNum {
        self.root_inode
    }

    pub fn flags(&self) -> MountFlags {
        self.flags
    }

    pub fn device(&self) -> Option<&Arc<Device>> {
        self.device.as_ref()
    }

    pub fn ops(&self) -> &Arc<dyn FilesystemOps> {
        &self.ops
    }

    pub fn read_inode(self: &Arc<Self>, number: InodeNum) -> Result<INode> {
        self.ops.read_inode(self, number)
    }

    pub fn find_inode(self: &Arc<Self>, parent: &INode, name: &str) -> Result<InodeNum> {
        self.ops.find_inode(self, parent, name)
    }

    pub fn create(self: &Arc<Self>, parent: &INode, name: &str, mode: FileMode) -> Result<InodeNum> {
        self.ops.create(self, parent, name, mode)
    }

    /// The filesystem mounted on `inode`, if any.
    pub fn mount_on(&self, inode: InodeNum) -> Option<Arc<Filesystem>> {
        self.mounts.lock().find(&inode.to_le_bytes()).cloned()
    }

    /// The mount-point pair this filesystem hangs from.
    pub fn parent_pair(&self) -> Option<(Arc<Filesystem>, InodeNum)> {
        let parent = self.parent.lock();
        parent
            .as_ref()
            .and_then(|(fs, inode)| fs.upgrade().map(|fs| (fs, *inode)))
    }

    pub fn open_file_count(&self) -> usize {
        self.open_files.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_open_files(&self) {
        self.open_files.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_open_files(&self) {
        self.open_files.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A registerable filesystem type.
pub trait FsType: Send + Sync {
    fn name(&self) -> &'static str;

    /// Builds the per-instance state: the ops table and the root inode
    /// number.
    fn mount(&self, device: Option<&Arc<Device>>) -> Result<(Arc<dyn FilesystemOps>, InodeNum)>;
}

lazy_static! {
    static ref FS_TYPES: SpinLock<Vec<Arc<dyn FsType>>> = SpinLock::new(Vec::new());
    static ref ROOT_FS: SpinLock<Option<Arc<Filesystem>>> = SpinLock::new(None);
}

pub(crate) fn init() {
    lazy_static::initialize(&FS_TYPES);
    lazy_static::initialize(&ROOT_FS);
}

/// Registers a filesystem type. Duplicate names are rejected.
pub fn register_fs_type(fstype: Arc<dyn FsType>) -> Result<()> {
    let mut types = FS_TYPES.lock();
    if types.iter().any(|t| t.name() == fstype.name()) {
        return_errno_with_message!(Errno::EEXIST, "filesystem type already registered");
    }
    types.push(fstype);
    Ok(())
}

pub fn fs_type_with_name(name: &str) -> Option<Arc<dyn FsType>> {
    FS_TYPES.lock().iter().find(|t| t.name() == name).cloned()
}

/// The root filesystem.
pub fn root_fs() -> Option<Arc<Filesystem>> {
    ROOT_FS.lock().clone()
}

/// Mounts an instance of `type_name` onto `(fs, inode)`, or as the root
/// filesystem when `onto` is `None`.
///
/// At most one filesystem may be mounted on a given (filesystem, inode)
/// pair, and a device may back at most one mount.
pub fn mount(
    type_name: &str,
    device: Option<Arc<Device>>,
    onto: Option<(&Arc<Filesystem>, InodeNum)>,
    flags: MountFlags,
) -> Result<Arc<Filesystem>> {
    let fstype = fs_type_with_name(type_name)
        .ok_or_else(|| Error::with_message(Errno::ENODEV, "unknown filesystem type"))?;

    if let Some(device) = device.as_ref() {
        if !device.claim_for_mount() {
            return_errno_with_message!(Errno::EBUSY, "device is already mounted");
        }
    }

    let mounted = (|| -> Result<Arc<Filesystem>> {
        let (ops, root_inode) = fstype.mount(device.as_ref())?;
        let fs = Arc::new(Filesystem {
            fstype: fstype.name(),
            ops,
            root_inode,
            flags,
            device: device.clone(),
            mounts: SpinLock::new(HashTable::new()),
            parent: SpinLock::new(None),
            open_files: AtomicUsize::new(0),
        });

        match onto {
            Some((parent, inode)) => {
                if !parent.mounts.lock().insert(&inode.to_le_bytes(), fs.clone()) {
                    return_errno_with_message!(Errno::EBUSY, "mount point is in use");
                }
                *fs.parent.lock() = Some((Arc::downgrade(parent), inode));
            }
            None => {
                let mut root = ROOT_FS.lock();
                if root.is_some() {
                    return_errno_with_message!(Errno::EBUSY, "a root filesystem is mounted");
                }
                *root = Some(fs.clone());
            }
        }
        Ok(fs)
    })();

    if mounted.is_err() {
        if let Some(device) = device.as_ref() {
            device.release_from_mount();
        }
    }
    mounted
}

/// Unmounts a filesystem. Fails with `EBUSY` while other filesystems are
/// mounted within it or files on it remain open.
pub fn unmount(fs: &Arc<Filesystem>) -> Result<()> {
    if fs.mounts.lock().len() > 0 {
        return_errno_with_message!(Errno::EBUSY, "filesystem has dependent mounts");
    }
    if fs.open_file_count() > 0 {
        return_errno_with_message!(Errno::EBUSY, "filesystem has open files");
    }

    match fs.parent_pair() {
        Some((parent, inode)) => {
            parent.mounts.lock().remove(&inode.to_le_bytes());
            *fs.parent.lock() = None;
        }
        None => {
            let mut root = ROOT_FS.lock();
            let is_root = root
                .as_ref()
                .map(|mounted| Arc::ptr_eq(mounted, fs))
                .unwrap_or(false);
            if !is_root {
                return_errno!(Errno::EINVAL);
            }
            *root = None;
        }
    }

    if let Some(device) = fs.device.as_ref() {
        device.release_from_mount();
    }
    Ok(())
}
