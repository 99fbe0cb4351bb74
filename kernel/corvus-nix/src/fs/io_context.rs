// SPDX-License-Identifier: MPL-2.0

//! I/O contexts: the per-process table of open file descriptors plus the
//! current directory.

use corvus_frame::mm::io::{VmReader, VmWriter};

use super::file::{FileDescription, OpenFlags};
use super::vfs::{self, DirentVisitor, Filesystem, InodeNum};
use crate::prelude::*;

/// Size of the descriptor table.
pub const MAX_OPEN_FILES: usize = 1024;

/// Length of the name buffer in a directory entry record.
pub const DIRENT_NAME_BYTES: usize = 255;
/// Size of one serialized directory entry record.
pub const DIRENT_BYTES: usize = 4 + DIRENT_NAME_BYTES;

bitflags! {
    /// Per-descriptor flags, kept apart from the open file itself.
    pub struct FdFlags: u8 {
        /// Close this descriptor when the process execs.
        const CLOEXEC  = 1;
        /// Slot is reserved by an in-flight open.
        const RESERVED = 2;
    }
}

bitflags! {
    pub struct DupOptions: u32 {
        /// Use the first free slot at or above the requested one.
        const AT_LEAST    = 1;
        /// Duplicating a descriptor onto itself is a no-op.
        const IGNORE_SAME = 2;
        /// Set close-on-exec on the new descriptor.
        const CLOEXEC     = 4;
    }
}

struct IoContextInner {
    files: Vec<Option<Arc<FileDescription>>>,
    fd_flags: Vec<FdFlags>,
    next_free: usize,
    cwd: (Arc<Filesystem>, InodeNum),
}

/// The I/O context of a process.
pub struct IoContext {
    inner: Mutex<IoContextInner>,
}

impl IoContext {
    /// Creates a context whose current directory is the root
    /// filesystem's root.
    pub fn new() -> Result<Arc<IoContext>> {
        let root = vfs::root_fs()
            .ok_or_else(|| Error::with_message(Errno::ENOENT, "no root filesystem"))?;
        let root_inode = root.root_inode();
        Ok(Arc::new(IoContext {
            inner: Mutex::new(IoContextInner {
                files: vec![None; MAX_OPEN_FILES],
                fd_flags: vec![FdFlags::empty(); MAX_OPEN_FILES],
                next_free: 0,
                cwd: (root, root_inode),
            }),
        }))
    }

    /// Clones the context: all open files (sharing their offsets), the
    /// descriptor flags and the current directory.
    pub fn clone_context(&self) -> Arc<IoContext> {
        let inner = self.inner.lock();
        Arc::new(IoContext {
            inner: Mutex::new(IoContextInner {
                files: inner.files.clone(),
                fd_flags: inner.fd_flags.clone(),
                next_free: inner.next_free,
                cwd: inner.cwd.clone(),
            }),
        })
    }

    pub fn cwd(&self) -> (Arc<Filesystem>, InodeNum) {
        self.inner.lock().cwd.clone()
    }

    pub fn set_cwd(&self, fs: Arc<Filesystem>, inode: InodeNum) {
        self.inner.lock().cwd = (fs, inode);
    }

    /// Marks a descriptor reserved for an in-flight open. Fails when the
    /// slot is live or already reserved.
    pub(crate) fn reserve_fd(&self, fd: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        if fd >= MAX_OPEN_FILES
            || inner.files[fd].is_some()
            || inner.fd_flags[fd].contains(FdFlags::RESERVED)
        {
            return_errno!(Errno::EINVAL);
        }
        inner.fd_flags[fd] = FdFlags::RESERVED;
        Ok(())
    }

    pub(crate) fn unreserve_fd(&self, fd: usize) {
        let mut inner = self.inner.lock();
        inner.fd_flags[fd] = FdFlags::empty();
        if fd < inner.next_free {
            inner.next_free = fd;
        }
    }

    pub(crate) fn install_fd(&self, fd: usize, file: Arc<FileDescription>, cloexec: bool) {
        let mut inner = self.inner.lock();
        inner.files[fd] = Some(file);
        inner.fd_flags[fd] = if cloexec {
            FdFlags::CLOEXEC
        } else {
            FdFlags::empty()
        };
    }

    pub fn get_file(&self, fd: usize) -> Result<Arc<FileDescription>> {
        let inner = self.inner.lock();
        if fd >= MAX_OPEN_FILES {
            return_errno!(Errno::EBADF);
        }
        inner.files[fd]
            .clone()
            .ok_or_else(|| Error::with_message(Errno::EBADF, "fd is not open"))
    }

    pub fn fd_flags(&self, fd: usize) -> Result<FdFlags> {
        let inner = self.inner.lock();
        if fd >= MAX_OPEN_FILES {
            return_errno!(Errno::EBADF);
        }
        Ok(inner.fd_flags[fd])
    }

    /// The first free descriptor at or above `from`.
    pub fn find_next_descriptor(&self, from: usize) -> Option<usize> {
        let inner = self.inner.lock();
        let start = from.max(inner.next_free);
        (start..MAX_OPEN_FILES).find(|&fd| {
            inner.files[fd].is_none() && !inner.fd_flags[fd].contains(FdFlags::RESERVED)
        })
    }

    /// Closes a descriptor. The file itself is closed when the last
    /// descriptor referencing it goes away.
    pub fn close(&self, fd: usize) -> Result<()> {
        let file = {
            let mut inner = self.inner.lock();
            if fd >= MAX_OPEN_FILES {
                return_errno!(Errno::EBADF);
            }
            let file = inner.files[fd]
                .take()
                .ok_or_else(|| Error::with_message(Errno::EBADF, "fd is not open"))?;
            inner.fd_flags[fd] = FdFlags::empty();
            if fd < inner.next_free {
                inner.next_free = fd;
            }
            file
        };

        if Arc::strong_count(&file) == 1 {
            file.ops().clone().close(&file)?;
        }
        Ok(())
    }

    /// Closes every descriptor marked close-on-exec, discarding errors.
    pub fn close_on_exec(&self) {
        for fd in 0..MAX_OPEN_FILES {
            let close = {
                let inner = self.inner.lock();
                inner.files[fd].is_some() && inner.fd_flags[fd].contains(FdFlags::CLOEXEC)
            };
            if close {
                let _ = self.close(fd);
            }
        }
    }

    /// Duplicates `fd` onto `new_fd` according to `options`.
    pub fn dup(&self, fd: usize, new_fd: usize, options: DupOptions) -> Result<usize> {
        let file = self.get_file(fd)?;

        let new_fd = if options.contains(DupOptions::AT_LEAST) {
            self.find_next_descriptor(new_fd)
                .ok_or_else(|| Error::with_message(Errno::EMFILE, "descriptor table is full"))?
        } else {
            if fd == new_fd {
                if options.contains(DupOptions::IGNORE_SAME) {
                    return Ok(new_fd);
                }
                return_errno!(Errno::EINVAL);
            }
            if new_fd >= MAX_OPEN_FILES {
                return_errno!(Errno::EBADF);
            }
            if self.fd_flags(new_fd)?.contains(FdFlags::RESERVED) {
                return_errno!(Errno::EBUSY);
            }
            if self.inner.lock().files[new_fd].is_some() {
                self.close(new_fd)?;
            }
            new_fd
        };

        self.install_fd(new_fd, file, options.contains(DupOptions::CLOEXEC));
        Ok(new_fd)
    }

    /// Reads from a descriptor, advancing its offset by the bytes
    /// actually transferred.
    pub fn read(&self, fd: usize, writer: &mut VmWriter) -> Result<usize> {
        let file = self.get_file(fd)?;
        let flags = file.flags();
        if !flags.contains(OpenFlags::RDONLY) {
            return_errno!(Errno::EBADF);
        }
        if flags.contains(OpenFlags::DIRECTORY) {
            return_errno!(Errno::EISDIR);
        }
        let count = file.ops().clone().read(&file, writer)?;
        file.advance_offset(count as u64);
        Ok(count)
    }

    /// Writes to a descriptor, advancing its offset by the bytes
    /// actually transferred.
    pub fn write(&self, fd: usize, reader: &mut VmReader) -> Result<usize> {
        let file = self.get_file(fd)?;
        let flags = file.flags();
        if !flags.contains(OpenFlags::WRONLY) {
            return_errno!(Errno::EBADF);
        }
        if flags.contains(OpenFlags::DIRECTORY) {
            return_errno!(Errno::EISDIR);
        }
        let count = file.ops().clone().write(&file, reader)?;
        file.advance_offset(count as u64);
        Ok(count)
    }

    pub fn ioctl(&self, fd: usize, request: u32, arg: usize) -> Result<i32> {
        let file = self.get_file(fd)?;
        file.ops().clone().ioctl(&file, request, arg)
    }

    pub fn truncate(&self, fd: usize, size: u64) -> Result<()> {
        let file = self.get_file(fd)?;
        file.ops().clone().truncate(&file, size)
    }

    /// Reads up to `count` directory entries into `writer` as fixed-size
    /// records: a 32-bit inode followed by a 255-byte NUL-terminated
    /// name. Returns the number of entries.
    pub fn readdir(&self, fd: usize, writer: &mut VmWriter, count: usize) -> Result<usize> {
        let file = self.get_file(fd)?;
        if !file.flags().contains(OpenFlags::DIRECTORY) {
            return_errno!(Errno::ENOTDIR);
        }
        if count == 0 {
            return Ok(0);
        }

        let mut filler = DirentFiller {
            writer,
            remaining: count,
        };
        file.ops().clone().readdir(&file, &mut filler, count)
    }
}

struct DirentFiller<'a, 'b> {
    writer: &'a mut VmWriter<'b>,
    remaining: usize,
}

impl DirentVisitor for DirentFiller<'_, '_> {
    fn visit(&mut self, inode: InodeNum, name: &str) -> Result<()> {
        if self.remaining == 0 {
            return_errno!(Errno::EINVAL);
        }

        let mut record = [0u8; DIRENT_BYTES];
        record[0..4].copy_from_slice(&inode.to_le_bytes());
        let name_bytes = name.as_bytes();
        let len = name_bytes.len().min(DIRENT_NAME_BYTES - 1);
        record[4..4 + len].copy_from_slice(&name_bytes[..len]);

        self.writer.commit(DIRENT_BYTES).map_err(Error::from)?;
        self.writer.write(&record).map_err(Error::from)?;
        self.remaining -= 1;
        Ok(())
    }
}
