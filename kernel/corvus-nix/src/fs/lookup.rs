// SPDX-License-Identifier: MPL-2.0

//! Path resolution and `open`.

use super::file::{FileDescription, OpenFlags};
use super::io_context::IoContext;
use super::mode::{can_access, Access, FileMode};
use super::vfs::{self, INode, MountFlags};
use crate::prelude::*;
use crate::process::Credentials;

/// Longest permitted path component.
pub const NAME_MAX: usize = 255;

/// The raw result of a path walk.
pub(crate) enum WalkOutcome {
    /// Resolved to an inode.
    Found(INode),
    /// Trailing slash on a directory; `open` treats this as a directory
    /// open, plain lookup surfaces `EISDIR`.
    TrailingDir(INode),
    /// Trailing slash on a non-directory.
    TrailingNonDir,
    /// Only the final component is missing; its parent directory was
    /// resolved, enabling create-on-open.
    MissingFinal { parent: INode, name: String },
    Failed(Error),
}

fn read_inode_checked(
    fs: &Arc<vfs::Filesystem>,
    number: vfs::InodeNum,
    cred: &Credentials,
) -> core::result::Result<INode, Error> {
    let inode = fs.read_inode(number)?;
    if !can_access(inode.mode, inode.uid, inode.gid, cred, Access::EXEC) {
        return Err(Error::new(Errno::EACCES));
    }
    Ok(inode)
}

/// Walks `path` from the root (absolute) or the context's current
/// directory (relative), crossing mount points.
pub(crate) fn walk(cred: &Credentials, io_ctx: &IoContext, path: &str) -> WalkOutcome {
    if path.is_empty() {
        return WalkOutcome::Failed(Error::new(Errno::ENOENT));
    }

    let bytes = path.as_bytes();
    let mut pos = 0;

    let (mut fs, mut inode_num) = if bytes[0] == b'/' {
        pos = 1;
        match vfs::root_fs() {
            Some(root) => {
                let root_inode = root.root_inode();
                (root, root_inode)
            }
            None => return WalkOutcome::Failed(Error::new(Errno::ENOENT)),
        }
    } else {
        io_ctx.cwd()
    };

    let mut inode = match read_inode_checked(&fs, inode_num, cred) {
        Ok(inode) => inode,
        Err(e) => return WalkOutcome::Failed(e),
    };

    loop {
        // Next path component.
        let mut len = 0;
        while len < NAME_MAX && pos + len < bytes.len() && bytes[pos + len] != b'/' {
            len += 1;
        }
        if len == NAME_MAX {
            return WalkOutcome::Failed(Error::new(Errno::ENAMETOOLONG));
        }

        if len == 0 {
            if pos >= bytes.len() {
                // Trailing slash: the inode must be a directory.
                if inode.mode.is_directory() {
                    return WalkOutcome::TrailingDir(inode);
                }
                return WalkOutcome::TrailingNonDir;
            }
            // Collapse repeated slashes.
            pos += 1;
            continue;
        }

        // Descending requires a directory.
        if !inode.mode.is_directory() {
            return WalkOutcome::Failed(Error::new(Errno::ENOTDIR));
        }

        let name = &path[pos..pos + len];

        if name == "." {
            pos += len + 1;
            if pos > bytes.len() {
                return WalkOutcome::Found(inode);
            }
            continue;
        }

        if name == ".." && inode_num == fs.root_inode() {
            match fs.parent_pair() {
                None => {
                    // `..` at the global root is a no-op.
                    pos += len + 1;
                    if pos > bytes.len() {
                        return WalkOutcome::Found(inode);
                    }
                    continue;
                }
                Some((parent_fs, parent_inode)) => {
                    // Cross to the parent mount pair; the `..` itself is
                    // then resolved within the parent filesystem.
                    fs = parent_fs;
                    inode_num = parent_inode;
                    inode = match read_inode_checked(&fs, inode_num, cred) {
                        Ok(inode) => inode,
                        Err(e) => return WalkOutcome::Failed(e),
                    };
                }
            }
        }

        match fs.find_inode(&inode, name) {
            Ok(child) => inode_num = child,
            Err(e) if e.error() == Errno::ENOENT => {
                // Recoverable only when this was the final component.
                if pos + len >= bytes.len() {
                    return WalkOutcome::MissingFinal {
                        parent: inode,
                        name: name.to_string(),
                    };
                }
                return WalkOutcome::Failed(e);
            }
            // Any other lookup failure terminates the walk with it.
            Err(e) => return WalkOutcome::Failed(e),
        }

        // Cross into a filesystem mounted on this inode.
        if let Some(mounted) = fs.mount_on(inode_num) {
            fs = mounted;
            inode_num = fs.root_inode();
        }

        inode = match fs.read_inode(inode_num) {
            Ok(inode) => inode,
            Err(e) => return WalkOutcome::Failed(e),
        };
        if inode.mode.is_directory()
            && !can_access(inode.mode, inode.uid, inode.gid, cred, Access::EXEC)
        {
            return WalkOutcome::Failed(Error::new(Errno::EACCES));
        }

        pos += len + 1;
        if pos > bytes.len() {
            return WalkOutcome::Found(inode);
        }
    }
}

/// Resolves a path to an inode.
pub fn lookup(cred: &Credentials, io_ctx: &IoContext, path: &str) -> Result<INode> {
    match walk(cred, io_ctx, path) {
        WalkOutcome::Found(inode) => Ok(inode),
        WalkOutcome::TrailingDir(_) => Err(Error::new(Errno::EISDIR)),
        WalkOutcome::TrailingNonDir => Err(Error::new(Errno::ENOTDIR)),
        WalkOutcome::MissingFinal { .. } => Err(Error::new(Errno::ENOENT)),
        WalkOutcome::Failed(e) => Err(e),
    }
}

/// Opens `path` into the reserved descriptor `fd` of `io_ctx`.
pub fn open(
    cred: &Credentials,
    io_ctx: &Arc<IoContext>,
    path: &str,
    flags: OpenFlags,
    mode: FileMode,
    fd: usize,
) -> Result<()> {
    io_ctx.reserve_fd(fd)?;

    let result = do_open(cred, io_ctx, path, flags, mode, fd);
    if result.is_err() {
        io_ctx.unreserve_fd(fd);
    }
    result
}

fn do_open(
    cred: &Credentials,
    io_ctx: &Arc<IoContext>,
    path: &str,
    flags: OpenFlags,
    mode: FileMode,
    fd: usize,
) -> Result<()> {
    let mut flags = flags & OpenFlags::all();
    if !flags.intersects(OpenFlags::RDWR) {
        return_errno_with_message!(Errno::EINVAL, "neither read nor write requested");
    }
    if !flags.contains(OpenFlags::WRONLY) {
        flags.remove(OpenFlags::TRUNCATE);
    }

    let inode = match walk(cred, io_ctx, path) {
        WalkOutcome::Found(inode) => {
            if flags.contains(OpenFlags::DIRECTORY) {
                return_errno!(Errno::ENOTDIR);
            }
            if flags.contains(OpenFlags::CREATE) && flags.contains(OpenFlags::EXCLUSIVE) {
                return_errno!(Errno::EEXIST);
            }
            inode
        }
        WalkOutcome::TrailingDir(inode) => {
            if flags.contains(OpenFlags::CREATE) && flags.contains(OpenFlags::EXCLUSIVE) {
                return_errno!(Errno::EEXIST);
            }
            if flags.contains(OpenFlags::WRONLY) {
                return_errno!(Errno::EISDIR);
            }
            flags |= OpenFlags::DIRECTORY;
            inode
        }
        WalkOutcome::TrailingNonDir => return_errno!(Errno::ENOTDIR),
        WalkOutcome::MissingFinal { parent, name } => {
            if !flags.contains(OpenFlags::CREATE) {
                return_errno!(Errno::ENOENT);
            }
            if flags.contains(OpenFlags::DIRECTORY) {
                return_errno!(Errno::ENOTDIR);
            }
            if parent.fs.flags().contains(MountFlags::RDONLY) {
                return_errno!(Errno::EROFS);
            }
            if !can_access(parent.mode, parent.uid, parent.gid, cred, Access::WRITE) {
                return_errno!(Errno::EACCES);
            }

            let fs = parent.fs.clone();
            let new_number = fs.create(&parent, &name, mode.coerce_regular())?;
            let mut inode = fs.read_inode(new_number)?;
            // The creator may use the file regardless of the new mode.
            inode.mode = inode.mode.grant_all_perms();
            inode
        }
        WalkOutcome::Failed(e) => return Err(e),
    };

    // Only implemented types can be opened.
    if inode.mode.is_unsupported_open_type() {
        return_errno!(Errno::ENOSYS);
    }

    if inode.fs.flags().contains(MountFlags::RDONLY) && flags.contains(OpenFlags::WRONLY) {
        return_errno!(Errno::EROFS);
    }

    let mut access = Access::empty();
    if flags.contains(OpenFlags::RDONLY) {
        access |= Access::READ;
    }
    if flags.contains(OpenFlags::WRONLY) {
        access |= Access::WRITE;
    }
    if !can_access(inode.mode, inode.uid, inode.gid, cred, access) {
        return_errno!(Errno::EACCES);
    }

    let file = FileDescription::new(
        inode.fs.clone(),
        inode.number,
        inode.ops.clone(),
        flags.persistent(),
    );
    inode.ops.open(&inode, &file)?;

    if flags.contains(OpenFlags::TRUNCATE) {
        inode.ops.truncate(&file, 0)?;
    }

    io_ctx.install_fd(fd, file, flags.contains(OpenFlags::CLOEXEC));
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::io_context::IoContext;
    use crate::fs::mode::InodeType;
    use crate::fs::test_fs;
    use crate::test_util::kernel_lock;
    use corvus_frame::mm::io::{VmReader, VmWriter};

    fn setup() -> (Credentials, Arc<IoContext>, Arc<vfs::Filesystem>) {
        let root = test_fs::root();
        let io_ctx = IoContext::new().unwrap();
        (Credentials::new_root(), io_ctx, root)
    }

    #[test]
    fn empty_path_is_enoent() {
        let _guard = kernel_lock();
        let (cred, io_ctx, _root) = setup();
        assert_eq!(lookup(&cred, &io_ctx, "").unwrap_err().error(), Errno::ENOENT);
    }

    #[test]
    fn resolves_nested_components() {
        let _guard = kernel_lock();
        let (cred, io_ctx, root) = setup();
        let dir = test_fs::add_dir(&root, test_fs::ROOT_INO, "lk_nest");
        let file = test_fs::add_file(&root, dir, "leaf");

        let inode = lookup(&cred, &io_ctx, "/lk_nest/leaf").unwrap();
        assert_eq!(inode.number, file);
        // Repeated slashes collapse; `.` is skipped.
        let inode = lookup(&cred, &io_ctx, "/lk_nest//./leaf").unwrap();
        assert_eq!(inode.number, file);
        // Relative paths start at the cwd (the root here).
        let inode = lookup(&cred, &io_ctx, "lk_nest/leaf").unwrap();
        assert_eq!(inode.number, file);
    }

    #[test]
    fn trailing_slash_requires_directory() {
        let _guard = kernel_lock();
        let (cred, io_ctx, root) = setup();
        let dir = test_fs::add_dir(&root, test_fs::ROOT_INO, "lk_slash");
        test_fs::add_file(&root, dir, "plain");

        // A directory with a trailing slash resolves to the same inode,
        // surfaced through the directory-case error.
        match walk(&cred, &io_ctx, "/lk_slash/") {
            WalkOutcome::TrailingDir(inode) => assert_eq!(inode.number, dir),
            _ => panic!("expected the trailing-slash directory case"),
        }
        assert_eq!(
            lookup(&cred, &io_ctx, "/lk_slash/").unwrap_err().error(),
            Errno::EISDIR
        );
        assert_eq!(
            lookup(&cred, &io_ctx, "/lk_slash/plain/").unwrap_err().error(),
            Errno::ENOTDIR
        );
    }

    #[test]
    fn dotdot_at_global_root_is_a_no_op() {
        let _guard = kernel_lock();
        let (cred, io_ctx, _root) = setup();
        let inode = lookup(&cred, &io_ctx, "/..").unwrap();
        assert_eq!(inode.number, test_fs::ROOT_INO);
    }

    #[test]
    fn component_length_is_bounded() {
        let _guard = kernel_lock();
        let (cred, io_ctx, _root) = setup();
        let long = alloc::format!("/{}", "x".repeat(NAME_MAX));
        assert_eq!(
            lookup(&cred, &io_ctx, &long).unwrap_err().error(),
            Errno::ENAMETOOLONG
        );
    }

    #[test]
    fn missing_final_component_is_recoverable() {
        let _guard = kernel_lock();
        let (cred, io_ctx, root) = setup();
        let dir = test_fs::add_dir(&root, test_fs::ROOT_INO, "lk_missing");

        match walk(&cred, &io_ctx, "/lk_missing/ghost") {
            WalkOutcome::MissingFinal { parent, name } => {
                assert_eq!(parent.number, dir);
                assert_eq!(name, "ghost");
            }
            _ => panic!("expected final-component recovery"),
        }
        // A missing intermediate component is not recoverable.
        match walk(&cred, &io_ctx, "/lk_missing/ghost/deeper") {
            WalkOutcome::Failed(e) => assert_eq!(e.error(), Errno::ENOENT),
            _ => panic!("expected a plain failure"),
        }
    }

    #[test]
    fn lookup_crosses_mount_points() {
        let _guard = kernel_lock();
        let (cred, io_ctx, root) = setup();
        let mnt = test_fs::add_dir(&root, test_fs::ROOT_INO, "lk_mnt");
        test_fs::add_file(&root, mnt, "shadowed");

        let mounted =
            vfs::mount("mockfs", None, Some((&root, mnt)), MountFlags::empty()).unwrap();
        let foo = test_fs::add_file(&mounted, test_fs::ROOT_INO, "foo");

        // Resolution lands in the mounted filesystem, not the one below.
        let inode = lookup(&cred, &io_ctx, "/lk_mnt/foo").unwrap();
        assert_eq!(inode.number, foo);
        assert!(Arc::ptr_eq(&inode.fs, &mounted));
        assert_eq!(
            lookup(&cred, &io_ctx, "/lk_mnt/shadowed").unwrap_err().error(),
            Errno::ENOENT
        );

        // `..` at a mount root crosses back to the parent filesystem.
        let inode = lookup(&cred, &io_ctx, "/lk_mnt/..").unwrap();
        assert_eq!(inode.number, test_fs::ROOT_INO);
        assert!(Arc::ptr_eq(&inode.fs, &root));

        vfs::unmount(&mounted).unwrap();
    }

    #[test]
    fn mount_invariants_hold() {
        let _guard = kernel_lock();
        let (_cred, _io_ctx, root) = setup();
        let mnt = test_fs::add_dir(&root, test_fs::ROOT_INO, "lk_busy");

        let mounted =
            vfs::mount("mockfs", None, Some((&root, mnt)), MountFlags::empty()).unwrap();
        // One filesystem per mount point.
        assert_eq!(
            vfs::mount("mockfs", None, Some((&root, mnt)), MountFlags::empty())
                .unwrap_err()
                .error(),
            Errno::EBUSY
        );

        // Unmount fails while files are open on it.
        let file = super::super::file::FileDescription::new(
            mounted.clone(),
            test_fs::ROOT_INO,
            Arc::new(NoopOps),
            OpenFlags::RDONLY,
        );
        assert_eq!(vfs::unmount(&mounted).unwrap_err().error(), Errno::EBUSY);
        drop(file);
        vfs::unmount(&mounted).unwrap();
    }

    struct NoopOps;
    impl vfs::FileOps for NoopOps {}

    #[test]
    fn permission_checks_apply_to_directories() {
        let _guard = kernel_lock();
        let (_root_cred, io_ctx, root) = setup();
        let locked = test_fs::add_dir(&root, test_fs::ROOT_INO, "lk_locked");
        test_fs::add_file(&root, locked, "secret");
        test_fs::set_mode(
            &root,
            locked,
            crate::fs::mode::FileMode::from_type_and_perms(InodeType::Directory, 0o700),
        );

        let user = Credentials::new(1000, 1000);
        assert_eq!(
            lookup(&user, &io_ctx, "/lk_locked/secret").unwrap_err().error(),
            Errno::EACCES
        );
        // Root passes.
        assert!(lookup(&Credentials::new_root(), &io_ctx, "/lk_locked/secret").is_ok());
    }

    #[test]
    fn open_requires_an_access_mode() {
        let _guard = kernel_lock();
        let (cred, io_ctx, _root) = setup();
        assert_eq!(
            open(&cred, &io_ctx, "/", OpenFlags::empty(), FileMode::new(0), 3)
                .unwrap_err()
                .error(),
            Errno::EINVAL
        );
        // The failed open released its reservation.
        assert!(io_ctx.reserve_fd(3).is_ok());
        io_ctx.unreserve_fd(3);
    }

    #[test]
    fn open_creates_and_reads_back() {
        let _guard = kernel_lock();
        let (cred, io_ctx, root) = setup();
        test_fs::add_dir(&root, test_fs::ROOT_INO, "lk_create");

        open(
            &cred,
            &io_ctx,
            "/lk_create/new",
            OpenFlags::RDWR | OpenFlags::CREATE,
            FileMode::new(0o644),
            5,
        )
        .unwrap();

        let payload = b"hello corvus";
        let mut reader = VmReader::from_kernel(payload);
        assert_eq!(io_ctx.write(5, &mut reader).unwrap(), payload.len());

        io_ctx.get_file(5).unwrap().set_offset(0);
        let mut buf = [0u8; 12];
        let mut writer = VmWriter::from_kernel(&mut buf);
        assert_eq!(io_ctx.read(5, &mut writer).unwrap(), payload.len());
        assert_eq!(&buf, payload);

        // Now the file exists, an exclusive create must fail.
        assert_eq!(
            open(
                &cred,
                &io_ctx,
                "/lk_create/new",
                OpenFlags::RDWR | OpenFlags::CREATE | OpenFlags::EXCLUSIVE,
                FileMode::new(0o644),
                6,
            )
            .unwrap_err()
            .error(),
            Errno::EEXIST
        );

        io_ctx.close(5).unwrap();
    }

    #[test]
    fn open_directory_semantics() {
        let _guard = kernel_lock();
        let (cred, io_ctx, root) = setup();
        test_fs::add_dir(&root, test_fs::ROOT_INO, "lk_dir");

        // Writing to a directory is refused.
        assert_eq!(
            open(
                &cred,
                &io_ctx,
                "/lk_dir/",
                OpenFlags::WRONLY,
                FileMode::new(0),
                7,
            )
            .unwrap_err()
            .error(),
            Errno::EISDIR
        );

        // A read-only open of the directory case succeeds and carries
        // the directory flag.
        open(
            &cred,
            &io_ctx,
            "/lk_dir/",
            OpenFlags::RDONLY,
            FileMode::new(0),
            7,
        )
        .unwrap();
        assert!(io_ctx
            .get_file(7)
            .unwrap()
            .flags()
            .contains(OpenFlags::DIRECTORY));
        io_ctx.close(7).unwrap();
    }

    #[test]
    fn open_refuses_unsupported_types() {
        let _guard = kernel_lock();
        let (cred, io_ctx, root) = setup();
        let node = test_fs::add_file(&root, test_fs::ROOT_INO, "lk_sock");
        test_fs::set_mode(
            &root,
            node,
            crate::fs::mode::FileMode::from_type_and_perms(InodeType::Socket, 0o666),
        );
        assert_eq!(
            open(&cred, &io_ctx, "/lk_sock", OpenFlags::RDONLY, FileMode::new(0), 8)
                .unwrap_err()
                .error(),
            Errno::ENOSYS
        );
    }

    #[test]
    fn truncate_is_stripped_without_write_access() {
        let _guard = kernel_lock();
        let (cred, io_ctx, root) = setup();
        test_fs::add_dir(&root, test_fs::ROOT_INO, "lk_trunc");

        open(
            &cred,
            &io_ctx,
            "/lk_trunc/data",
            OpenFlags::RDWR | OpenFlags::CREATE,
            FileMode::new(0o644),
            9,
        )
        .unwrap();
        let mut reader = VmReader::from_kernel(b"payload");
        io_ctx.write(9, &mut reader).unwrap();
        io_ctx.close(9).unwrap();

        // Read-only with TRUNCATE: the flag is dropped, data survives.
        open(
            &cred,
            &io_ctx,
            "/lk_trunc/data",
            OpenFlags::RDONLY | OpenFlags::TRUNCATE,
            FileMode::new(0),
            9,
        )
        .unwrap();
        let mut buf = [0u8; 7];
        let mut writer = VmWriter::from_kernel(&mut buf);
        assert_eq!(io_ctx.read(9, &mut writer).unwrap(), 7);
        assert_eq!(&buf, b"payload");
        io_ctx.close(9).unwrap();
    }
}
