// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicU32, Ordering};

pub type Uid = u32;
pub type Gid = u32;

/// The security context of a process: real, effective and saved user and
/// group ids. `root` is defined as effective uid zero.
pub struct Credentials {
    ruid: AtomicU32,
    euid: AtomicU32,
    suid: AtomicU32,
    rgid: AtomicU32,
    egid: AtomicU32,
    sgid: AtomicU32,
}

impl Credentials {
    pub fn new_root() -> Self {
        Self::new(0, 0)
    }

    pub fn new(uid: Uid, gid: Gid) -> Self {
        Self {
            ruid: AtomicU32::new(uid),
            euid: AtomicU32::new(uid),
            suid: AtomicU32::new(uid),
            rgid: AtomicU32::new(gid),
            egid: AtomicU32::new(gid),
            sgid: AtomicU32::new(gid),
        }
    }

    pub fn ruid(&self) -> Uid {
        self.ruid.load(Ordering::Relaxed)
    }

    pub fn euid(&self) -> Uid {
        self.euid.load(Ordering::Relaxed)
    }

    pub fn suid(&self) -> Uid {
        self.suid.load(Ordering::Relaxed)
    }

    pub fn rgid(&self) -> Gid {
        self.rgid.load(Ordering::Relaxed)
    }

    pub fn egid(&self) -> Gid {
        self.egid.load(Ordering::Relaxed)
    }

    pub fn sgid(&self) -> Gid {
        self.sgid.load(Ordering::Relaxed)
    }

    pub fn is_root(&self) -> bool {
        self.euid() == 0
    }
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        let new = Self::new(0, 0);
        new.ruid.store(self.ruid(), Ordering::Relaxed);
        new.euid.store(self.euid(), Ordering::Relaxed);
        new.suid.store(self.suid(), Ordering::Relaxed);
        new.rgid.store(self.rgid(), Ordering::Relaxed);
        new.egid.store(self.egid(), Ordering::Relaxed);
        new.sgid.store(self.sgid(), Ordering::Relaxed);
        new
    }
}
