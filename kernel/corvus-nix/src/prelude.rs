// SPDX-License-Identifier: MPL-2.0

#![allow(unused)]

pub(crate) use alloc::{
    boxed::Box,
    collections::{BTreeMap, VecDeque},
    string::{String, ToString},
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};
pub(crate) use core::any::Any;
pub(crate) use core::fmt::Debug;

pub(crate) use bitflags::bitflags;
pub(crate) use corvus_frame::config::PAGE_SIZE;
pub(crate) use corvus_frame::mm::Vaddr;
pub(crate) use corvus_frame::sync::{Mutex, MutexGuard, SpinLock, WaitQueue};
pub(crate) use lazy_static::lazy_static;
pub(crate) use log::{debug, error, info, trace, warn};

pub(crate) use crate::error::{Errno, Error};
pub(crate) use crate::{return_errno, return_errno_with_message};

pub type Result<T> = core::result::Result<T, Error>;

/// Returns the current process.
#[macro_export]
macro_rules! current {
    () => {
        $crate::process::current()
    };
}

/// Returns the current thread.
#[macro_export]
macro_rules! current_thread {
    () => {
        $crate::process::Thread::current()
    };
}

pub(crate) use crate::{current, current_thread};
