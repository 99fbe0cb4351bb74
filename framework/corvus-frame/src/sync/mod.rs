// SPDX-License-Identifier: MPL-2.0

mod spin;
mod wait;

pub use self::spin::{SpinLock, SpinLockGuard};
pub use self::wait::WaitQueue;

pub use ::spin::{Mutex, MutexGuard, Once};
