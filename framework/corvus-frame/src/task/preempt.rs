// SPDX-License-Identifier: MPL-2.0

use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering::Relaxed};

/// When this has a non-zero value, the CPU cannot reschedule.
static PREEMPT_COUNT: AtomicUsize = AtomicUsize::new(0);

/// A guard for disabled preemption.
pub struct DisablePreemptGuard {
    // Keeps the guard on the CPU that created it.
    _not_send: PhantomData<*mut ()>,
}

impl DisablePreemptGuard {
    fn new() -> Self {
        PREEMPT_COUNT.fetch_add(1, Relaxed);
        Self {
            _not_send: PhantomData,
        }
    }

    /// Transfers this guard to a new guard.
    pub fn transfer_to(&self) -> Self {
        disable_preempt()
    }
}

impl Drop for DisablePreemptGuard {
    fn drop(&mut self) {
        PREEMPT_COUNT.fetch_sub(1, Relaxed);
    }
}

#[must_use]
pub fn disable_preempt() -> DisablePreemptGuard {
    DisablePreemptGuard::new()
}

/// Whether the scheduler may currently take the CPU away.
pub fn preemptible() -> bool {
    PREEMPT_COUNT.load(Relaxed) == 0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn guard_nests() {
        let outer = disable_preempt();
        assert!(!preemptible());
        {
            let _inner = outer.transfer_to();
            assert!(!preemptible());
        }
        assert!(!preemptible());
        drop(outer);
    }
}
