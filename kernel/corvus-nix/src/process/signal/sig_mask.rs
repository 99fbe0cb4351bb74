// SPDX-License-Identifier: MPL-2.0

use core::ops;
use core::sync::atomic::{AtomicU32, Ordering};

use super::constants::*;

/// A bit-set of signals. Bit `n - 1` represents signal `n`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SigSet {
    bits: u32,
}

impl From<SigNum> for SigSet {
    fn from(signum: SigNum) -> Self {
        SigSet {
            bits: 1 << (signum.as_u8() - 1),
        }
    }
}

impl From<u32> for SigSet {
    fn from(bits: u32) -> Self {
        SigSet { bits }
    }
}

impl ops::BitAnd for SigSet {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        SigSet {
            bits: self.bits & rhs.bits,
        }
    }
}

impl ops::BitOr for SigSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        SigSet {
            bits: self.bits | rhs.bits,
        }
    }
}

impl ops::BitOrAssign for SigSet {
    fn bitor_assign(&mut self, rhs: Self) {
        self.bits |= rhs.bits;
    }
}

impl ops::Sub for SigSet {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        SigSet {
            bits: self.bits & !rhs.bits,
        }
    }
}

impl ops::Not for SigSet {
    type Output = Self;

    fn not(self) -> Self {
        SigSet { bits: !self.bits }
    }
}

impl SigSet {
    pub const fn new_empty() -> Self {
        SigSet { bits: 0 }
    }

    /// KILL and STOP always read as unblocked.
    pub fn unmaskable() -> Self {
        SigSet::from(SIGKILL) | SigSet::from(SIGSTOP)
    }

    /// The stop-group signals cancelled by a CONT.
    pub fn stop_group() -> Self {
        SigSet::from(SIGSTOP) | SigSet::from(SIGTSTP) | SigSet::from(SIGTTIN) | SigSet::from(SIGTTOU)
    }

    pub const fn as_u32(&self) -> u32 {
        self.bits
    }

    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn contains(&self, signum: SigNum) -> bool {
        (self.bits & (1 << (signum.as_u8() - 1))) != 0
    }

    pub fn add_signal(&mut self, signum: SigNum) {
        self.bits |= 1 << (signum.as_u8() - 1);
    }

    pub fn remove_signal(&mut self, signum: SigNum) {
        self.bits &= !(1 << (signum.as_u8() - 1));
    }

    /// Removes the unmaskable signals, making the set a legal block mask.
    pub fn sanitized(self) -> Self {
        self - Self::unmaskable()
    }

    /// The lowest-numbered signal in the set.
    pub fn lowest(&self) -> Option<SigNum> {
        if self.bits == 0 {
            return None;
        }
        SigNum::try_from_u8(self.bits.trailing_zeros() as u8 + 1)
    }
}

/// An atomically mutable signal set.
#[derive(Debug, Default)]
pub struct AtomicSigSet(AtomicU32);

impl AtomicSigSet {
    pub fn new_empty() -> Self {
        AtomicSigSet(AtomicU32::new(0))
    }

    pub fn load(&self) -> SigSet {
        SigSet {
            bits: self.0.load(Ordering::Relaxed),
        }
    }

    pub fn store(&self, set: SigSet) {
        self.0.store(set.bits, Ordering::Relaxed);
    }

    pub fn add_signal(&self, signum: SigNum) {
        self.0
            .fetch_or(1 << (signum.as_u8() - 1), Ordering::Relaxed);
    }

    pub fn remove_signal(&self, signum: SigNum) {
        self.0
            .fetch_and(!(1 << (signum.as_u8() - 1)), Ordering::Relaxed);
    }

    pub fn remove_set(&self, set: SigSet) {
        self.0.fetch_and(!set.bits, Ordering::Relaxed);
    }

    pub fn block(&self, set: SigSet) {
        self.0.fetch_or(set.sanitized().bits, Ordering::Relaxed);
    }

    pub fn unblock(&self, set: SigSet) {
        self.0.fetch_and(!set.bits, Ordering::Relaxed);
    }

    pub fn contains(&self, signum: SigNum) -> bool {
        self.load().contains(signum)
    }
}
