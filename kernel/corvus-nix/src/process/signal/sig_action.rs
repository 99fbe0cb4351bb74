// SPDX-License-Identifier: MPL-2.0

use super::constants::*;
use super::sig_mask::SigSet;
use crate::prelude::*;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum SigAction {
    /// Perform the default action.
    #[default]
    Dfl,
    /// Ignore this signal.
    Ign,
    /// Run a user-given handler.
    User {
        handler_addr: Vaddr,
        flags: SigActionFlags,
        mask: SigSet,
    },
}

bitflags! {
    pub struct SigActionFlags: u32 {
        const SA_NOCLDSTOP  = 1;
        const SA_NOCLDWAIT  = 2;
        const SA_SIGINFO    = 4;
        const SA_ONSTACK    = 0x08000000;
        const SA_RESTART    = 0x10000000;
        const SA_NODEFER    = 0x40000000;
        const SA_RESETHAND  = 0x80000000;
    }
}

/// The default action of a signal.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SigDefaultAction {
    /// Terminate the process.
    Term,
    /// Ignore the signal.
    Ign,
    /// Terminate the process and dump core.
    Core,
    /// Suspend the process.
    Stop,
    /// Continue the process if stopped.
    Cont,
}

impl SigDefaultAction {
    pub fn from_signum(num: SigNum) -> SigDefaultAction {
        match num {
            SIGQUIT |
            SIGILL  |
            SIGABRT |
            SIGTRAP |
            SIGBUS  |
            SIGFPE  |
            SIGSEGV
                => SigDefaultAction::Core,
            SIGCHLD
                => SigDefaultAction::Ign,
            SIGCONT
                => SigDefaultAction::Cont,
            SIGSTOP |
            SIGTSTP |
            SIGTTIN |
            SIGTTOU
                => SigDefaultAction::Stop,
            _
                => SigDefaultAction::Term,
        }
    }
}

/// The per-process table of signal dispositions.
pub struct SigDispositions {
    map: [SigAction; SIG_MAX as usize],
}

impl Default for SigDispositions {
    fn default() -> Self {
        Self::new()
    }
}

impl SigDispositions {
    pub fn new() -> Self {
        Self {
            map: [SigAction::default(); SIG_MAX as usize],
        }
    }

    pub fn get(&self, num: SigNum) -> SigAction {
        self.map[Self::index(num)]
    }

    /// Installs a disposition, returning the old one. A user handler's
    /// mask-during-handler can never block KILL or STOP.
    pub fn set(&mut self, num: SigNum, action: SigAction) -> SigAction {
        let action = match action {
            SigAction::User {
                handler_addr,
                flags,
                mask,
            } => SigAction::User {
                handler_addr,
                flags,
                mask: mask.sanitized(),
            },
            other => other,
        };
        core::mem::replace(&mut self.map[Self::index(num)], action)
    }

    pub fn clone_table(&self) -> Self {
        Self { map: self.map }
    }

    fn index(num: SigNum) -> usize {
        (num.as_u8() - 1) as usize
    }
}
