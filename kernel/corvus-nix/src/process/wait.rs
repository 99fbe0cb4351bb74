// SPDX-License-Identifier: MPL-2.0

use corvus_frame::task::scheduler;

use super::{reaper, table, Pid, Thread, Tid, WaitMode};
use crate::prelude::*;

bitflags! {
    pub struct WaitOptions: u32 {
        /// Return instead of blocking when no candidate has exited yet.
        const NOHANG = 1;
    }
}

/// Waits for a child process to exit and reaps it.
///
/// `id == -1` selects any child; `id > 0` a specific child. Returns
/// `None` when `NOHANG` was given and nothing has exited yet.
pub fn wait_process(id: i32, options: WaitOptions) -> Result<Option<(Pid, i32)>> {
    let process = current!();
    let thread = Thread::current().expect("wait_process: no current thread");

    if process.is_kernel() {
        error!("wait_process: kernel threads cannot wait on processes");
        return_errno!(Errno::EPERM);
    }
    if id == 0 || id < -1 {
        // Process groups are not implemented.
        return_errno!(Errno::ENOSYS);
    }

    let chosen = if id > 0 {
        let child = table::process_with_pid(id as Pid);
        match child {
            Some(child)
                if child
                    .parent()
                    .map(|parent| parent.pid() == process.pid())
                    .unwrap_or(false) =>
            {
                Some(child)
            }
            _ => return_errno!(Errno::ECHILD),
        }
    } else {
        if process.children().lock().is_empty() {
            return_errno!(Errno::ECHILD);
        }
        None
    };

    let mut interrupted = false;
    loop {
        let found = match &chosen {
            Some(child) => child.is_zombie().then(|| child.clone()),
            None => {
                let children = process.children().lock();
                children.values().find(|child| child.is_zombie()).cloned()
            }
        };

        if let Some(zombie) = found {
            let pid = zombie.pid();
            let exit_code = zombie.exit_code();
            reaper::reap_process(&zombie);
            return Ok(Some((pid, exit_code)));
        }

        if options.contains(WaitOptions::NOHANG) {
            return Ok(None);
        }
        if interrupted {
            return_errno!(Errno::EINTR);
        }

        thread.set_wait_mode(WaitMode::Process);
        if scheduler::yield_block(true) {
            // Interrupted, but recheck once before surfacing EINTR.
            interrupted = true;
        }
        thread.set_wait_mode(WaitMode::None);
    }
}

/// Waits for a sibling thread of the same process to exit and reaps it.
pub fn wait_thread(id: i32, options: WaitOptions) -> Result<Option<(Tid, i32)>> {
    let process = current!();
    let thread = Thread::current().expect("wait_thread: no current thread");

    if process.is_kernel() {
        error!("wait_thread: kernel threads cannot wait on threads");
        return_errno!(Errno::EPERM);
    }
    if id == 0 || id < -1 {
        return_errno!(Errno::ENOSYS);
    }

    let chosen = if id > 0 {
        let sibling = table::thread_with_tid(id as Tid);
        match sibling {
            Some(sibling)
                if sibling
                    .process()
                    .map(|owner| owner.pid() == process.pid())
                    .unwrap_or(false) =>
            {
                Some(sibling)
            }
            _ => return_errno!(Errno::ESRCH),
        }
    } else {
        if process.threads().lock().len() < 2 {
            return_errno!(Errno::ESRCH);
        }
        None
    };

    let mut interrupted = false;
    loop {
        let found = match &chosen {
            Some(sibling) => sibling.is_zombie().then(|| sibling.clone()),
            None => {
                let threads = process.threads().lock();
                threads.iter().find(|sibling| sibling.is_zombie()).cloned()
            }
        };

        if let Some(zombie) = found {
            let tid = zombie.tid();
            let exit_code = zombie.exit_code();
            reaper::reap_thread(&zombie);
            return Ok(Some((tid, exit_code)));
        }

        if options.contains(WaitOptions::NOHANG) {
            return Ok(None);
        }
        if interrupted {
            return_errno!(Errno::EINTR);
        }

        thread.set_wait_mode(WaitMode::Thread);
        if scheduler::yield_block(true) {
            interrupted = true;
        }
        thread.set_wait_mode(WaitMode::None);
    }
}
