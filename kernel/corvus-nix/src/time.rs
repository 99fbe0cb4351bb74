// SPDX-License-Identifier: MPL-2.0

//! Tick accounting and the process-wide alarm.
//!
//! The periodic timer interrupt (a collaborator outside this repository)
//! calls [`tick`], which charges the scheduler quantum and fires due
//! alarms.

use core::sync::atomic::{AtomicU64, Ordering};

use corvus_frame::task::scheduler;

use crate::prelude::*;
use crate::process::signal::constants::SIGALRM;
use crate::process::{self, signal, Process};

/// Timer interrupt frequency.
pub const TIMER_HZ: u64 = 100;

static TICKS: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    /// Processes with an armed alarm.
    static ref ALARMS: SpinLock<Vec<Weak<Process>>> = SpinLock::new(Vec::new());
}

pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// One timer tick: advance the clock, fire due alarms, charge the
/// running thread's quantum.
pub fn tick() {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    fire_due_alarms(now);
    scheduler::tick();
}

fn fire_due_alarms(now: u64) {
    let mut due = Vec::new();
    {
        let mut alarms = ALARMS.lock();
        alarms.retain(|weak| {
            let Some(process) = weak.upgrade() else {
                return false;
            };
            let mut deadline = process.alarm_deadline().lock();
            match *deadline {
                Some(at) if at <= now => {
                    *deadline = None;
                    due.push(process.clone());
                    false
                }
                Some(_) => true,
                None => false,
            }
        });
    }
    for process in due {
        signal::send_to_process(&process, SIGALRM);
    }
}

/// Arms (or, with zero, cancels) the current process's alarm. Returns
/// the seconds that were left on a previously armed alarm.
pub fn alarm(seconds: u64) -> Result<u64> {
    let process = process::current();
    if process.is_kernel() {
        error!("alarm: kernel threads cannot use the alarm");
        return_errno!(Errno::EPERM);
    }

    let now = ticks();
    let remaining = {
        let mut deadline = process.alarm_deadline().lock();
        let remaining = match *deadline {
            Some(at) if at > now => (at - now + TIMER_HZ - 1) / TIMER_HZ,
            _ => 0,
        };
        *deadline = (seconds > 0).then(|| now + seconds * TIMER_HZ);
        remaining
    };

    if seconds > 0 {
        let mut alarms = ALARMS.lock();
        if !alarms
            .iter()
            .any(|weak| weak.upgrade().map(|p| p.pid()) == Some(process.pid()))
        {
            alarms.push(Arc::downgrade(&process));
        }
    }
    Ok(remaining)
}

/// Cancels a process's alarm on exit.
pub(crate) fn cancel_alarm(process: &Arc<Process>) {
    *process.alarm_deadline().lock() = None;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::process::signal::constants::SIGALRM;
    use crate::test_util::{back_to_kernel, kernel_lock, run_as, spawn_user_process};

    #[test]
    fn alarm_fires_sigalrm_on_deadline() {
        let _guard = kernel_lock();
        let (process, thread) = spawn_user_process("alarm", None);
        run_as(&thread);

        assert_eq!(alarm(1).unwrap(), 0);
        assert!(process.alarm_deadline().lock().is_some());

        for _ in 0..TIMER_HZ {
            tick();
        }
        assert!(process.sig_pending().load().contains(SIGALRM)
            || thread.sig_pending().contains(SIGALRM));
        assert!(process.alarm_deadline().lock().is_none());
        back_to_kernel();
    }

    #[test]
    fn alarm_rearm_reports_remaining_seconds() {
        let _guard = kernel_lock();
        let (_process, thread) = spawn_user_process("alarm-rearm", None);
        run_as(&thread);

        assert_eq!(alarm(10).unwrap(), 0);
        let remaining = alarm(0).unwrap();
        assert!(remaining >= 9 && remaining <= 10);
        // Cancelled: nothing fires.
        assert_eq!(alarm(0).unwrap(), 0);
        back_to_kernel();
    }

    #[test]
    fn kernel_threads_cannot_use_the_alarm() {
        let _guard = kernel_lock();
        let boot = crate::process::Thread::new_kernel("alarm-denied", 0, 0);
        run_as(&boot);
        assert_eq!(alarm(1).unwrap_err().error(), Errno::EPERM);
        back_to_kernel();
    }
}
