// SPDX-License-Identifier: MPL-2.0

//! Signal sending and delivery.

pub mod constants;
pub mod sig_action;
pub mod sig_mask;

use corvus_frame::cpu::UserContext;
use corvus_frame::mm::io;
use corvus_frame::task::{scheduler, Task, TaskStatus, TRAMPOLINE_SIGNAL_RETURN};

use self::constants::*;
use self::sig_action::{SigAction, SigDefaultAction};
use self::sig_mask::SigSet;
use super::{exit_process, exit_thread, Process, Thread};
use crate::prelude::*;

/// How `set_mask` combines the given set with the blocked set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskOp {
    Block,
    Unblock,
    Set,
}

/// Marks a thread continued: CONT becomes pending and the pending
/// stop-group signals are cancelled.
fn continue_thread(thread: &Thread) {
    thread.sig_pending().add_signal(SIGCONT);
    thread.sig_pending().remove_set(SigSet::stop_group());
}

/// Sends a signal to one thread.
pub fn send_to_thread(thread: &Arc<Thread>, sig: SigNum) {
    if sig == SIGCONT {
        continue_thread(thread);
        scheduler::wake_signal(thread.task());
        return;
    }

    let Some(process) = thread.process() else {
        return;
    };

    // An ignored signal is dropped at send time, except for the
    // unmaskable pair.
    let disposition = process.sig_dispositions().lock().get(sig);
    if disposition == SigAction::Ign && sig != SIGKILL && sig != SIGSTOP {
        return;
    }

    thread.sig_pending().add_signal(sig);
    if sig == SIGSTOP {
        thread.sig_pending().remove_signal(SIGCONT);
    }

    if thread.status() == TaskStatus::InterruptibleWait && has_deliverable_signal(thread) {
        scheduler::wake_signal(thread.task());
    }
}

/// Sends a signal to a process.
pub fn send_to_process(process: &Arc<Process>, sig: SigNum) {
    match sig {
        SIGKILL => {
            process.set_exit_code(-(SIGKILL.as_u8() as i32));
            let threads = process.threads().lock().clone();
            for thread in threads.iter() {
                send_to_thread(thread, SIGKILL);
            }
        }
        SIGSTOP => {
            let threads = process.threads().lock().clone();
            for thread in threads.iter() {
                send_to_thread(thread, SIGSTOP);
            }
        }
        _ => {
            if sig == SIGCONT {
                // Continue every thread first, then record the signal at
                // the process level like any other.
                let threads = process.threads().lock().clone();
                for thread in threads.iter() {
                    send_to_thread(thread, SIGCONT);
                }
            }

            let disposition = process.sig_dispositions().lock().get(sig);
            if disposition == SigAction::Ign {
                return;
            }
            process.sig_pending().add_signal(sig);

            // Prefer a runnable thread that does not block the signal; it
            // will pick the signal up naturally. Failing that, cancel an
            // interruptible wait.
            let threads = process.threads().lock().clone();
            let mut eligible_sleeper = None;
            for thread in threads.iter() {
                if thread.sig_blocked().contains(sig) {
                    continue;
                }
                match thread.status() {
                    TaskStatus::Running => return,
                    TaskStatus::InterruptibleWait if eligible_sleeper.is_none() => {
                        eligible_sleeper = Some(thread.clone());
                    }
                    _ => {}
                }
            }
            if let Some(sleeper) = eligible_sleeper {
                scheduler::wake_signal(sleeper.task());
            }
        }
    }
}

/// Changes a thread's blocked-signal mask. KILL and STOP always read as
/// unblocked regardless of the requested mask.
pub fn set_mask(thread: &Thread, op: MaskOp, set: SigSet) {
    match op {
        MaskOp::Block => thread.sig_blocked().block(set),
        MaskOp::Unblock => thread.sig_blocked().unblock(set),
        MaskOp::Set => thread.sig_blocked().store(set.sanitized()),
    }
}

/// Installs a disposition, returning the previous one.
pub fn set_action(process: &Process, sig: SigNum, action: SigAction) -> SigAction {
    process.sig_dispositions().lock().set(sig, action)
}

/// The set of signals a thread could deliver right now.
pub fn deliverable_set(thread: &Thread) -> SigSet {
    let process_pending = thread
        .process()
        .map(|process| process.sig_pending().load())
        .unwrap_or_default();
    (thread.sig_pending().load() | process_pending) & !thread.sig_blocked().load()
}

pub fn has_deliverable_signal(thread: &Thread) -> bool {
    !deliverable_set(thread).is_empty()
}

/// The scheduler's signal-pending hook: lets interruptible blocks return
/// early when a deliverable signal exists.
pub fn task_has_deliverable_signal(task: &Arc<Task>) -> bool {
    match Thread::from_task(task) {
        Some(thread) => has_deliverable_signal(&thread),
        None => false,
    }
}

/// The layout of the frame pushed onto the user stack for a handler:
/// return address (the restore trampoline), the signal number, the
/// previous blocked mask, then the saved user context.
const SIG_FRAME_BYTES: usize = 12 + UserContext::BYTES;

/// Delivers pending signals on the current thread. Called on each return
/// to user mode with the saved interrupt context.
pub fn deliver_pending(ctx: &mut UserContext) {
    let Some(thread) = Thread::current() else {
        return;
    };
    let Some(process) = thread.process() else {
        return;
    };

    let mut eligible = deliverable_set(&thread);
    if eligible.is_empty() {
        return;
    }

    // KILL is never maskable and never waits its turn.
    if eligible.contains(SIGKILL) {
        exit_thread(0);
        return;
    }

    // STOP parks the thread; the pending bit survives until a CONT
    // clears it and wakes us.
    if eligible.contains(SIGSTOP) {
        scheduler::yield_block(false);
        return;
    }

    while let Some(sig) = eligible.lowest() {
        eligible.remove_signal(sig);
        thread.sig_pending().remove_signal(sig);
        process.sig_pending().remove_signal(sig);

        let action = process.sig_dispositions().lock().get(sig);
        match action {
            SigAction::Ign => continue,
            SigAction::Dfl => match SigDefaultAction::from_signum(sig) {
                SigDefaultAction::Ign | SigDefaultAction::Cont => continue,
                SigDefaultAction::Stop => {
                    scheduler::yield_block(false);
                    return;
                }
                SigDefaultAction::Term | SigDefaultAction::Core => {
                    exit_process(-(sig.as_u8() as i32));
                    return;
                }
            },
            SigAction::User {
                handler_addr, mask, ..
            } => {
                if push_handler_frame(ctx, &thread, sig, handler_addr, mask).is_err() {
                    // The user stack is gone; treat it like a fatal fault.
                    exit_process(-(SIGSEGV.as_u8() as i32));
                }
                return;
            }
        }
    }
}

/// Mutates the saved context so that the IRET resumes at the handler,
/// with the user stack arranged so that returning from the handler
/// enters the restore trampoline.
fn push_handler_frame(
    ctx: &mut UserContext,
    thread: &Thread,
    sig: SigNum,
    handler_addr: Vaddr,
    handler_mask: SigSet,
) -> Result<()> {
    let old_blocked = thread.sig_blocked().load();

    let frame_top = (ctx.esp as usize)
        .checked_sub(SIG_FRAME_BYTES)
        .ok_or(Error::new(Errno::EFAULT))?
        & !3;

    let mut frame = [0u8; SIG_FRAME_BYTES];
    frame[0..4].copy_from_slice(&TRAMPOLINE_SIGNAL_RETURN.to_le_bytes());
    frame[4..8].copy_from_slice(&(sig.as_u8() as u32).to_le_bytes());
    frame[8..12].copy_from_slice(&old_blocked.as_u32().to_le_bytes());
    frame[12..].copy_from_slice(&ctx.to_bytes());
    io::write_bytes(frame_top, &frame).map_err(Error::from)?;

    // Block the handler's mask plus the signal itself for the duration.
    thread
        .sig_blocked()
        .block(handler_mask | SigSet::from(sig));

    ctx.eip = handler_addr as u32;
    ctx.esp = frame_top as u32;
    Ok(())
}

/// Returns from a user handler: restores the saved context and blocked
/// mask from the frame the delivery pushed.
///
/// On entry the stack pointer sits just above the consumed return
/// address, i.e. at the signal-number slot.
pub fn signal_return(ctx: &mut UserContext) -> Result<()> {
    let base = ctx.esp as usize;
    let mut word = [0u8; 4];
    io::read_bytes(base + 4, &mut word).map_err(Error::from)?;
    let old_blocked = SigSet::from(u32::from_le_bytes(word));

    let mut saved = [0u8; UserContext::BYTES];
    io::read_bytes(base + 8, &mut saved).map_err(Error::from)?;

    if let Some(thread) = Thread::current() {
        thread.sig_blocked().store(old_blocked.sanitized());
    }
    *ctx = UserContext::from_bytes(&saved);
    Ok(())
}

/// Used by fault paths: when the signal would be ignored or blocked the
/// faulting process is beyond help and is terminated outright.
pub fn send_or_crash(sig: SigNum) {
    let Some(thread) = Thread::current() else {
        panic!("fault signal {} with no current thread", sig.as_u8());
    };
    let Some(process) = thread.process() else {
        return;
    };

    let disposition = process.sig_dispositions().lock().get(sig);
    let dropped = disposition == SigAction::Ign && sig != SIGKILL && sig != SIGSTOP;
    if dropped || thread.sig_blocked().contains(sig) {
        exit_process(-(sig.as_u8() as i32));
    } else {
        send_to_thread(&thread, sig);
    }
}
