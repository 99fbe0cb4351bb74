// SPDX-License-Identifier: MPL-2.0

//! The run queue and the scheduling operations.
//!
//! Single-processor, FIFO. Preemption is layered above: the timer tick
//! charges the running task's quantum and requeues it at the tail when
//! the quantum reaches zero.
//!
//! In the software machine model a context switch performs every
//! architectural side effect (TSS and TLS shadows, page-directory
//! switch, FPU notification, current-task swap) and then returns to the
//! caller, which stands in for "resumed later".

use intrusive_collections::LinkedList;
use lazy_static::lazy_static;
use log::error;
use spin::Once;

use super::processor::{self, current_task};
use super::{RunQueueAdapter, Task, TaskStatus};
use crate::cpu::fpu;
use crate::prelude::*;
use crate::sync::SpinLock;

lazy_static! {
    static ref RUN_QUEUE: SpinLock<LinkedList<RunQueueAdapter>> =
        SpinLock::new(LinkedList::new(RunQueueAdapter::new()));
}

/// Asks the service layer whether a task has deliverable signals; wired
/// up at kernel bring-up.
static SIGNAL_PENDING_HOOK: Once<fn(&Arc<Task>) -> bool> = Once::new();

pub fn set_signal_pending_hook(hook: fn(&Arc<Task>) -> bool) {
    SIGNAL_PENDING_HOOK.call_once(|| hook);
}

fn signal_pending(task: &Arc<Task>) -> bool {
    match SIGNAL_PENDING_HOOK.get() {
        Some(hook) => hook(task),
        None => false,
    }
}

/// Yields the processor so that other tasks may run.
pub fn yield_now() {
    let Some(current) = current_task() else {
        return;
    };
    current.set_interrupted(false);

    let mut queue = RUN_QUEUE.lock();
    if queue.is_empty() {
        drop(queue);
        // Nothing else to run; keep going with a fresh quantum.
        current.reset_quantum();
        return;
    }
    queue.push_back(current);
    drop(queue);

    do_schedule();
}

/// Blocks the current task until it is woken.
///
/// When `interruptible`, a pending deliverable signal makes this return
/// `true` immediately, and a later `wake_signal` cancels the wait the
/// same way. The caller must arrange for some other party to wake the
/// task.
pub fn yield_block(interruptible: bool) -> bool {
    let Some(current) = current_task() else {
        return false;
    };

    if interruptible && signal_pending(&current) {
        return true;
    }

    current.set_interrupted(false);
    current.set_status(if interruptible {
        TaskStatus::InterruptibleWait
    } else {
        TaskStatus::UninterruptibleWait
    });

    // Not enqueued: blocked tasks leave the run queue entirely.
    do_schedule();

    current.interrupted()
}

/// Wakes a task from a block.
pub fn wake(task: &Arc<Task>) {
    wake_inner(task, false);
}

/// Wakes a task on account of a signal; interruptible waits observe the
/// cancellation, uninterruptible waits ignore it.
pub fn wake_signal(task: &Arc<Task>) {
    wake_inner(task, true);
}

fn wake_inner(task: &Arc<Task>, is_signal: bool) {
    match task.status() {
        TaskStatus::Startup => {
            task.set_interrupted(false);
        }
        TaskStatus::Running => {
            // Already runnable; an ordinary wake clears any stale
            // cancellation.
            if !is_signal {
                task.set_interrupted(false);
            }
            return;
        }
        TaskStatus::InterruptibleWait => {
            task.set_interrupted(is_signal);
        }
        TaskStatus::UninterruptibleWait => {
            if is_signal {
                // The signal stays pending until the task runs again.
                return;
            }
            task.set_interrupted(false);
        }
        TaskStatus::Zombie => {
            error!("wake: attempt to wake up a zombie task");
            return;
        }
    }

    task.set_status(TaskStatus::Running);
    let mut queue = RUN_QUEUE.lock();
    if !task.is_queued() {
        queue.push_back(task.clone());
    }
}

/// Marks the current task a zombie and schedules away from it. In the
/// real kernel this never returns.
pub fn exit_current() {
    let Some(current) = current_task() else {
        return;
    };
    current.set_status(TaskStatus::Zombie);
    do_schedule();
}

/// Charges a timer tick against the running task; an exhausted quantum
/// sends it to the back of the queue.
pub fn tick() {
    let Some(current) = current_task() else {
        return;
    };
    if current.charge_tick() == 0 {
        yield_now();
    }
}

/// Picks the next task and switches to it.
fn do_schedule() {
    let next = {
        let mut queue = RUN_QUEUE.lock();
        queue.pop_front()
    };
    let next = match next {
        Some(task) => task,
        None => match processor::idle_task() {
            Some(idle) => idle,
            None => return,
        },
    };
    switch_to(next);
}

fn switch_to(next: Arc<Task>) {
    if let Some(current) = current_task() {
        if Arc::ptr_eq(&current, &next) {
            return;
        }
    }

    if next.is_kernel_task() {
        processor::set_tss_esp0(0);
    } else {
        // User task: the TSS must know the kernel stack ceiling and the
        // GDT must carry this task's TLS descriptor.
        processor::set_tss_esp0(next.kstack().top());
        processor::set_gdt_tls(next.tls_descriptor());

        if let Some(ctx) = next.mem_ctx() {
            let current_ctx = crate::mm::context::MemContext::current();
            if !Arc::ptr_eq(ctx, &current_ctx) {
                ctx.switch_to();
            }
        }
        next.reset_quantum();
    }

    processor::set_current_task(next);
    fpu::task_switched();

    // The stack swap itself is represented by returning to the caller.
}

#[cfg(test)]
pub(crate) fn drain_run_queue() {
    let mut queue = RUN_QUEUE.lock();
    while queue.pop_front().is_some() {}
}
