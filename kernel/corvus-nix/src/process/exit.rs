// SPDX-License-Identifier: MPL-2.0

//! Process and thread termination.
//!
//! In the real kernel these functions never return; the software machine
//! model schedules away from the zombie task and then returns to the
//! caller, which stands in for the final context switch.

use corvus_frame::mm::context::MemContext;
use corvus_frame::task::{scheduler, TaskStatus};

use super::signal::constants::{SIGCHLD, SIGKILL};
use super::{kernel_process, reaper, signal, Process, Thread, WaitMode};
use crate::prelude::*;
use crate::time;

/// Exits the current process with the given exit code.
pub fn exit_process(exit_code: i32) {
    let thread = Thread::current().expect("exit_process: no current thread");
    let process = thread.process().expect("exit_process: no owning process");

    process.set_exit_code(exit_code);

    if live_thread_count(&process) > 1 {
        // Take the other threads down first; the process dies when the
        // last one exits.
        let threads = process.threads().lock().clone();
        for other in threads.iter() {
            if other.tid() != thread.tid() && !other.is_zombie() {
                signal::send_to_thread(other, SIGKILL);
            }
        }
        exit_this_thread(&thread, &process, 0);
    } else {
        exit_last_thread(&thread, &process);
    }
}

/// Exits the current thread with the given exit code.
pub fn exit_thread(exit_code: i32) {
    let thread = Thread::current().expect("exit_thread: no current thread");
    let process = thread.process().expect("exit_thread: no owning process");

    if live_thread_count(&process) <= 1 {
        // Last thread: the whole process exits with its stored code.
        exit_last_thread(&thread, &process);
    } else {
        exit_this_thread(&thread, &process, exit_code);
    }
}

/// Threads of the process that have not yet exited.
fn live_thread_count(process: &Arc<Process>) -> usize {
    process
        .threads()
        .lock()
        .iter()
        .filter(|thread| !thread.is_zombie())
        .count()
}

/// Terminates one thread of a multi-threaded process.
fn exit_this_thread(thread: &Arc<Thread>, process: &Arc<Process>, exit_code: i32) {
    thread.set_exit_code(exit_code);
    thread.task().set_status(TaskStatus::Zombie);

    if process.is_kernel() {
        reaper::add(thread);
    } else {
        // Wake siblings blocked in wait_thread.
        let threads = process.threads().lock().clone();
        for sibling in threads.iter() {
            if sibling.status() == TaskStatus::InterruptibleWait
                && sibling.wait_mode() == WaitMode::Thread
            {
                scheduler::wake(sibling.task());
            }
        }
    }

    scheduler::exit_current();
}

/// Terminates the last thread, and with it the process.
fn exit_last_thread(thread: &Arc<Thread>, process: &Arc<Process>) {
    time::cancel_alarm(process);

    disown_children(process);

    // Release the address space; the kernel context carries us out.
    if process.take_mem_ctx().is_some() {
        MemContext::kernel().switch_to();
    }
    process.take_io_ctx();

    process.set_zombie();
    thread.task().set_status(TaskStatus::Zombie);

    let parent = process.parent();
    match parent {
        Some(parent) if !parent.is_kernel() => {
            // Wake parent threads blocked in wait_process, then let the
            // parent know.
            let parent_threads = parent.threads().lock().clone();
            for waiter in parent_threads.iter() {
                if waiter.status() == TaskStatus::InterruptibleWait
                    && waiter.wait_mode() == WaitMode::Process
                {
                    scheduler::wake(waiter.task());
                }
            }
            signal::send_to_process(&parent, SIGCHLD);
        }
        _ => {
            // Kernel-owned processes are reaped automatically.
            reaper::add(thread);
        }
    }

    scheduler::exit_current();
}

/// Re-parents every child to the kernel process.
pub(super) fn disown_children(process: &Arc<Process>) {
    let kernel = kernel_process();
    let orphans: Vec<Arc<Process>> = {
        let mut children = process.children().lock();
        let orphans = children.values().cloned().collect();
        children.clear();
        orphans
    };
    let mut kernel_children = kernel.children().lock();
    for child in orphans {
        child.set_parent(&kernel);
        kernel_children.insert(child.pid(), child);
    }
}
