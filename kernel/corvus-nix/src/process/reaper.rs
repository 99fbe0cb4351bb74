// SPDX-License-Identifier: MPL-2.0

//! The reaper: a kernel thread that releases terminated threads' and
//! processes' records.

use corvus_frame::cpu::fpu;
use corvus_frame::task::{scheduler, TaskStatus};
use spin::Once;

use super::exit::disown_children;
use super::{kernel_process, table, Process, Thread};
use crate::prelude::*;

lazy_static! {
    static ref REAPER_QUEUE: SpinLock<VecDeque<Arc<Thread>>> = SpinLock::new(VecDeque::new());
}

static REAPER_THREAD: Once<Arc<Thread>> = Once::new();

pub(crate) fn init() {
    let thread = Thread::new_kernel("reaper", 0, 0);
    REAPER_THREAD.call_once(|| thread);
}

/// The reaper thread's body: drain the queue, then sleep until more
/// zombies arrive.
pub fn reaper_loop() -> ! {
    loop {
        drain();
        scheduler::yield_block(false);
    }
}

/// Queues a zombie thread for automatic reaping.
///
/// A thread belonging to a non-kernel process may only be queued once
/// that process is itself a zombie; the whole process is then reaped.
pub fn add(thread: &Arc<Thread>) {
    if thread.status() != TaskStatus::Zombie {
        error!("reaper: non-zombie thread passed");
        return;
    }
    match thread.process() {
        Some(process) if !process.is_kernel() && !process.is_zombie() => {
            error!("reaper: thread of a non-zombie process passed");
            return;
        }
        _ => {}
    }

    REAPER_QUEUE.lock().push_back(thread.clone());
    if let Some(reaper) = REAPER_THREAD.get() {
        scheduler::wake(reaper.task());
    }
}

/// Releases every queued zombie.
pub fn drain() {
    loop {
        let thread = REAPER_QUEUE.lock().pop_front();
        let Some(thread) = thread else {
            return;
        };
        match thread.process() {
            Some(process) if !process.is_kernel() => reap_process(&process),
            _ => reap_thread(&thread),
        }
    }
}

/// Releases a zombie thread: FPU state, id-hash entry, sibling-list
/// entry; the kernel stack frame and the record go with the last
/// reference.
pub(crate) fn reap_thread(thread: &Arc<Thread>) {
    assert!(
        thread.status() == TaskStatus::Zombie,
        "cannot reap a thread which is still running"
    );
    if let Some(current) = Thread::current() {
        assert!(current.tid() != thread.tid(), "cannot reap the current thread");
    }

    fpu::drop_state(thread.task());
    table::detach_thread(thread.tid());
    if let Some(process) = thread.process() {
        process
            .threads()
            .lock()
            .retain(|sibling| sibling.tid() != thread.tid());
    }
}

/// Releases a zombie process: all of its threads, its children (adopted
/// by the kernel process), its parent link and its id-hash entry.
pub(crate) fn reap_process(process: &Arc<Process>) {
    assert!(process.is_zombie(), "cannot reap a running process");

    let threads = process.threads().lock().clone();
    for thread in threads.iter() {
        reap_thread(thread);
    }

    disown_children(process);

    if let Some(parent) = process.parent() {
        parent.children().lock().remove(&process.pid());
    } else {
        kernel_process().children().lock().remove(&process.pid());
    }
    table::detach_process(process.pid());
}
