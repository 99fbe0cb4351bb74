// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicI32, Ordering};

use corvus_frame::task::{processor, scheduler, Task, TaskOptions, TaskStatus};

use super::signal::sig_mask::AtomicSigSet;
use super::{table, Process, Tid};
use crate::prelude::*;

/// What a blocked thread is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitMode {
    #[default]
    None,
    /// Blocked in `wait_process`.
    Process,
    /// Blocked in `wait_thread`.
    Thread,
}

/// A thread: kernel-side identity layered over a frame task.
pub struct Thread {
    tid: Tid,
    name: Mutex<String>,
    process: Weak<Process>,
    task: Arc<Task>,
    sig_pending: AtomicSigSet,
    sig_blocked: AtomicSigSet,
    wait_mode: SpinLock<WaitMode>,
    exit_code: AtomicI32,
}

impl Thread {
    /// Creates a thread that enters user mode at `entry`, in `Startup`
    /// state. The caller wakes it when ready.
    pub fn new_user(
        name: &str,
        process: &Arc<Process>,
        entry: u32,
        user_stack: u32,
    ) -> Result<Arc<Thread>> {
        let mem_ctx = process
            .mem_ctx()
            .ok_or_else(|| Error::with_message(Errno::EINVAL, "process has no address space"))?;

        let thread = table::attach_thread(|tid| {
            Arc::new_cyclic(|weak_self: &Weak<Thread>| {
                let task = TaskOptions::new_user(entry, user_stack)
                    .mem_ctx(Some(mem_ctx.clone()))
                    .data(weak_self.clone())
                    .build()
                    .expect("user task creation cannot fail");
                Thread {
                    tid,
                    name: Mutex::new(name.to_string()),
                    process: Arc::downgrade(process),
                    task,
                    sig_pending: AtomicSigSet::new_empty(),
                    sig_blocked: AtomicSigSet::new_empty(),
                    wait_mode: SpinLock::new(WaitMode::None),
                    exit_code: AtomicI32::new(0),
                }
            })
        });
        process.threads().lock().push(thread.clone());
        Ok(thread)
    }

    /// Creates a kernel thread running `entry(arg)`, in `Startup` state.
    pub fn new_kernel(name: &str, entry: u32, arg: u32) -> Arc<Thread> {
        let process = super::kernel_process();
        let thread = table::attach_thread(|tid| {
            Arc::new_cyclic(|weak_self: &Weak<Thread>| {
                let task = TaskOptions::new_kernel(entry, arg)
                    .data(weak_self.clone())
                    .build()
                    .expect("kernel task creation cannot fail");
                Thread {
                    tid,
                    name: Mutex::new(name.to_string()),
                    process: Arc::downgrade(&process),
                    task,
                    sig_pending: AtomicSigSet::new_empty(),
                    sig_blocked: AtomicSigSet::new_empty(),
                    wait_mode: SpinLock::new(WaitMode::None),
                    exit_code: AtomicI32::new(0),
                }
            })
        });
        process.threads().lock().push(thread.clone());
        thread
    }

    /// Gets the thread running on the processor, if its task belongs to
    /// one.
    pub fn current() -> Option<Arc<Thread>> {
        let task = processor::current_task()?;
        Self::from_task(&task)
    }

    /// Recovers the thread a task belongs to.
    pub fn from_task(task: &Arc<Task>) -> Option<Arc<Thread>> {
        task.data().downcast_ref::<Weak<Thread>>()?.upgrade()
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.upgrade()
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn sig_pending(&self) -> &AtomicSigSet {
        &self.sig_pending
    }

    pub fn sig_blocked(&self) -> &AtomicSigSet {
        &self.sig_blocked
    }

    pub fn wait_mode(&self) -> WaitMode {
        *self.wait_mode.lock()
    }

    pub fn set_wait_mode(&self, mode: WaitMode) {
        *self.wait_mode.lock() = mode;
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Relaxed)
    }

    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::Relaxed);
    }

    pub fn status(&self) -> TaskStatus {
        self.task.status()
    }

    pub fn is_zombie(&self) -> bool {
        self.status() == TaskStatus::Zombie
    }

    /// Starts (or resumes) the thread.
    pub fn run(&self) {
        scheduler::wake(&self.task);
    }
}

impl Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("status", &self.status())
            .finish()
    }
}
