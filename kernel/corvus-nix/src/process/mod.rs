// SPDX-License-Identifier: MPL-2.0

//! Processes, threads and their lifecycle.

mod clone;
pub mod credentials;
mod exit;
pub mod reaper;
pub mod signal;
pub mod table;
mod thread;
mod wait;

pub use self::clone::fork;
pub use self::credentials::Credentials;
pub use self::exit::{exit_process, exit_thread};
pub use self::thread::{Thread, WaitMode};
pub use self::wait::{wait_process, wait_thread, WaitOptions};

use core::sync::atomic::{AtomicI32, Ordering};

use corvus_frame::mm::context::MemContext;
use corvus_frame::task::{processor, scheduler, TaskStatus};
use spin::Once;

use self::signal::sig_action::SigDispositions;
use self::signal::sig_mask::AtomicSigSet;
use crate::fs::io_context::IoContext;
use crate::prelude::*;

/// Process id.
pub type Pid = u32;
/// Thread id, unique across all threads.
pub type Tid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessStatus {
    Runnable,
    Zombie,
}

/// A process: a set of threads sharing memory, I/O and security
/// contexts.
pub struct Process {
    pid: Pid,
    name: Mutex<String>,
    parent: Mutex<Weak<Process>>,
    children: Mutex<BTreeMap<Pid, Arc<Process>>>,
    threads: Mutex<Vec<Arc<Thread>>>,
    mem_ctx: Mutex<Option<Arc<MemContext>>>,
    io_ctx: Mutex<Option<Arc<IoContext>>>,
    credentials: Credentials,
    sig_dispositions: Mutex<SigDispositions>,
    sig_pending: AtomicSigSet,
    status: Mutex<ProcessStatus>,
    exit_code: AtomicI32,
    alarm_deadline: Mutex<Option<u64>>,
}

impl Process {
    /// Creates an empty process linked under `parent`.
    pub fn new(name: &str, parent: Option<&Arc<Process>>) -> Arc<Process> {
        let parent_weak = parent.map(Arc::downgrade).unwrap_or_default();
        let process = table::attach_process(|pid| {
            Arc::new(Process {
                pid,
                name: Mutex::new(name.to_string()),
                parent: Mutex::new(parent_weak),
                children: Mutex::new(BTreeMap::new()),
                threads: Mutex::new(Vec::new()),
                mem_ctx: Mutex::new(None),
                io_ctx: Mutex::new(None),
                credentials: Credentials::new_root(),
                sig_dispositions: Mutex::new(SigDispositions::new()),
                sig_pending: AtomicSigSet::new_empty(),
                status: Mutex::new(ProcessStatus::Runnable),
                exit_code: AtomicI32::new(0),
                alarm_deadline: Mutex::new(None),
            })
        });
        if let Some(parent) = parent {
            parent.children.lock().insert(process.pid, process.clone());
        }
        process
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.lock().upgrade()
    }

    pub(crate) fn set_parent(&self, parent: &Arc<Process>) {
        *self.parent.lock() = Arc::downgrade(parent);
    }

    pub(crate) fn children(&self) -> &Mutex<BTreeMap<Pid, Arc<Process>>> {
        &self.children
    }

    pub fn has_child(&self, pid: Pid) -> bool {
        self.children.lock().contains_key(&pid)
    }

    pub fn threads(&self) -> &Mutex<Vec<Arc<Thread>>> {
        &self.threads
    }

    pub fn mem_ctx(&self) -> Option<Arc<MemContext>> {
        self.mem_ctx.lock().clone()
    }

    pub(crate) fn set_mem_ctx(&self, ctx: Arc<MemContext>) {
        *self.mem_ctx.lock() = Some(ctx);
    }

    pub(crate) fn take_mem_ctx(&self) -> Option<Arc<MemContext>> {
        self.mem_ctx.lock().take()
    }

    pub fn io_ctx(&self) -> Option<Arc<IoContext>> {
        self.io_ctx.lock().clone()
    }

    pub(crate) fn set_io_ctx(&self, ctx: Arc<IoContext>) {
        *self.io_ctx.lock() = Some(ctx);
    }

    pub(crate) fn take_io_ctx(&self) -> Option<Arc<IoContext>> {
        self.io_ctx.lock().take()
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn sig_dispositions(&self) -> &Mutex<SigDispositions> {
        &self.sig_dispositions
    }

    pub fn sig_pending(&self) -> &AtomicSigSet {
        &self.sig_pending
    }

    pub fn is_zombie(&self) -> bool {
        *self.status.lock() == ProcessStatus::Zombie
    }

    pub(crate) fn set_zombie(&self) {
        *self.status.lock() = ProcessStatus::Zombie;
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Relaxed)
    }

    pub(crate) fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::Relaxed);
    }

    pub(crate) fn alarm_deadline(&self) -> &Mutex<Option<u64>> {
        &self.alarm_deadline
    }

    /// Whether this is the kernel process.
    pub fn is_kernel(&self) -> bool {
        self.pid == 0
    }
}

impl Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name())
            .finish()
    }
}

static KERNEL_PROCESS: Once<Arc<Process>> = Once::new();

/// The kernel process: pid 0, owner of all kernel threads and adoptive
/// parent of orphans.
pub fn kernel_process() -> Arc<Process> {
    KERNEL_PROCESS
        .get()
        .expect("process subsystem is not initialized")
        .clone()
}

/// The process of the current thread.
pub fn current() -> Arc<Process> {
    Thread::current()
        .expect("no current thread")
        .process()
        .expect("current thread has no process")
}

pub(crate) fn init() {
    let kernel = Process::new("kernel", None);
    debug_assert_eq!(kernel.pid, 0);
    KERNEL_PROCESS.call_once(|| kernel);

    scheduler::set_signal_pending_hook(signal::task_has_deliverable_signal);

    // The dedicated idle thread runs when the queue is empty.
    let idle = Thread::new_kernel("idle", 0, 0);
    processor::set_idle_task(idle.task().clone());

    reaper::init();

    // The boot flow of control becomes a kernel thread.
    let boot = Thread::new_kernel("boot", 0, 0);
    boot.task().set_status(TaskStatus::Running);
    processor::set_current_task(boot.task().clone());
}

#[cfg(test)]
mod test {
    use super::signal::constants::{SIGINT, SIGKILL};
    use super::signal::sig_action::SigAction;
    use super::signal::sig_mask::SigSet;
    use super::signal::{self, MaskOp};
    use super::*;
    use crate::test_util::{back_to_kernel, kernel_lock, run_as, spawn_user_process};
    use corvus_frame::cpu::UserContext;
    use corvus_frame::mm::io;
    use corvus_frame::mm::physical;
    use corvus_frame::mm::RegionFlags;

    #[test]
    fn create_process_links_parent_and_children() {
        let _guard = kernel_lock();
        let parent = Process::new("parent", None);
        let child = Process::new("child", Some(&parent));

        assert_ne!(parent.pid(), child.pid());
        assert_eq!(child.parent().unwrap().pid(), parent.pid());
        assert!(parent.has_child(child.pid()));
        assert!(table::process_with_pid(child.pid()).is_some());
    }

    #[test]
    fn fork_is_copy_on_write() {
        let _guard = kernel_lock();
        let (parent, parent_thread) = spawn_user_process("forker", None);
        run_as(&parent_thread);

        let parent_ctx = parent.mem_ctx().unwrap();
        parent_ctx
            .create_region(0x10000, 0x1000, RegionFlags::READABLE | RegionFlags::WRITABLE)
            .unwrap();
        io::write_bytes(0x10000, &[0xAA]).unwrap();

        let (frame, writable) = parent_ctx.translate(0x10000).unwrap();
        assert!(writable);
        assert_eq!(physical::ref_count(frame), 1);

        let child = fork(0x0804_8000, 0xBFFF_F000).unwrap();
        let child_ctx = child.mem_ctx().unwrap();

        // Both sides share the frame read-only until a write fault.
        assert_eq!(physical::ref_count(frame), 2);
        assert_eq!(parent_ctx.translate(0x10000), Some((frame, false)));
        assert_eq!(child_ctx.translate(0x10000), Some((frame, false)));

        // The child writes; it must end up owning a distinct frame.
        let child_thread = child.threads().lock()[0].clone();
        run_as(&child_thread);
        io::write_bytes(0x10000, &[0xBB]).unwrap();

        let (child_frame, writable) = child_ctx.translate(0x10000).unwrap();
        assert_ne!(child_frame, frame);
        assert!(writable);
        assert_eq!(physical::ref_count(frame), 1);

        let mut byte = [0u8; 1];
        io::read_bytes(0x10000, &mut byte).unwrap();
        assert_eq!(byte[0], 0xBB);

        run_as(&parent_thread);
        io::read_bytes(0x10000, &mut byte).unwrap();
        assert_eq!(byte[0], 0xAA);

        // The child exits; the pre-fork frame survives with the parent.
        run_as(&child_thread);
        exit_process(0);
        drop(child_thread);
        drop(child_ctx);

        run_as(&parent_thread);
        let child_pid = child.pid();
        drop(child);
        assert_eq!(
            wait_process(child_pid as i32, WaitOptions::empty()).unwrap(),
            Some((child_pid, 0))
        );
        assert_eq!(physical::ref_count(frame), 1);

        // Only after the parent exits too is the frame freed.
        exit_process(0);
        reaper::drain();
        drop(parent_thread);
        drop(parent_ctx);
        assert_eq!(physical::ref_count(frame), 0);
        back_to_kernel();
    }

    #[test]
    fn fork_copies_dispositions_and_mask() {
        let _guard = kernel_lock();
        let (parent, parent_thread) = spawn_user_process("fork-sigs", None);
        run_as(&parent_thread);

        signal::set_action(&parent, SIGINT, SigAction::Ign);
        signal::set_mask(&parent_thread, MaskOp::Block, SigSet::from(SIGINT));

        let child = fork(0x0804_8000, 0xBFFF_F000).unwrap();
        assert_eq!(
            child.sig_dispositions().lock().get(SIGINT),
            SigAction::Ign
        );
        let child_thread = child.threads().lock()[0].clone();
        assert!(child_thread.sig_blocked().contains(SIGINT));

        // Changing the child's table must not touch the parent's.
        signal::set_action(&child, SIGINT, SigAction::Dfl);
        assert_eq!(parent.sig_dispositions().lock().get(SIGINT), SigAction::Ign);
        back_to_kernel();
    }

    #[test]
    fn kernel_process_cannot_fork() {
        let _guard = kernel_lock();
        let boot = Thread::new_kernel("fork-denied", 0, 0);
        run_as(&boot);
        assert_eq!(
            fork(0, 0).unwrap_err().error(),
            Errno::EPERM
        );
        back_to_kernel();
    }

    #[test]
    fn wait_reaps_zombie_child() {
        let _guard = kernel_lock();
        let (parent, parent_thread) = spawn_user_process("wait-parent", None);
        let (child, child_thread) = spawn_user_process("wait-child", Some(&parent));

        run_as(&child_thread);
        exit_process(42);
        assert!(child.is_zombie());
        drop(child_thread);

        run_as(&parent_thread);
        let child_pid = child.pid();
        drop(child);
        assert_eq!(
            wait_process(-1, WaitOptions::empty()).unwrap(),
            Some((child_pid, 42))
        );
        // The child is gone from the tables.
        assert!(table::process_with_pid(child_pid).is_none());
        assert!(!parent.has_child(child_pid));
        back_to_kernel();
    }

    #[test]
    fn wait_nohang_and_echild() {
        let _guard = kernel_lock();
        let (_parent, parent_thread) = spawn_user_process("wait-nohang", None);
        run_as(&parent_thread);

        // No children at all.
        assert_eq!(
            wait_process(-1, WaitOptions::empty()).unwrap_err().error(),
            Errno::ECHILD
        );
        // Unknown specific pid.
        assert_eq!(
            wait_process(0x7FFF_0000, WaitOptions::empty())
                .unwrap_err()
                .error(),
            Errno::ECHILD
        );
        // Reserved selectors.
        assert_eq!(
            wait_process(0, WaitOptions::empty()).unwrap_err().error(),
            Errno::ENOSYS
        );
        assert_eq!(
            wait_process(-2, WaitOptions::empty()).unwrap_err().error(),
            Errno::ENOSYS
        );
        back_to_kernel();
    }

    #[test]
    fn wait_running_child_with_nohang_returns_none() {
        let _guard = kernel_lock();
        let (parent, parent_thread) = spawn_user_process("nohang-parent", None);
        let (_child, _child_thread) = spawn_user_process("nohang-child", Some(&parent));
        run_as(&parent_thread);
        assert_eq!(wait_process(-1, WaitOptions::NOHANG).unwrap(), None);
        back_to_kernel();
    }

    #[test]
    fn wait_is_interrupted_by_deliverable_signal() {
        let _guard = kernel_lock();
        let (parent, parent_thread) = spawn_user_process("eintr-parent", None);
        let (_child, _child_thread) = spawn_user_process("eintr-child", Some(&parent));
        run_as(&parent_thread);

        // An ignored signal is dropped at send time and interrupts
        // nothing.
        signal::set_action(&parent, SIGINT, SigAction::Ign);
        signal::send_to_process(&parent, SIGINT);
        assert!(!signal::has_deliverable_signal(&parent_thread));
        assert_eq!(wait_process(-1, WaitOptions::NOHANG).unwrap(), None);

        // With a handler installed the pending signal cancels the wait.
        signal::set_action(
            &parent,
            SIGINT,
            SigAction::User {
                handler_addr: 0x9000,
                flags: super::signal::sig_action::SigActionFlags::empty(),
                mask: SigSet::new_empty(),
            },
        );
        signal::send_to_process(&parent, SIGINT);
        assert_eq!(
            wait_process(-1, WaitOptions::empty()).unwrap_err().error(),
            Errno::EINTR
        );
        back_to_kernel();
    }

    #[test]
    fn exit_reparents_children_to_kernel() {
        let _guard = kernel_lock();
        let (parent, parent_thread) = spawn_user_process("orphaner", None);
        let (child, _child_thread) = spawn_user_process("orphan", Some(&parent));

        run_as(&parent_thread);
        exit_process(0);

        assert_eq!(child.parent().unwrap().pid(), 0);
        assert!(kernel_process().has_child(child.pid()));
        reaper::drain();
        back_to_kernel();
    }

    #[test]
    fn exit_process_kills_sibling_threads() {
        let _guard = kernel_lock();
        let (process, main_thread) = spawn_user_process("multi", None);
        let second = Thread::new_user("multi-2", &process, 0x0804_8000, 0xBFFF_0000).unwrap();

        run_as(&main_thread);
        exit_process(3);

        assert!(main_thread.is_zombie());
        assert!(!process.is_zombie());
        assert!(second.sig_pending().contains(SIGKILL));

        // The surviving thread observes the KILL on its next return to
        // user mode and takes the process down with the stored code.
        run_as(&second);
        let mut ctx = UserContext::default();
        signal::deliver_pending(&mut ctx);
        assert!(second.is_zombie());
        assert!(process.is_zombie());
        assert_eq!(process.exit_code(), 3);
        reaper::drain();
        back_to_kernel();
    }

    #[test]
    fn kill_is_unmaskable() {
        let _guard = kernel_lock();
        let (process, thread) = spawn_user_process("killed", None);
        run_as(&thread);

        // Block everything and ignore everything; KILL cuts through.
        let mut everything = SigSet::new_empty();
        for num in 1..=super::signal::constants::SIG_MAX {
            everything.add_signal(super::signal::constants::SigNum::from_u8(num));
        }
        signal::set_mask(&thread, MaskOp::Block, everything);
        signal::set_action(&process, SIGKILL, SigAction::Ign);

        signal::send_to_process(&process, SIGKILL);
        assert!(signal::has_deliverable_signal(&thread));

        let mut ctx = UserContext::default();
        signal::deliver_pending(&mut ctx);
        assert!(thread.is_zombie());
        assert!(process.is_zombie());
        assert_eq!(process.exit_code(), -(SIGKILL.as_u8() as i32));
        reaper::drain();
        back_to_kernel();
    }

    #[test]
    fn wait_thread_reaps_sibling() {
        let _guard = kernel_lock();
        let (process, main_thread) = spawn_user_process("threads", None);
        let worker = Thread::new_user("worker", &process, 0x0804_8000, 0xBFFF_0000).unwrap();
        let worker_tid = worker.tid();

        run_as(&worker);
        exit_thread(9);
        assert!(worker.is_zombie());
        drop(worker);

        run_as(&main_thread);
        assert_eq!(
            wait_thread(worker_tid as i32, WaitOptions::empty()).unwrap(),
            Some((worker_tid, 9))
        );
        assert!(table::thread_with_tid(worker_tid).is_none());
        assert_eq!(process.threads().lock().len(), 1);
        back_to_kernel();
    }

    #[test]
    fn wait_thread_rejects_strangers() {
        let _guard = kernel_lock();
        let (_process, main_thread) = spawn_user_process("lonely", None);
        run_as(&main_thread);
        // No sibling threads at all.
        assert_eq!(
            wait_thread(-1, WaitOptions::empty()).unwrap_err().error(),
            Errno::ESRCH
        );
        back_to_kernel();
    }
}
