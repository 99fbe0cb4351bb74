// SPDX-License-Identifier: MPL-2.0

//! Tasks: the schedulable unit.

pub mod preempt;
pub mod processor;
pub mod scheduler;

use core::any::Any;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use intrusive_collections::{intrusive_adapter, LinkedListAtomicLink};

use crate::config::{INITIAL_QUANTUM, KERNEL_STACK_SIZE, PAGE_SIZE};
use crate::cpu::fpu::FpuArea;
use crate::error::Error;
use crate::mm::context::MemContext;
use crate::mm::physical::{self, MemZone};
use crate::mm::{FrameNumber, Paddr};
use crate::prelude::*;
use crate::sync::SpinLock;

/// Linkage addresses of the mode-transition trampolines in the kernel
/// text. The software machine model only stores them in synthetic stack
/// frames and register images.
pub const TRAMPOLINE_USER_THREAD_ENTRY: u32 = 0xC010_0000;
pub const TRAMPOLINE_KERNEL_THREAD_RETURN: u32 = 0xC010_0010;
pub const TRAMPOLINE_SIGNAL_RETURN: u32 = 0xC010_0020;

/// The TLS descriptor every new task starts with.
pub const NULL_TLS_DESCRIPTOR: u64 = 0x0040_F200_0000_0000;

const USER_CODE_SELECTOR: u32 = 0x1B;
const USER_DATA_SELECTOR: u32 = 0x23;
const INITIAL_EFLAGS: u32 = 0x202;

/// The scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Created but never woken.
    Startup,
    /// Running or queued to run.
    Running,
    /// Blocked; signals may cancel the wait.
    InterruptibleWait,
    /// Blocked until explicitly woken.
    UninterruptibleWait,
    /// Terminated and awaiting the reaper.
    Zombie,
}

/// A one-page kernel stack allocated from the physical allocator.
pub struct KernelStack {
    frame: FrameNumber,
}

const_assert!(KERNEL_STACK_SIZE == PAGE_SIZE);

impl KernelStack {
    fn new() -> Self {
        let frame = physical::alloc_zeroed(MemZone::Kernel);
        Self { frame }
    }

    pub fn frame(&self) -> FrameNumber {
        self.frame
    }

    /// The stack ceiling, as a physical address in the emulated arena.
    pub fn top(&self) -> Paddr {
        (self.frame + 1) * PAGE_SIZE
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        physical::free(self.frame, 1);
    }
}

struct TaskInner {
    status: TaskStatus,
    /// Set when a signal cancelled this task's interruptible wait.
    interrupted: bool,
    quantum: u32,
    /// Saved stack pointer while the task is switched out.
    kstack_ptr: Paddr,
}

/// A task: the unit of scheduling.
///
/// Kernel-side identity (thread id, owning process, signal state) lives
/// in the service layer and hangs off `data`.
pub struct Task {
    inner: SpinLock<TaskInner>,
    kstack: KernelStack,
    mem_ctx: Option<Arc<MemContext>>,
    tls_descriptor: AtomicU64,
    fpu_state: SpinLock<Option<Box<FpuArea>>>,
    fpu_switches: AtomicU8,
    data: Box<dyn Any + Send + Sync>,
    run_link: LinkedListAtomicLink,
    wait_link: LinkedListAtomicLink,
}

intrusive_adapter!(pub RunQueueAdapter = Arc<Task>: Task { run_link: LinkedListAtomicLink });
intrusive_adapter!(pub WaitQueueAdapter = Arc<Task>: Task { wait_link: LinkedListAtomicLink });

impl Task {
    /// Gets the current task.
    pub fn current() -> Arc<Task> {
        processor::current_task().expect("no current task")
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.lock().status
    }

    /// Sets the scheduling state directly. Used at bring-up and by the
    /// service layer's exit paths.
    pub fn set_status(&self, status: TaskStatus) {
        self.inner.lock().status = status;
    }

    pub fn interrupted(&self) -> bool {
        self.inner.lock().interrupted
    }

    pub(crate) fn set_interrupted(&self, interrupted: bool) {
        self.inner.lock().interrupted = interrupted;
    }

    pub fn quantum(&self) -> u32 {
        self.inner.lock().quantum
    }

    pub(crate) fn reset_quantum(&self) {
        self.inner.lock().quantum = INITIAL_QUANTUM;
    }

    /// Charges one timer tick; returns the remaining quantum.
    pub(crate) fn charge_tick(&self) -> u32 {
        let mut inner = self.inner.lock();
        if inner.quantum > 0 {
            inner.quantum -= 1;
        }
        inner.quantum
    }

    pub fn mem_ctx(&self) -> Option<&Arc<MemContext>> {
        self.mem_ctx.as_ref()
    }

    /// Whether this task runs in the kernel process (no user context).
    pub fn is_kernel_task(&self) -> bool {
        self.mem_ctx.is_none()
    }

    pub fn kstack(&self) -> &KernelStack {
        &self.kstack
    }

    pub fn tls_descriptor(&self) -> u64 {
        self.tls_descriptor.load(Ordering::Relaxed)
    }

    pub fn set_tls_descriptor(&self, descriptor: u64) {
        self.tls_descriptor.store(descriptor, Ordering::Relaxed);
    }

    pub(crate) fn fpu_state(&self) -> &SpinLock<Option<Box<FpuArea>>> {
        &self.fpu_state
    }

    pub(crate) fn fpu_switches(&self) -> u8 {
        self.fpu_switches.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_fpu_switches(&self) {
        let _ = self
            .fpu_switches
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                Some(count.saturating_add(1))
            });
    }

    /// Returns the task data.
    pub fn data(&self) -> &Box<dyn Any + Send + Sync> {
        &self.data
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.run_link.is_linked()
    }

    pub(crate) fn is_on_wait_queue(&self) -> bool {
        self.wait_link.is_linked()
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("status", &self.status())
            .field("kstack_frame", &self.kstack.frame())
            .finish()
    }
}

enum EntryKind {
    /// Resumes at an internal trampoline that IRETs into user mode.
    User { entry: u32, user_stack: u32 },
    /// Calls the kernel entry, then a return trampoline that exits the
    /// thread.
    Kernel { entry: u32, arg: u32 },
}

/// Options to create a new task.
pub struct TaskOptions {
    kind: EntryKind,
    data: Option<Box<dyn Any + Send + Sync>>,
    mem_ctx: Option<Arc<MemContext>>,
    tls_descriptor: u64,
}

impl TaskOptions {
    /// A task that enters user mode at `entry` with the given stack.
    pub fn new_user(entry: u32, user_stack: u32) -> Self {
        Self {
            kind: EntryKind::User { entry, user_stack },
            data: None,
            mem_ctx: None,
            tls_descriptor: NULL_TLS_DESCRIPTOR,
        }
    }

    /// A kernel task running `entry(arg)`.
    pub fn new_kernel(entry: u32, arg: u32) -> Self {
        Self {
            kind: EntryKind::Kernel { entry, arg },
            data: None,
            mem_ctx: None,
            tls_descriptor: NULL_TLS_DESCRIPTOR,
        }
    }

    pub fn data<T>(mut self, data: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.data = Some(Box::new(data));
        self
    }

    /// Sets the address space the task runs in. Tasks without one belong
    /// to the kernel.
    pub fn mem_ctx(mut self, mem_ctx: Option<Arc<MemContext>>) -> Self {
        self.mem_ctx = mem_ctx;
        self
    }

    pub fn tls_descriptor(mut self, descriptor: u64) -> Self {
        self.tls_descriptor = descriptor;
        self
    }

    /// Builds the task in the `Startup` state with its synthetic initial
    /// switch frame written onto the kernel stack.
    pub fn build(self) -> Result<Arc<Task>> {
        let kstack = KernelStack::new();

        let words: Vec<u32> = match self.kind {
            EntryKind::User { entry, user_stack } => vec![
                0, // initial edi
                0, // initial esi
                0, // initial ebx
                0, // initial ebp
                TRAMPOLINE_USER_THREAD_ENTRY,
                0, // discarded
                0, // discarded
                entry,
                USER_CODE_SELECTOR,
                INITIAL_EFLAGS,
                user_stack,
                USER_DATA_SELECTOR,
            ],
            EntryKind::Kernel { entry, arg } => vec![
                0, // initial edi
                0, // initial esi
                0, // initial ebx
                0, // initial ebp
                entry,
                0, // discarded
                0, // discarded
                TRAMPOLINE_KERNEL_THREAD_RETURN,
                arg,
            ],
        };

        let frame_bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let offset = PAGE_SIZE - frame_bytes.len();
        physical::copy_into_frame(kstack.frame(), offset, &frame_bytes);
        let kstack_ptr = kstack.frame() * PAGE_SIZE + offset;

        let data = self.data.ok_or(Error::InvalidArgs)?;
        Ok(Arc::new(Task {
            inner: SpinLock::new(TaskInner {
                status: TaskStatus::Startup,
                interrupted: false,
                quantum: INITIAL_QUANTUM,
                kstack_ptr,
            }),
            kstack,
            mem_ctx: self.mem_ctx,
            tls_descriptor: AtomicU64::new(self.tls_descriptor),
            fpu_state: SpinLock::new(None),
            fpu_switches: AtomicU8::new(0),
            data,
            run_link: LinkedListAtomicLink::new(),
            wait_link: LinkedListAtomicLink::new(),
        }))
    }
}

pub(crate) fn init() {
    processor::init();
}
