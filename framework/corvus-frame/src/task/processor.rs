// SPDX-License-Identifier: MPL-2.0

//! The processor: current-task tracking and the per-CPU register
//! shadows touched on a context switch.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use lazy_static::lazy_static;

use super::Task;
use crate::mm::Paddr;
use crate::prelude::*;
use crate::sync::SpinLock;

pub struct Processor {
    current: Option<Arc<Task>>,
    idle: Option<Arc<Task>>,
}

impl Processor {
    pub const fn new() -> Self {
        Self {
            current: None,
            idle: None,
        }
    }
}

lazy_static! {
    static ref PROCESSOR: SpinLock<Processor> = SpinLock::new(Processor::new());
}

/// Shadow of the TSS kernel-stack slot; zero while a kernel task runs.
static TSS_ESP0: AtomicUsize = AtomicUsize::new(0);
/// Shadow of the TLS descriptor slot in the GDT.
static GDT_TLS: AtomicU64 = AtomicU64::new(0);

pub(crate) fn init() {
    lazy_static::initialize(&PROCESSOR);
}

pub fn current_task() -> Option<Arc<Task>> {
    PROCESSOR.lock().current.clone()
}

/// Installs a task as current without scheduling. Used at bring-up to
/// seed the boot task, and by tests that act as the CPU.
pub fn set_current_task(task: Arc<Task>) {
    PROCESSOR.lock().current = Some(task);
}

pub(crate) fn idle_task() -> Option<Arc<Task>> {
    PROCESSOR.lock().idle.clone()
}

/// Registers the dedicated idle task that runs when the queue is empty.
pub fn set_idle_task(task: Arc<Task>) {
    PROCESSOR.lock().idle = Some(task);
}

pub(crate) fn set_tss_esp0(value: Paddr) {
    TSS_ESP0.store(value, Ordering::Relaxed);
}

/// The kernel-stack pointer the TSS would hand to the CPU on a
/// privilege-level switch.
pub fn tss_esp0() -> Paddr {
    TSS_ESP0.load(Ordering::Relaxed)
}

pub(crate) fn set_gdt_tls(descriptor: u64) {
    GDT_TLS.store(descriptor, Ordering::Relaxed);
}

/// The TLS descriptor currently installed in the GDT shadow.
pub fn gdt_tls() -> u64 {
    GDT_TLS.load(Ordering::Relaxed)
}
