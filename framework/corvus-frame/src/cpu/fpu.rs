// SPDX-License-Identifier: MPL-2.0

//! The lazy x87+SSE state switch.
//!
//! The FPU registers belong to at most one task (the owner). A task
//! switch clears the CR0 task-switched shadow and either swaps state
//! eagerly (for tasks that use the FPU often) or arms the shadow so that
//! the next FPU instruction traps and the swap happens then.

use core::sync::atomic::{AtomicBool, Ordering};

use lazy_static::lazy_static;

use crate::config::FPU_EAGER_THRESHOLD;
use crate::prelude::*;
use crate::sync::SpinLock;
use crate::task::{processor, Task};

/// Size of an FXSAVE area.
pub const FPU_STATE_SIZE: usize = 512;

/// Initial x87 control word.
const FPU_INIT_CTRL: u16 = 0x037F;
/// Initial MXCSR value.
const MXCSR_INIT: u16 = 0x1F80;

/// A saved x87+SSE register file in FXSAVE layout.
pub struct FpuArea(pub [u8; FPU_STATE_SIZE]);

impl FpuArea {
    fn new_initialized() -> Box<Self> {
        let mut area = Box::new(FpuArea([0u8; FPU_STATE_SIZE]));
        area.0[0..2].copy_from_slice(&FPU_INIT_CTRL.to_le_bytes());
        // MXCSR and its mask live at bytes 24 and 26 of the save area.
        area.0[24..26].copy_from_slice(&MXCSR_INIT.to_le_bytes());
        area.0[26..28].copy_from_slice(&0xFFFFu16.to_le_bytes());
        area
    }
}

struct FpuUnit {
    /// The task whose registers are in the FPU, if any.
    owner: Option<Arc<Task>>,
    /// The emulated hardware register file.
    regs: [u8; FPU_STATE_SIZE],
}

lazy_static! {
    static ref FPU: SpinLock<FpuUnit> = SpinLock::new(FpuUnit {
        owner: None,
        regs: [0u8; FPU_STATE_SIZE],
    });
}

/// Shadow of the CR0 task-switched bit.
static CR0_TS: AtomicBool = AtomicBool::new(false);

pub(crate) fn init() {
    lazy_static::initialize(&FPU);
}

/// Whether the task-switched bit is armed (the next FPU instruction
/// would trap).
pub fn cr0_ts() -> bool {
    CR0_TS.load(Ordering::Relaxed)
}

/// Called by the scheduler after every task switch.
pub fn task_switched() {
    CR0_TS.store(false, Ordering::Relaxed);

    let Some(current) = processor::current_task() else {
        return;
    };

    let mut unit = FPU.lock();
    let owned_by_current = unit
        .owner
        .as_ref()
        .map(|owner| Arc::ptr_eq(owner, &current))
        .unwrap_or(false);
    if owned_by_current {
        return;
    }

    if current.fpu_switches() >= FPU_EAGER_THRESHOLD {
        do_switch(&mut unit, &current);
    } else {
        // Lazy: trap on the first FPU instruction.
        CR0_TS.store(true, Ordering::Relaxed);
    }
}

/// The no-math-coprocessor trap. Returns `false` when the trap does not
/// correspond to a lazy switch (the caller raises SIGFPE). A trap in
/// kernel mode is fatal.
pub fn handle_no_math_trap(user_mode: bool) -> bool {
    if !user_mode {
        panic!("FPU trap in kernel mode: the kernel must not use the FPU");
    }

    let Some(current) = processor::current_task() else {
        return false;
    };

    let mut unit = FPU.lock();
    let owned_by_current = unit
        .owner
        .as_ref()
        .map(|owner| Arc::ptr_eq(owner, &current))
        .unwrap_or(false);
    if owned_by_current {
        return false;
    }

    CR0_TS.store(false, Ordering::Relaxed);
    do_switch(&mut unit, &current);
    true
}

/// Swaps the register file: saves the owner's state, loads (allocating
/// and initializing if needed) the incoming task's state.
fn do_switch(unit: &mut FpuUnit, incoming: &Arc<Task>) {
    if let Some(owner) = unit.owner.take() {
        let mut state = owner.fpu_state().lock();
        if let Some(area) = state.as_mut() {
            area.0.copy_from_slice(&unit.regs);
        }
    }

    {
        let mut state = incoming.fpu_state().lock();
        let area = state.get_or_insert_with(FpuArea::new_initialized);
        unit.regs.copy_from_slice(&area.0);
    }

    incoming.bump_fpu_switches();
    unit.owner = Some(incoming.clone());
}

/// Releases a task's FPU state when it is reaped.
pub fn drop_state(task: &Arc<Task>) {
    let mut unit = FPU.lock();
    if let Some(owner) = unit.owner.as_ref() {
        if Arc::ptr_eq(owner, task) {
            unit.owner = None;
        }
    }
    *task.fpu_state().lock() = None;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mm::test_util::mm_lock;
    use crate::task::TaskOptions;

    fn new_task() -> Arc<Task> {
        TaskOptions::new_kernel(0, 0).data(()).build().unwrap()
    }

    fn reset() {
        let mut unit = FPU.lock();
        unit.owner = None;
        unit.regs = [0u8; FPU_STATE_SIZE];
        CR0_TS.store(false, Ordering::Relaxed);
    }

    #[test]
    fn lazy_switch_arms_ts_until_trap() {
        let _guard = mm_lock();
        reset();
        let task = new_task();
        processor::set_current_task(task.clone());

        task_switched();
        assert!(cr0_ts());
        assert!(task.fpu_state().lock().is_none());

        // The first FPU instruction traps and performs the swap.
        assert!(handle_no_math_trap(true));
        assert!(!cr0_ts());
        assert!(task.fpu_state().lock().is_some());
        assert_eq!(task.fpu_switches(), 1);

        // A second trap while owning the FPU is a real fault.
        assert!(!handle_no_math_trap(true));
        reset();
    }

    #[test]
    fn eager_switch_after_threshold() {
        let _guard = mm_lock();
        reset();
        let task = new_task();
        processor::set_current_task(task.clone());
        for _ in 0..FPU_EAGER_THRESHOLD {
            task.bump_fpu_switches();
        }

        task_switched();
        // Promoted to eager: the state was swapped in immediately.
        assert!(!cr0_ts());
        assert!(task.fpu_state().lock().is_some());
        reset();
    }

    #[test]
    fn initial_state_carries_control_words() {
        let area = FpuArea::new_initialized();
        assert_eq!(u16::from_le_bytes(area.0[0..2].try_into().unwrap()), 0x037F);
        assert_eq!(u16::from_le_bytes(area.0[24..26].try_into().unwrap()), 0x1F80);
    }

    #[test]
    fn switch_preserves_owner_state() {
        let _guard = mm_lock();
        reset();
        let first = new_task();
        let second = new_task();

        processor::set_current_task(first.clone());
        assert!(handle_no_math_trap(true));

        // Scribble on the "hardware" registers while first owns them.
        FPU.lock().regs[100] = 0xAB;

        processor::set_current_task(second.clone());
        assert!(handle_no_math_trap(true));

        // First's scribble was saved into its own area.
        assert_eq!(first.fpu_state().lock().as_ref().unwrap().0[100], 0xAB);
        // Second starts from the initial control words.
        assert_eq!(FPU.lock().regs[0], 0x7F);
        reset();
    }
}
