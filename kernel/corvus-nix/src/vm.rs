// SPDX-License-Identifier: MPL-2.0

//! The service-layer end of the page-fault path.
//!
//! The trap dispatcher (a collaborator outside this repository) lands
//! here with the faulting address and error code. The frame handles
//! demand paging and copy-on-write; what it cannot handle either kills
//! the faulting process or, for kernel-mode faults, panics inside the
//! frame.

use corvus_frame::cpu::fpu;
use corvus_frame::mm::page_fault::{self, PageFaultInfo};

use crate::process::signal::{self, constants::SIGFPE, constants::SIGSEGV};

/// Entry point for page faults taken while running a thread.
pub fn handle_page_fault(info: &PageFaultInfo) {
    if page_fault::handle_page_fault(info).is_err() {
        // Out of valid area in user mode: the faulting thread gets a
        // SIGSEGV, and a process that ignores or blocks it is terminated
        // outright.
        signal::send_or_crash(SIGSEGV);
    }
}

/// Entry point for the no-math-coprocessor trap: either the lazy FPU
/// swap, or a real math fault.
pub fn handle_no_math_trap(user_mode: bool) {
    if !fpu::handle_no_math_trap(user_mode) {
        signal::send_or_crash(SIGFPE);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::process::signal::sig_action::SigAction;
    use crate::test_util::{back_to_kernel, kernel_lock, run_as, spawn_user_process};
    use corvus_frame::mm::page_fault::PageFaultCode;
    use corvus_frame::mm::RegionFlags;

    #[test]
    fn unmapped_user_fault_raises_sigsegv() {
        let _guard = kernel_lock();
        let (_process, thread) = spawn_user_process("segv", None);
        run_as(&thread);

        handle_page_fault(&PageFaultInfo {
            addr: 0x7000,
            code: PageFaultCode::USER | PageFaultCode::WRITE,
        });
        assert!(thread.sig_pending().contains(SIGSEGV));
        back_to_kernel();
    }

    #[test]
    fn ignored_sigsegv_terminates_the_process() {
        let _guard = kernel_lock();
        let (process, thread) = spawn_user_process("segv-ign", None);
        run_as(&thread);
        signal::set_action(&process, SIGSEGV, SigAction::Ign);

        handle_page_fault(&PageFaultInfo {
            addr: 0x7000,
            code: PageFaultCode::USER | PageFaultCode::WRITE,
        });
        assert!(process.is_zombie());
        assert_eq!(process.exit_code(), -(SIGSEGV.as_u8() as i32));
        crate::process::reaper::drain();
        back_to_kernel();
    }

    #[test]
    fn fault_inside_region_is_handled() {
        let _guard = kernel_lock();
        let (process, thread) = spawn_user_process("segv-ok", None);
        run_as(&thread);
        process
            .mem_ctx()
            .unwrap()
            .create_region(0x2000, 0x2000, RegionFlags::READABLE | RegionFlags::WRITABLE)
            .unwrap();

        handle_page_fault(&PageFaultInfo {
            addr: 0x3000,
            code: PageFaultCode::USER | PageFaultCode::WRITE,
        });
        assert!(!thread.sig_pending().contains(SIGSEGV));
        assert!(process.mem_ctx().unwrap().translate(0x3000).is_some());
        back_to_kernel();
    }
}
