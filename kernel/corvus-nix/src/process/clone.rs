// SPDX-License-Identifier: MPL-2.0

use corvus_frame::mm::context::MemContext;

use super::{Process, Thread};
use crate::prelude::*;

/// Forks the current process. The child gets a copy-on-write clone of
/// the caller's address space, a clone of its I/O context, a copy of the
/// signal dispositions, and one thread resuming at `entry` on
/// `user_stack` with the forking thread's blocked mask and TLS
/// descriptor. The new thread is woken before returning.
pub fn fork(entry: u32, user_stack: u32) -> Result<Arc<Process>> {
    let parent = current!();
    if parent.is_kernel() {
        error!("fork: attempt to fork the kernel process");
        return_errno_with_message!(Errno::EPERM, "the kernel process cannot fork");
    }
    let parent_thread = Thread::current().expect("fork: no current thread");

    let child = Process::new(&parent.name(), Some(&parent));

    // Signal dispositions are copied, not shared.
    *child.sig_dispositions().lock() = parent.sig_dispositions().lock().clone_table();

    child.set_mem_ctx(MemContext::clone_current());

    let io_ctx = parent
        .io_ctx()
        .ok_or_else(|| Error::with_message(Errno::EINVAL, "fork: parent has no I/O context"))?;
    child.set_io_ctx(io_ctx.clone_context());

    let child_thread = Thread::new_user(&parent_thread.name(), &child, entry, user_stack)?;
    child_thread
        .sig_blocked()
        .store(parent_thread.sig_blocked().load());
    child_thread
        .task()
        .set_tls_descriptor(parent_thread.task().tls_descriptor());

    child_thread.run();
    Ok(child)
}
