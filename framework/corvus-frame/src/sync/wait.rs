// SPDX-License-Identifier: MPL-2.0

//! Wait queues.
//!
//! A wait queue is a FIFO of tasks awaiting one specific event. A task
//! may be a member of at most one wait queue at a time.

use alloc::sync::Arc;

use intrusive_collections::LinkedList;

use super::SpinLock;
use crate::task::{processor, scheduler, TaskStatus, WaitQueueAdapter};

pub struct WaitQueue {
    waiters: SpinLock<LinkedList<WaitQueueAdapter>>,
}

impl WaitQueue {
    pub fn new() -> Self {
        WaitQueue {
            waiters: SpinLock::new(LinkedList::new(WaitQueueAdapter::new())),
        }
    }

    /// Appends the current task and blocks it until one of the
    /// `wake`-family methods releases it. Returns whether the wait was
    /// cancelled by a signal.
    pub fn wait(&self, interruptible: bool) -> bool {
        let Some(task) = processor::current_task() else {
            return false;
        };

        {
            let mut waiters = self.waiters.lock();
            debug_assert!(!task.is_on_wait_queue());
            waiters.push_back(task.clone());
        }

        let interrupted = scheduler::yield_block(interruptible);

        // Once released (a signal wake does not unlink), drop our link if
        // the waker did not already.
        let mut waiters = self.waiters.lock();
        if task.status() == TaskStatus::Running && task.is_on_wait_queue() {
            let mut cursor = unsafe { waiters.cursor_mut_from_ptr(Arc::as_ptr(&task)) };
            cursor.remove();
        }

        interrupted
    }

    /// Wakes the oldest waiter, if any.
    pub fn wake_one(&self) {
        let woken = self.waiters.lock().pop_front();
        if let Some(task) = woken {
            scheduler::wake(&task);
        }
    }

    /// Wakes every waiter.
    pub fn wake_all(&self) {
        loop {
            let woken = self.waiters.lock().pop_front();
            match woken {
                Some(task) => scheduler::wake(&task),
                None => break,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mm::test_util::mm_lock;
    use crate::task::{Task, TaskOptions};

    fn new_current() -> Arc<Task> {
        let task = TaskOptions::new_kernel(0, 0).data(()).build().unwrap();
        task.set_status(TaskStatus::Running);
        processor::set_current_task(task.clone());
        task
    }

    #[test]
    fn wait_parks_until_wake_one() {
        let _guard = mm_lock();
        let queue = WaitQueue::new();
        let task = new_current();

        // In the software model the block returns immediately; the task
        // is left parked on the queue.
        let interrupted = queue.wait(false);
        assert!(!interrupted);
        assert_eq!(task.status(), TaskStatus::UninterruptibleWait);
        assert!(!queue.is_empty());

        queue.wake_one();
        assert_eq!(task.status(), TaskStatus::Running);
        assert!(queue.is_empty());
        assert!(!task.is_on_wait_queue());

        scheduler::drain_run_queue();
    }

    #[test]
    fn wake_one_is_fifo() {
        let _guard = mm_lock();
        let queue = WaitQueue::new();

        let first = new_current();
        queue.wait(false);
        let second = new_current();
        queue.wait(false);

        queue.wake_one();
        assert_eq!(first.status(), TaskStatus::Running);
        assert_eq!(second.status(), TaskStatus::UninterruptibleWait);

        queue.wake_one();
        assert_eq!(second.status(), TaskStatus::Running);

        scheduler::drain_run_queue();
    }

    #[test]
    fn wake_all_drains_queue() {
        let _guard = mm_lock();
        let queue = WaitQueue::new();

        let first = new_current();
        queue.wait(false);
        let second = new_current();
        queue.wait(false);

        queue.wake_all();
        assert!(queue.is_empty());
        assert_eq!(first.status(), TaskStatus::Running);
        assert_eq!(second.status(), TaskStatus::Running);

        scheduler::drain_run_queue();
    }

    #[test]
    fn wake_one_on_empty_queue_is_harmless() {
        let _guard = mm_lock();
        let queue = WaitQueue::new();
        queue.wake_one();
        queue.wake_all();
        assert!(queue.is_empty());
    }
}
