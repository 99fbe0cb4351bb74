// SPDX-License-Identifier: MPL-2.0

//! The pid/tid tables.
//!
//! Ids are allocated by probing increasing candidates until the hash
//! accepts the insertion, so a recycled counter can never collide with a
//! live id.

use corvus_util::HashTable;

use super::thread::Thread;
use super::{Pid, Process, Tid};
use crate::prelude::*;

struct IdTable {
    processes: HashTable<Arc<Process>>,
    threads: HashTable<Arc<Thread>>,
    next_pid: Pid,
    next_tid: Tid,
}

lazy_static! {
    static ref ID_TABLE: SpinLock<IdTable> = SpinLock::new(IdTable {
        processes: HashTable::new(),
        threads: HashTable::new(),
        next_pid: 0,
        next_tid: 0,
    });
}

pub fn process_with_pid(pid: Pid) -> Option<Arc<Process>> {
    ID_TABLE.lock().processes.find(&pid.to_le_bytes()).cloned()
}

pub fn thread_with_tid(tid: Tid) -> Option<Arc<Thread>> {
    ID_TABLE.lock().threads.find(&tid.to_le_bytes()).cloned()
}

/// Allocates a fresh pid and registers the process `make` builds for it.
pub(crate) fn attach_process(make: impl FnOnce(Pid) -> Arc<Process>) -> Arc<Process> {
    let mut table = ID_TABLE.lock();
    let pid = loop {
        let candidate = table.next_pid;
        table.next_pid = table.next_pid.wrapping_add(1);
        if table.processes.find(&candidate.to_le_bytes()).is_none() {
            break candidate;
        }
    };
    let process = make(pid);
    let inserted = table.processes.insert(&pid.to_le_bytes(), process.clone());
    debug_assert!(inserted);
    process
}

/// Allocates a fresh tid and registers the thread `make` builds for it.
pub(crate) fn attach_thread(make: impl FnOnce(Tid) -> Arc<Thread>) -> Arc<Thread> {
    let mut table = ID_TABLE.lock();
    let tid = loop {
        let candidate = table.next_tid;
        table.next_tid = table.next_tid.wrapping_add(1);
        if table.threads.find(&candidate.to_le_bytes()).is_none() {
            break candidate;
        }
    };
    let thread = make(tid);
    let inserted = table.threads.insert(&tid.to_le_bytes(), thread.clone());
    debug_assert!(inserted);
    thread
}

pub(crate) fn detach_process(pid: Pid) {
    ID_TABLE.lock().processes.remove(&pid.to_le_bytes());
}

pub(crate) fn detach_thread(tid: Tid) {
    ID_TABLE.lock().threads.remove(&tid.to_le_bytes());
}
