//! Per-task process state
//!
//! The file-descriptor table and working directory live outside the
//! scheduler's task records so that syscalls can operate on the current
//! task's state without contending with the tick path. Slots are
//! indexed by task-table slot and initialized at task creation.

use alloc::string::String;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult, SchedError},
    fs::FdTable,
    sched::{self, MAX_TASKS},
};

/// Mutable per-task state reachable from syscalls.
pub struct Process {
    pub fds: FdTable,
    pub cwd: String,
}

impl Process {
    fn new() -> Self {
        Self {
            fds: FdTable::new(),
            cwd: String::from("/"),
        }
    }
}

lazy_static! {
    static ref PROCESSES: [Mutex<Option<Process>>; MAX_TASKS] =
        core::array::from_fn(|_| Mutex::new(None));
}

/// Give a freshly created task its process state (FDs 0/1/2 wired to
/// the console, CWD at the root).
pub fn init_slot(slot: usize) {
    if let Some(entry) = PROCESSES.get(slot) {
        *entry.lock() = Some(Process::new());
    }
}

/// Run `f` against the current task's process state.
pub fn with_current<R>(f: impl FnOnce(&mut Process) -> KernelResult<R>) -> KernelResult<R> {
    let slot = sched::current_slot().ok_or(KernelError::Sched(SchedError::NoCurrentTask))?;
    let mut guard = PROCESSES[slot].lock();
    let process = guard
        .as_mut()
        .ok_or(KernelError::Sched(SchedError::NoCurrentTask))?;
    f(process)
}
