//! Process-control syscalls

use crate::{error::KernelResult, sched};

/// Mark the task zombie; never returns to the caller.
pub(super) fn sys_exit(code: usize) -> KernelResult<usize> {
    sched::exit(code as i32)
}

/// Voluntary scheduler pass.
pub(super) fn sys_yield() -> KernelResult<usize> {
    sched::yield_from_syscall();
    Ok(0)
}
