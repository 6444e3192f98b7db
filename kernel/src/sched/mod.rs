//! Preemptive task scheduling

pub mod scheduler;
pub mod task;

pub use scheduler::{
    block_hlt, bootstrap_current, create_kernel_task, create_user_task, current_slot,
    current_task_id, exit, init, set_in_syscall, spawn_idle, start, yield_from_syscall, yield_now,
};
pub use task::{Task, TaskKind, TaskState, MAX_TASKS};
