//! Demo tasks exercising the scheduler
//!
//! Two kernel tasks bump counters in the shared page at 2 MiB and yield
//! to each other; after N ticks both counters advance in near-lockstep.

use crate::{error::KernelResult, mm::SHARED_PAGE, sched};

fn counter_ptr(index: usize) -> *mut u64 {
    (SHARED_PAGE as usize + index * 8) as *mut u64
}

/// Read both counters (for the shell's `demo` status).
pub fn counters() -> (u64, u64) {
    // SAFETY: the shared page is identity-mapped and written only with
    // whole aligned u64 stores.
    unsafe {
        (
            core::ptr::read_volatile(counter_ptr(0)),
            core::ptr::read_volatile(counter_ptr(1)),
        )
    }
}

fn bump_and_yield(index: usize) -> ! {
    loop {
        // SAFETY: each task owns its own counter slot in the shared page.
        unsafe {
            let ptr = counter_ptr(index);
            core::ptr::write_volatile(ptr, core::ptr::read_volatile(ptr) + 1);
        }
        sched::yield_now();
    }
}

extern "C" fn counter_a() -> ! {
    bump_and_yield(0)
}

extern "C" fn counter_b() -> ! {
    bump_and_yield(1)
}

/// Spawn both cooperative counter tasks.
pub fn spawn_counters() -> KernelResult<()> {
    // SAFETY: clearing the two counter slots before the tasks start.
    unsafe {
        core::ptr::write_volatile(counter_ptr(0), 0);
        core::ptr::write_volatile(counter_ptr(1), 0);
    }
    sched::create_kernel_task(counter_a)?;
    sched::create_kernel_task(counter_b)?;
    Ok(())
}
