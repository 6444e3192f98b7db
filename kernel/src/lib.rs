//! Obsidian kernel library
//!
//! A small self-hosted x86-64 kernel: long mode, identity-mapped
//! user/supervisor paging, a fixed pool of preemptively scheduled tasks,
//! a `syscall`/`sysret` POSIX-flavoured syscall surface, and a
//! read/write FAT32 volume behind a VFS. The library form exists so the
//! pure parts (paths, FAT32 over a RAM disk, ELF validation, FD tables,
//! scheduling policy) run under the host test harness.

#![no_std]
#![feature(abi_x86_interrupt)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Bare metal uses the kernel heap; the host (unit tests) delegates to
// the system allocator so test code using Vec/String runs normally.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Get a reference to the global allocator
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn get_allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod fs;
pub mod mm;
pub mod process;
pub mod sched;
pub mod serial;
pub mod shell;
pub mod syscall;
pub mod test_tasks;

/// Heap allocation error handler.
///
/// Panic is intentional: heap allocation failure in a no_std kernel is
/// unrecoverable. The alloc_error_handler ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("Allocation error: {:?}", layout);
}
