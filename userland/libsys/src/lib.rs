//! System interface for Obsidian user programs
//!
//! Raw `syscall` access plus typed wrappers matching the kernel ABI:
//! `rax` = number, arguments in `rdi, rsi, rdx, r10, r8`, negative
//! return values are errors.

#![no_std]

pub mod io;
pub mod sys;

pub use io::{eprint, print};

/// Shared panic behaviour for user programs: report and exit(255).
pub fn panic_handler_impl(_info: &core::panic::PanicInfo) -> ! {
    eprint("panic in user program\n");
    sys::exit(255);
}
