//! Architecture-specific code

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

/// Halt the CPU forever (fatal error path).
pub fn halt() -> ! {
    loop {
        #[cfg(target_arch = "x86_64")]
        ::x86_64::instructions::hlt();
        #[cfg(not(target_arch = "x86_64"))]
        core::hint::spin_loop();
    }
}

/// Wait for the next interrupt with interrupts enabled, then restore the
/// previous interrupt state. Used by blocking waits in the idle and
/// console paths.
#[cfg(target_arch = "x86_64")]
pub fn wait_for_interrupt() {
    let were_enabled = ::x86_64::instructions::interrupts::are_enabled();
    ::x86_64::instructions::interrupts::enable_and_hlt();
    if !were_enabled {
        ::x86_64::instructions::interrupts::disable();
    }
}
