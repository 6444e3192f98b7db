//! PIT timer and the monotonic tick counter

use core::sync::atomic::{AtomicU64, Ordering};

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Tick frequency programmed into the PIT.
pub const TICK_HZ: u32 = 100;

const PIT_FREQUENCY: u32 = 1_193_182;

/// Get the current tick count (the kernel's coarse clock).
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Increment the tick counter (called from the timer IRQ).
pub fn on_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Program PIT channel 0 as a rate generator at [`TICK_HZ`].
pub fn init() {
    let divisor = PIT_FREQUENCY / TICK_HZ;

    // SAFETY: ports 0x43/0x40 are the PIT command and channel-0 data
    // ports; this is the standard mode-3 programming sequence.
    unsafe {
        use x86_64::instructions::port::Port;

        let mut cmd_port: Port<u8> = Port::new(0x43);
        let mut data_port: Port<u8> = Port::new(0x40);

        cmd_port.write(0x36); // Channel 0, lobyte/hibyte, rate generator
        data_port.write((divisor & 0xFF) as u8);
        data_port.write((divisor >> 8) as u8);
    }
    println!("[TIMER] PIT at {} Hz", TICK_HZ);
}
