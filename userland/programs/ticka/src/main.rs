//! ticka - multitasking demo task A
//!
//! Marches an 'A' across the left half of VGA row 10, yielding between
//! writes. Run together with tickb to watch preemption interleave them.

#![no_std]
#![no_main]

use libsys::sys;

const VGA_BASE: usize = 0xB8000;
const VGA_WIDTH: usize = 80;
const ROW: usize = 10;
const GREEN_ON_BLACK: u16 = 0x0A00;

fn delay(count: u32) {
    for _ in 0..count {
        core::hint::spin_loop();
    }
}

#[no_mangle]
pub extern "C" fn _start() -> ! {
    let mut pos = 0usize;
    loop {
        let cell = (VGA_BASE + (ROW * VGA_WIDTH + pos) * 2) as *mut u16;
        // SAFETY: the VGA text page is mapped user-accessible; the cell
        // index stays inside columns 0-39 of row 10.
        unsafe {
            core::ptr::write_volatile(cell, GREEN_ON_BLACK | b'A' as u16);
        }
        pos = (pos + 1) % 40;
        delay(500_000);
        sys::yield_now();
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    libsys::panic_handler_impl(info)
}
