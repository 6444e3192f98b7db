//! Serial port (COM1) output
//!
//! Mirrors console output to the host when running under QEMU. The UART is
//! initialized lazily on first use.

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

const COM1: u16 = 0x3F8;

lazy_static! {
    static ref SERIAL1: Mutex<SerialPort> = {
        // SAFETY: COM1 is the standard base port for the first UART and is
        // not claimed by any other driver in this kernel.
        let mut port = unsafe { SerialPort::new(COM1) };
        port.init();
        Mutex::new(port)
    };
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    use core::fmt::Write;

    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        SERIAL1
            .lock()
            .write_fmt(args)
            .expect("serial write_fmt failed");
    });
}
