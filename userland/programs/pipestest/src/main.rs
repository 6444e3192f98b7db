//! pipestest - exercise the pipe syscall end to end
//!
//! Creates a pipe, pushes a message through the write end, reads it
//! back from the read end, and reports the result.

#![no_std]
#![no_main]

use libsys::{eprint, print, sys};

const MSG: &[u8] = b"Hello from pipe!";

#[no_mangle]
pub extern "C" fn _start() -> ! {
    let mut fds = [0i32; 2];
    if sys::pipe(&mut fds) < 0 {
        eprint("pipe() failed!\n");
        sys::exit(1);
    }
    print("Pipe created\n");

    let written = sys::write(fds[1], MSG);
    if written < 0 {
        eprint("write() failed!\n");
        sys::exit(1);
    }
    print("Wrote to pipe\n");

    let mut buf = [0u8; 64];
    let bytes = sys::read(fds[0], &mut buf);
    if bytes < 0 {
        eprint("read() failed!\n");
        sys::exit(1);
    }

    print("Read from pipe: ");
    if let Ok(text) = core::str::from_utf8(&buf[..bytes as usize]) {
        print(text);
    }
    print("\n");

    sys::close(fds[0]);
    sys::close(fds[1]);

    if bytes as usize == MSG.len() && &buf[..bytes as usize] == MSG {
        print("Pipe test PASSED!\n");
        sys::exit(0);
    }
    eprint("Pipe test FAILED: payload mismatch\n");
    sys::exit(1);
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    libsys::panic_handler_impl(info)
}
