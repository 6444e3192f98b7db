//! mkdir - create a directory (and missing parents)
//!
//! Reads the target path from the first line of stdin.

#![no_std]
#![no_main]

use libsys::{eprint, io, print, sys};

#[no_mangle]
pub extern "C" fn _start() -> ! {
    let mut line = [0u8; 256];
    let Some(path) = io::read_line(&mut line) else {
        eprint("mkdir: missing path\n");
        sys::exit(1);
    };
    let mut cbuf = [0u8; 257];
    let Some(cpath) = io::cstr(path, &mut cbuf) else {
        sys::exit(1);
    };
    if sys::mkdir(cpath) < 0 {
        eprint("mkdir: failed\n");
        sys::exit(1);
    }
    print("ok\n");
    sys::exit(0);
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    libsys::panic_handler_impl(info)
}
