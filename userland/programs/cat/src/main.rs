//! cat - copy stdin (or a named file) to stdout
//!
//! With no way to receive argv yet, the file name is read as the first
//! line of stdin; an empty line means "copy stdin until EOF".

#![no_std]
#![no_main]

use libsys::{
    eprint, io,
    sys::{self, O_RDONLY, STDIN, STDOUT},
};

fn copy(fd: i32) {
    let mut buf = [0u8; 512];
    loop {
        let n = sys::read(fd, &mut buf);
        if n <= 0 {
            break;
        }
        sys::write(STDOUT, &buf[..n as usize]);
    }
}

#[no_mangle]
pub extern "C" fn _start() -> ! {
    let mut line = [0u8; 256];
    match io::read_line(&mut line) {
        Some(path) if !path.is_empty() => {
            let mut cbuf = [0u8; 257];
            let Some(cpath) = io::cstr(path, &mut cbuf) else {
                sys::exit(1);
            };
            let fd = sys::open(cpath, O_RDONLY);
            if fd < 0 {
                eprint("cat: no such file\n");
                sys::exit(1);
            }
            copy(fd as i32);
            sys::close(fd as i32);
        }
        _ => copy(STDIN),
    }
    sys::exit(0);
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    libsys::panic_handler_impl(info)
}
