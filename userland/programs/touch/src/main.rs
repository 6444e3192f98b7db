//! touch - create an empty file if it does not exist

#![no_std]
#![no_main]

use libsys::{
    eprint, io,
    sys::{self, Stat},
};

#[no_mangle]
pub extern "C" fn _start() -> ! {
    let mut line = [0u8; 256];
    let Some(path) = io::read_line(&mut line) else {
        eprint("touch: missing path\n");
        sys::exit(1);
    };
    let mut cbuf = [0u8; 257];
    let Some(cpath) = io::cstr(path, &mut cbuf) else {
        sys::exit(1);
    };

    let mut stat = Stat::default();
    if sys::stat(cpath, &mut stat) == 0 {
        sys::exit(0); // already exists
    }
    let fd = sys::create(cpath);
    if fd < 0 {
        eprint("touch: failed\n");
        sys::exit(1);
    }
    sys::close(fd as i32);
    sys::exit(0);
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    libsys::panic_handler_impl(info)
}
