//! x86_64 architecture support

pub mod gdt;
pub mod idt;
pub mod syscall;
pub mod timer;
pub mod vga;

/// Segmentation, interrupts, and the fast-call path, in dependency order.
pub fn init() {
    gdt::init();
    idt::init();
    syscall::init();
}
