//! Kernel entry point
//!
//! The boot collaborator delivers long mode, a flat identity map
//! covering the kernel image, a provisional GDT, and jumps to `_start`.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
extern crate alloc;

#[cfg(target_os = "none")]
mod kernel {
    use alloc::boxed::Box;
    use core::panic::PanicInfo;

    use obsidian_kernel::{arch, drivers, fs, mm, println, sched, serial_println, shell};

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        println!("[KERNEL PANIC] {}", info);
        serial_println!("[KERNEL PANIC] {}", info);
        arch::halt();
    }

    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        println!("Obsidian v{}", env!("CARGO_PKG_VERSION"));

        // Segmentation, interrupts (masked), and the syscall MSRs
        arch::x86_64::init();

        // Physical frames, identity paging with the user split, heap
        mm::init();

        drivers::keyboard::init();

        sched::init();
        sched::bootstrap_current().expect("bootstrap task");
        sched::spawn_idle().expect("idle task");

        mount_root();

        // Preemption on: program the PIT and open the interrupt gate
        arch::x86_64::timer::init();
        sched::start();
        x86_64::instructions::interrupts::enable();

        shell::run()
    }

    /// Mount the FAT32 volume at LBA 0 of the secondary ATA drive. The
    /// shell still runs without it, with `ls`/`cat` reporting no root.
    fn mount_root() {
        let mut drive = drivers::ata::AtaDrive::primary_slave();
        if drive.identify().is_err() {
            println!("[FS] No disk on ata0-slave; running without a filesystem");
            return;
        }
        match fs::fat32::Fat32Volume::mount(Box::new(drive), 0) {
            Ok(volume) => match volume.root_node() {
                Ok(root) => {
                    fs::set_root(root);
                    println!("[FS] FAT32 mounted");
                }
                Err(e) => println!("[FS] Mount failed: {:?}", e),
            },
            Err(e) => println!("[FS] Not a FAT32 volume: {:?}", e),
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
