//! Kernel heap
//!
//! The `linked_list_allocator` global in `lib.rs` is pointed at the fixed
//! heap window of the memory map.

use core::sync::atomic::{AtomicBool, Ordering};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Point the global allocator at the heap window. Idempotent.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return;
    }
    #[cfg(target_os = "none")]
    // SAFETY: the heap window is identity-mapped, unused by any other
    // subsystem (see the memory map in mm), and handed to the allocator
    // exactly once.
    unsafe {
        crate::get_allocator()
            .lock()
            .init(super::HEAP_BASE as *mut u8, super::HEAP_SIZE);
    }
    println!(
        "[MM] Heap: {} KiB at {:#x}",
        super::HEAP_SIZE / 1024,
        super::HEAP_BASE
    );
}
