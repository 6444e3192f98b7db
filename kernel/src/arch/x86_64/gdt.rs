// Global Descriptor Table

use lazy_static::lazy_static;
use x86_64::{
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        // RSP0 is rewritten by the scheduler on every switch into a user
        // task; this boot stack only covers interrupts taken before the
        // first switch. Must be 16-byte aligned for the x86_64 ABI.
        tss.privilege_stack_table[0] = {
            const STACK_SIZE: usize = 4096 * 4;
            #[repr(align(16))]
            #[allow(dead_code)] // Alignment wrapper -- field accessed via raw pointer
            struct AlignedStack([u8; STACK_SIZE]);
            static mut BOOT_RSP0_STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let stack_ptr = &raw const BOOT_RSP0_STACK;
            let stack_start = VirtAddr::from_ptr(stack_ptr);
            stack_start + STACK_SIZE as u64
        };

        // Separate stack for double faults (16-byte aligned)
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            const STACK_SIZE: usize = 4096 * 4;
            #[repr(align(16))]
            #[allow(dead_code)] // Alignment wrapper -- field accessed via raw pointer
            struct AlignedStack([u8; STACK_SIZE]);
            static mut STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let stack_ptr = &raw const STACK;
            let stack_start = VirtAddr::from_ptr(stack_ptr);
            stack_start + STACK_SIZE as u64
        };
        tss
    };
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());    // 0x08
        let data_selector = gdt.append(Descriptor::kernel_data_segment());    // 0x10
        let user_data_selector = gdt.append(Descriptor::user_data_segment()); // 0x18 (+ RPL 3 = 0x1B)
        let user_code_selector = gdt.append(Descriptor::user_code_segment()); // 0x20 (+ RPL 3 = 0x23)
        let tss_selector = gdt.append(Descriptor::tss_segment(&TSS));         // 0x28 (2 entries)
        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                user_data_selector,
                user_code_selector,
                tss_selector,
            },
        )
    };
}

/// GDT segment selectors for kernel and user mode.
///
/// Layout:
/// - 0x00: Null descriptor
/// - 0x08: Kernel code segment (Ring 0)
/// - 0x10: Kernel data segment (Ring 0)
/// - 0x18: User data segment (Ring 3, selector 0x1B with RPL)
/// - 0x20: User code segment (Ring 3, selector 0x23 with RPL)
/// - 0x28: TSS (occupies 2 entries, 0x28-0x30)
///
/// The user data/code order matches SYSRET expectations:
/// SYSRET computes SS = STAR[63:48]+8, CS = STAR[63:48]+16.
pub struct Selectors {
    pub code_selector: SegmentSelector,
    pub data_selector: SegmentSelector,
    pub user_data_selector: SegmentSelector,
    pub user_code_selector: SegmentSelector,
    pub tss_selector: SegmentSelector,
}

pub fn init() {
    use x86_64::instructions::{
        segmentation::{Segment, CS, DS, ES, SS},
        tables::load_tss,
    };

    GDT.0.load();
    // SAFETY: After loading the GDT, segment registers must be updated to
    // reference the new descriptors. The selectors come from GDT.1 which
    // was computed from the same GDT we just loaded, so they reference
    // valid descriptors.
    unsafe {
        CS::set_reg(GDT.1.code_selector);
        DS::set_reg(GDT.1.data_selector);
        ES::set_reg(GDT.1.data_selector);
        SS::set_reg(GDT.1.data_selector);
        load_tss(GDT.1.tss_selector);
    }
    println!("[GDT] Loaded (kernel 0x08/0x10, user 0x1B/0x23)");
}

/// Returns a reference to the GDT selectors (kernel and user mode).
pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Update the kernel stack pointer in the TSS (RSP0).
///
/// Called on every context switch into a user task so that an interrupt
/// taken from Ring 3 lands on that task's kernel stack. Must be called
/// with interrupts disabled.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY: The TSS is a static initialized during boot. Modifying
    // `privilege_stack_table[0]` via raw pointer is safe because this is
    // only called from the scheduler with interrupts disabled, so there is
    // no concurrent access.
    unsafe {
        let tss_ptr = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss_ptr).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}

/// Read the current kernel stack pointer from the TSS (RSP0).
pub fn get_kernel_stack() -> u64 {
    TSS.privilege_stack_table[0].as_u64()
}
