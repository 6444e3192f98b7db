// Interrupt Descriptor Table, exception stubs, and the IRQ trampolines

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::{
    structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode},
    VirtAddr,
};

use crate::sched::task::InterruptFrame;

/// PIC vector offsets: IRQ 0-7 -> 0x20-0x27, IRQ 8-15 -> 0x28-0x2F.
pub const PIC_1_OFFSET: u8 = 0x20;
pub const PIC_2_OFFSET: u8 = 0x28;

pub const TIMER_VECTOR: u8 = PIC_1_OFFSET;
pub const KEYBOARD_VECTOR: u8 = PIC_1_OFFSET + 1;

// SAFETY: the offsets do not overlap the CPU exception range.
pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.non_maskable_interrupt.set_handler_fn(nmi_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded.set_handler_fn(bound_range_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available.set_handler_fn(device_not_available_handler);
        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present.set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault.set_handler_fn(stack_segment_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.x87_floating_point.set_handler_fn(x87_floating_point_handler);
        idt.alignment_check.set_handler_fn(alignment_check_handler);
        idt.simd_floating_point.set_handler_fn(simd_floating_point_handler);
        idt.virtualization.set_handler_fn(virtualization_handler);
        // SAFETY: the double-fault stack index refers to a valid IST slot
        // set up in gdt.rs.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(super::gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.machine_check.set_handler_fn(machine_check_handler);

        // The timer gate points at a naked trampoline that saves the full
        // register frame and may return on a different task's frame.
        // SAFETY: timer_entry preserves the interrupt frame contract
        // (full save/restore + iretq).
        unsafe {
            idt[TIMER_VECTOR].set_handler_addr(VirtAddr::new(timer_entry as usize as u64));
        }
        idt[KEYBOARD_VECTOR].set_handler_fn(keyboard_interrupt_handler);
        idt
    };
}

/// Load the IDT, remap the PIC, and unmask IRQ0/IRQ1 only.
///
/// Interrupts stay disabled; `sched::start()`/`kernel_main` enables them
/// once the scheduler is ready.
pub fn init() {
    IDT.load();
    // SAFETY: remapping and masking the PICs is safe during early init,
    // before interrupts are enabled.
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        // Mask everything except IRQ0 (timer) and IRQ1 (keyboard).
        pics.write_masks(0xFC, 0xFF);
    }
    println!("[IDT] Loaded, PIC remapped to {:#x}/{:#x}", PIC_1_OFFSET, PIC_2_OFFSET);
}

/// All CPU exceptions are fatal: they indicate a kernel bug, and the core
/// has no kill semantics to recover with. Print on both sinks and halt.
fn fatal_exception(name: &str, stack_frame: &InterruptStackFrame, error_code: Option<u64>) -> ! {
    println!("EXCEPTION: {}", name);
    serial_println!("EXCEPTION: {}", name);
    if let Some(code) = error_code {
        println!("Error Code: {:#x}", code);
        serial_println!("Error Code: {:#x}", code);
    }
    println!("{:#?}", stack_frame);
    serial_println!("{:#?}", stack_frame);
    crate::arch::halt()
}

macro_rules! fatal_handler {
    ($handler:ident, $name:expr) => {
        extern "x86-interrupt" fn $handler(stack_frame: InterruptStackFrame) {
            fatal_exception($name, &stack_frame, None);
        }
    };
}

macro_rules! fatal_handler_with_code {
    ($handler:ident, $name:expr) => {
        extern "x86-interrupt" fn $handler(stack_frame: InterruptStackFrame, error_code: u64) {
            fatal_exception($name, &stack_frame, Some(error_code));
        }
    };
}

fatal_handler!(divide_error_handler, "DIVIDE ERROR");
fatal_handler!(debug_handler, "DEBUG");
fatal_handler!(nmi_handler, "NON-MASKABLE INTERRUPT");
fatal_handler!(breakpoint_handler, "BREAKPOINT");
fatal_handler!(overflow_handler, "OVERFLOW");
fatal_handler!(bound_range_handler, "BOUND RANGE EXCEEDED");
fatal_handler!(invalid_opcode_handler, "INVALID OPCODE");
fatal_handler!(device_not_available_handler, "DEVICE NOT AVAILABLE");
fatal_handler!(x87_floating_point_handler, "x87 FLOATING POINT");
fatal_handler!(simd_floating_point_handler, "SIMD FLOATING POINT");
fatal_handler!(virtualization_handler, "VIRTUALIZATION");
fatal_handler_with_code!(invalid_tss_handler, "INVALID TSS");
fatal_handler_with_code!(segment_not_present_handler, "SEGMENT NOT PRESENT");
fatal_handler_with_code!(stack_segment_handler, "STACK SEGMENT FAULT");
fatal_handler_with_code!(general_protection_handler, "GENERAL PROTECTION FAULT");
fatal_handler_with_code!(alignment_check_handler, "ALIGNMENT CHECK");

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    fatal_exception("DOUBLE FAULT", &stack_frame, Some(error_code))
}

extern "x86-interrupt" fn machine_check_handler(stack_frame: InterruptStackFrame) -> ! {
    fatal_exception("MACHINE CHECK", &stack_frame, None)
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    println!("EXCEPTION: PAGE FAULT");
    println!("Accessed Address: {:?}", Cr2::read());
    println!("Error Code: {:?}", error_code);
    serial_println!(
        "EXCEPTION: PAGE FAULT at {:?} ({:?})",
        Cr2::read(),
        error_code
    );
    println!("{:#?}", stack_frame);
    crate::arch::halt()
}

/// Timer IRQ trampoline (vector 32).
///
/// Saves the full general-register frame on the current task's kernel
/// stack, hands the frame to `timer_interrupt`, and restores whatever
/// frame that returns. The register push order must mirror the field
/// order of [`InterruptFrame`].
///
/// # Safety
///
/// Must only be entered through the IDT gate (or an `int 0x20` from
/// ring 0, which is how voluntary yield is implemented).
#[unsafe(naked)]
pub unsafe extern "C" fn timer_entry() {
    core::arch::naked_asm!(
        "push rax",
        "push rcx",
        "push rdx",
        "push rbx",
        "push rbp",
        "push rsi",
        "push rdi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {handler}",
        "mov rsp, rax",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rbp",
        "pop rbx",
        "pop rdx",
        "pop rcx",
        "pop rax",
        "iretq",
        handler = sym timer_interrupt,
    );
}

/// The Rust half of the timer IRQ: count the tick, acknowledge the PIC,
/// and let the scheduler pick the frame to return on.
extern "C" fn timer_interrupt(frame: *mut InterruptFrame) -> *mut InterruptFrame {
    super::timer::on_tick();
    // SAFETY: end-of-interrupt for the vector we are handling.
    unsafe {
        PICS.lock().notify_end_of_interrupt(TIMER_VECTOR);
    }
    crate::sched::scheduler::tick(frame)
}

extern "x86-interrupt" fn keyboard_interrupt_handler(_stack_frame: InterruptStackFrame) {
    use x86_64::instructions::port::Port;

    let mut port: Port<u8> = Port::new(0x60);
    // SAFETY: port 0x60 is the PS/2 data port; reading it is the required
    // acknowledgement of the keyboard IRQ.
    let scancode: u8 = unsafe { port.read() };
    crate::drivers::keyboard::handle_scancode(scancode);

    // SAFETY: end-of-interrupt for the vector we are handling.
    unsafe {
        PICS.lock().notify_end_of_interrupt(KEYBOARD_VECTOR);
    }
}
