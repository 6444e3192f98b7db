//! x86_64 `syscall`/`sysret` fast-call entry
//!
//! User transitions leave CS=0x23, SS=0x1B after `sysret`; kernel entries
//! land on CS=0x08, SS=0x10. The trampoline switches to the calling
//! task's kernel stack (maintained by the scheduler), saves the
//! callee-saved registers plus the `syscall`-clobbered RCX/R11 pair, and
//! marshals `rax,rdi,rsi,rdx,r10,r8` into the kernel ABI
//! `num,arg1..arg5`.

use x86_64::{
    registers::{
        model_specific::{Efer, EferFlags, LStar, SFMask, Star},
        rflags::RFlags,
    },
    VirtAddr,
};

/// Scratch slot for the user RSP between `syscall` and the switch to the
/// kernel stack. Interrupts are masked by FMASK for that window and the
/// system is uniprocessor, so a single slot suffices.
static mut USER_RSP_SCRATCH: u64 = 0;

/// Enable SYSCALL/SYSRET and point LSTAR at the trampoline.
pub fn init() {
    use super::gdt;

    let selectors = gdt::selectors();

    // SAFETY: MSR writes during early init, before any user task exists.
    // The selector pairs match the GDT layout loaded in gdt::init().
    unsafe {
        Efer::update(|flags| {
            flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS);
        });

        LStar::write(VirtAddr::new(syscall_entry as usize as u64));

        // Star::write takes (user CS, user SS, kernel CS, kernel SS);
        // sysret derives CS/SS from the user pair, syscall from the
        // kernel pair.
        Star::write(
            selectors.user_code_selector,
            selectors.user_data_selector,
            selectors.code_selector,
            selectors.data_selector,
        )
        .expect("GDT layout incompatible with STAR");

        // Mask IF on entry: the trampoline runs with interrupts disabled
        // until the dispatcher re-enables them.
        SFMask::write(RFlags::INTERRUPT_FLAG);
    }
    println!("[SYSCALL] Fast-call path enabled (LSTAR set)");
}

/// SYSCALL instruction entry point.
///
/// Register state on entry, defined by the hardware and the user ABI:
/// RCX = user RIP, R11 = user RFLAGS, RAX = syscall number, args in
/// RDI, RSI, RDX, R10, R8.
///
/// # Safety
///
/// Must only be entered by the CPU's `syscall` instruction with LSTAR
/// pointing here.
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        // Stash the user stack and switch to this task's kernel stack.
        "mov [rip + {scratch}], rsp",
        "mov rsp, [rip + {kstack}]",
        "push qword ptr [rip + {scratch}]", // user RSP
        "push rcx",                         // user RIP
        "push r11",                         // user RFLAGS
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // Marshal (rax, rdi, rsi, rdx, r10, r8) into the SysV argument
        // registers of syscall_dispatch(num, a1, a2, a3, a4, a5).
        "mov r9, r8",
        "mov r8, r10",
        "mov rcx, rdx",
        "mov rdx, rsi",
        "mov rsi, rdi",
        "mov rdi, rax",
        "call {dispatch}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "pop r11",                          // user RFLAGS
        "pop rcx",                          // user RIP
        "pop rsp",                          // user RSP
        "sysretq",
        scratch = sym USER_RSP_SCRATCH,
        kstack = sym crate::sched::scheduler::CURRENT_KERNEL_STACK,
        dispatch = sym crate::syscall::syscall_dispatch,
    );
}
