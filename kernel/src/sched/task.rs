//! Task records and the saved-register frame layout

/// Fixed size of the task table.
pub const MAX_TASKS: usize = 16;

/// Kernel stack size per task.
pub const KSTACK_SIZE: usize = 16 * 1024;

/// User stack size per task.
pub const USTACK_SIZE: usize = 16 * 1024;

/// Kernel code selector.
pub const KERNEL_CS: u64 = 0x08;
/// Kernel data selector.
pub const KERNEL_SS: u64 = 0x10;
/// User code selector with RPL 3.
pub const USER_CS: u64 = 0x23;
/// User data selector with RPL 3.
pub const USER_SS: u64 = 0x1B;

/// RFLAGS for fresh tasks: IF set, reserved bit 1 set.
pub const INITIAL_RFLAGS: u64 = 0x202;

/// Machine code placed at the top of every user stack:
///
/// ```text
/// mov eax, 0      ; SYS_EXIT
/// xor edi, edi
/// syscall
/// hlt
/// ```
///
/// A user `main` that returns normally `ret`s into this stub, which
/// calls `exit(0)`. The bytes are part of the user-stack ABI.
pub const EXIT_STUB: [u8; 10] = [0xB8, 0x00, 0x00, 0x00, 0x00, 0x31, 0xFF, 0x0F, 0x05, 0xF4];

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Slot free.
    Unused,
    /// On the run queue, eligible for selection.
    Runnable,
    /// Exited; the slot is never reclaimed within a boot.
    Zombie,
}

/// What kind of context the task runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Ring 0, kernel address space.
    Kernel,
    /// Ring 3, own address space.
    User,
    /// Ring 0 fallback; selected only when nothing else is runnable.
    Idle,
}

/// The register dump the timer trampoline pushes, followed by the
/// CPU-pushed interrupt frame. In long mode the CPU pushes `SS:RSP` for
/// ring-0 entries too, so one layout serves both privilege transitions;
/// the low two bits of `cs` are the privilege level the frame restores
/// to.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    // CPU-pushed from here down
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl InterruptFrame {
    pub const fn zeroed() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rdi: 0,
            rsi: 0,
            rbp: 0,
            rbx: 0,
            rdx: 0,
            rcx: 0,
            rax: 0,
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
        }
    }

    /// Frame for a fresh ring-0 task starting at `entry`.
    pub fn new_kernel(entry: u64, stack_top: u64) -> Self {
        let mut frame = Self::zeroed();
        frame.rip = entry;
        frame.cs = KERNEL_CS;
        frame.ss = KERNEL_SS;
        frame.rflags = INITIAL_RFLAGS;
        frame.rsp = stack_top;
        frame
    }

    /// Frame for a fresh ring-3 task starting at `entry` on `user_rsp`.
    pub fn new_user(entry: u64, user_rsp: u64) -> Self {
        let mut frame = Self::zeroed();
        frame.rip = entry;
        frame.cs = USER_CS;
        frame.ss = USER_SS;
        frame.rflags = INITIAL_RFLAGS;
        frame.rsp = user_rsp;
        frame
    }
}

/// One slot of the task table.
#[derive(Debug, Clone, Copy)]
pub struct Task {
    /// Monotonic task id (0 = none assigned).
    pub id: u64,
    pub state: TaskState,
    pub kind: TaskKind,
    /// Root of the task's address space (physical PML4).
    pub cr3: u64,
    /// Saved pointer into the kernel stack: the task's `InterruptFrame`.
    /// Zero until the task has run or been given a pre-built frame.
    pub rsp: u64,
    pub kernel_stack_base: u64,
    pub kernel_stack_top: u64,
    /// Top of the user stack (user tasks only).
    pub user_stack_top: u64,
    /// Entry address the task was created with.
    pub entry: u64,
    /// Circular run-queue link (slot index), `None` when not enqueued.
    pub next: Option<usize>,
}

impl Task {
    pub const fn unused() -> Self {
        Self {
            id: 0,
            state: TaskState::Unused,
            kind: TaskKind::Kernel,
            cr3: 0,
            rsp: 0,
            kernel_stack_base: 0,
            kernel_stack_top: 0,
            user_stack_top: 0,
            entry: 0,
            next: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_stub_encoding() {
        // mov eax, imm32 / xor edi, edi / syscall / hlt
        assert_eq!(EXIT_STUB[0], 0xB8);
        assert_eq!(&EXIT_STUB[1..5], &[0, 0, 0, 0]); // SYS_EXIT = 0
        assert_eq!(&EXIT_STUB[5..7], &[0x31, 0xFF]);
        assert_eq!(&EXIT_STUB[7..9], &[0x0F, 0x05]);
        assert_eq!(EXIT_STUB[9], 0xF4);
    }

    #[test]
    fn test_frame_privilege_bits() {
        let k = InterruptFrame::new_kernel(0x1000, 0x2000);
        assert_eq!(k.cs & 0x3, 0);
        let u = InterruptFrame::new_user(0x1000, 0x2000);
        assert_eq!(u.cs & 0x3, 3);
        assert_eq!(u.ss & 0x3, 3);
    }

    #[test]
    fn test_frame_layout_size() {
        // 15 pushed GPRs + 5 CPU-pushed words
        assert_eq!(core::mem::size_of::<InterruptFrame>(), 20 * 8);
    }
}
