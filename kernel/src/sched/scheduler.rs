//! The task scheduler
//!
//! A fixed table of 16 task slots linked into a circular run queue.
//! Preemption is tick-driven: the timer trampoline hands the incoming
//! frame to [`tick`], which saves it into the current task, selects the
//! next runnable task (idle tasks only as a fallback), points the TSS and
//! the syscall stack slot at the chosen task's kernel stack, and returns
//! the frame to restore. Kernel work is protected by the `in_syscall`
//! flag, which suppresses selection entirely.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use alloc::sync::Arc;
use spin::Mutex;
use x86_64::instructions::interrupts;

use super::task::{
    InterruptFrame, Task, TaskKind, TaskState, EXIT_STUB, KSTACK_SIZE, MAX_TASKS, USTACK_SIZE,
};
use crate::{
    elf,
    error::{KernelError, KernelResult, SchedError},
    fs::VfsNode,
    mm::{paging, pmm, FRAME_SIZE},
    process,
};

/// Kernel-stack top of the current task, read by the syscall trampoline
/// when switching off the user stack.
pub static CURRENT_KERNEL_STACK: AtomicU64 = AtomicU64::new(0);

/// Set for the duration of a syscall; suppresses preemption so kernel
/// stacks are never switched out from under kernel work.
static IN_SYSCALL: AtomicBool = AtomicBool::new(false);

/// Slot index of the current task, `usize::MAX` when none.
static CURRENT_SLOT: AtomicUsize = AtomicUsize::new(usize::MAX);

pub struct Scheduler {
    tasks: [Task; MAX_TASKS],
    /// Any slot on the circular queue, or `None` when the queue is empty.
    runq: Option<usize>,
    current: Option<usize>,
    next_id: u64,
    /// Scheduling structures initialized.
    ready: bool,
    /// Tick-driven preemption enabled.
    running: bool,
}

static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            tasks: [Task::unused(); MAX_TASKS],
            runq: None,
            current: None,
            next_id: 1,
            ready: false,
            running: false,
        }
    }

    fn alloc_slot(&mut self) -> KernelResult<usize> {
        for (slot, task) in self.tasks.iter_mut().enumerate() {
            if task.state == TaskState::Unused {
                *task = Task::unused();
                task.state = TaskState::Runnable;
                task.id = self.next_id;
                self.next_id += 1;
                return Ok(slot);
            }
        }
        Err(SchedError::TaskTableFull.into())
    }

    fn enqueue(&mut self, slot: usize) {
        match self.runq {
            None => {
                self.tasks[slot].next = Some(slot);
                self.runq = Some(slot);
            }
            Some(head) => {
                self.tasks[slot].next = self.tasks[head].next;
                self.tasks[head].next = Some(slot);
            }
        }
    }

    /// Walk the circular queue starting after `cur`: the first non-idle
    /// runnable task wins, the first idle task seen is the fallback, and
    /// tasks that never ran (`rsp == 0`) are skipped.
    fn select_from(&self, cur: usize) -> Option<usize> {
        let start = self.tasks[cur].next.or(self.runq)?;
        let mut slot = start;
        let mut idle_fallback = None;
        for _ in 0..MAX_TASKS {
            let task = &self.tasks[slot];
            if task.state == TaskState::Runnable && task.rsp != 0 {
                if task.kind == TaskKind::Idle {
                    if idle_fallback.is_none() {
                        idle_fallback = Some(slot);
                    }
                } else {
                    return Some(slot);
                }
            }
            slot = self.tasks[slot].next?;
        }
        idle_fallback
    }

    fn switch_to(&mut self, next: usize) -> *mut InterruptFrame {
        self.current = Some(next);
        CURRENT_SLOT.store(next, Ordering::Relaxed);

        let task = &self.tasks[next];
        CURRENT_KERNEL_STACK.store(task.kernel_stack_top, Ordering::Relaxed);
        crate::arch::x86_64::gdt::set_kernel_stack(task.kernel_stack_top);

        if task.cr3 != 0 {
            use x86_64::{
                registers::control::{Cr3, Cr3Flags},
                structures::paging::PhysFrame,
                PhysAddr,
            };
            let (active, _) = Cr3::read();
            if active.start_address().as_u64() != task.cr3 {
                // SAFETY: every task address space replicates the kernel
                // identity window, so the switch cannot unmap the
                // currently executing code or the kernel stack.
                unsafe {
                    Cr3::write(
                        PhysFrame::containing_address(PhysAddr::new(task.cr3)),
                        Cr3Flags::empty(),
                    );
                }
            }
        }
        task.rsp as *mut InterruptFrame
    }

    fn tick(&mut self, frame: *mut InterruptFrame) -> *mut InterruptFrame {
        if !self.ready || !self.running {
            return frame;
        }
        let Some(cur) = self.current else {
            return frame;
        };
        if self.runq.is_none() {
            return frame;
        }
        if !frame.is_null() {
            self.tasks[cur].rsp = frame as u64;
        }
        let Some(next) = self.select_from(cur) else {
            return frame;
        };
        if next == cur {
            return frame;
        }
        self.switch_to(next)
    }
}

/// Initialize the scheduler structures.
pub fn init() {
    let mut sched = SCHEDULER.lock();
    *sched = Scheduler::new();
    sched.ready = true;
    println!("[SCHED] Task table ready ({} slots)", MAX_TASKS);
}

/// Enable tick-driven preemption.
pub fn start() {
    SCHEDULER.lock().running = true;
}

/// Timer-tick entry: may return a different task's frame to restore.
///
/// Called from the timer trampoline. If the scheduler lock is contended
/// (a creation path is mid-update) the tick is skipped, never blocked on.
pub fn tick(frame: *mut InterruptFrame) -> *mut InterruptFrame {
    if IN_SYSCALL.load(Ordering::Relaxed) {
        return frame;
    }
    let Some(mut sched) = SCHEDULER.try_lock() else {
        return frame;
    };
    sched.tick(frame)
}

/// Slot index of the current task.
pub fn current_slot() -> Option<usize> {
    let slot = CURRENT_SLOT.load(Ordering::Relaxed);
    (slot != usize::MAX).then_some(slot)
}

/// Id of the current task.
pub fn current_task_id() -> Option<u64> {
    let slot = current_slot()?;
    let sched = SCHEDULER.lock();
    (sched.tasks[slot].state != TaskState::Unused).then(|| sched.tasks[slot].id)
}

/// Mark the start/end of kernel syscall work; returns the previous state
/// so nested sections can restore it.
pub fn set_in_syscall(value: bool) -> bool {
    IN_SYSCALL.swap(value, Ordering::Relaxed)
}

/// Voluntary yield: enter the scheduler through the timer vector so the
/// full frame save/swap machinery runs once, immediately.
pub fn yield_now() {
    // SAFETY: vector 0x20 is the timer gate; invoking it from ring 0
    // performs exactly one scheduler pass and returns here (possibly
    // after other tasks have run).
    unsafe {
        core::arch::asm!("int 0x20");
    }
}

/// Yield from inside a syscall: preemption suppression is lifted for the
/// duration of the scheduler pass.
pub fn yield_from_syscall() {
    let was = set_in_syscall(false);
    yield_now();
    set_in_syscall(was);
}

/// Wait for the next interrupt, letting other tasks run meanwhile even
/// when called from a syscall.
pub fn block_hlt() {
    let was = set_in_syscall(false);
    crate::arch::wait_for_interrupt();
    set_in_syscall(was);
}

/// Turn the initial kernel thread into a task. Its `rsp` stays zero and
/// is filled by the first preemption.
pub fn bootstrap_current() -> KernelResult<u64> {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let slot = sched.alloc_slot()?;
        let id = sched.tasks[slot].id;
        sched.tasks[slot].kind = TaskKind::Kernel;
        sched.tasks[slot].cr3 = paging::kernel_pml4();
        sched.enqueue(slot);
        sched.current = Some(slot);
        CURRENT_SLOT.store(slot, Ordering::Relaxed);
        process::init_slot(slot);
        Ok(id)
    })
}

/// Create a runnable kernel task with a PMM-backed stack and a pre-built
/// ring-0 frame.
pub fn create_kernel_task(entry: extern "C" fn() -> !) -> KernelResult<u64> {
    let kstack = pmm::alloc_pages(KSTACK_SIZE / FRAME_SIZE)?;
    let kstack_top = kstack + KSTACK_SIZE as u64;
    paging::mark_supervisor_region(kstack, KSTACK_SIZE as u64);

    let entry_addr = entry as usize as u64;
    let frame_ptr = kstack_top - core::mem::size_of::<InterruptFrame>() as u64;
    // SAFETY: the frame slot lies inside the freshly allocated,
    // identity-mapped kernel stack, exclusively owned here.
    unsafe {
        (frame_ptr as *mut InterruptFrame).write(InterruptFrame::new_kernel(entry_addr, kstack_top));
    }

    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let slot = match sched.alloc_slot() {
            Ok(slot) => slot,
            Err(e) => {
                let _ = free_stack(kstack, KSTACK_SIZE);
                return Err(e);
            }
        };
        let id = sched.tasks[slot].id;
        let task = &mut sched.tasks[slot];
        task.kind = TaskKind::Kernel;
        task.cr3 = paging::kernel_pml4();
        task.rsp = frame_ptr;
        task.kernel_stack_base = kstack;
        task.kernel_stack_top = kstack_top;
        task.entry = entry_addr;
        sched.enqueue(slot);
        process::init_slot(slot);
        Ok(id)
    })
}

/// Create the idle task: runs only when nothing else is runnable.
pub fn spawn_idle() -> KernelResult<u64> {
    let id = create_kernel_task(idle_main)?;
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        if let Some(task) = sched.tasks.iter_mut().find(|t| t.id == id) {
            task.kind = TaskKind::Idle;
        }
    });
    Ok(id)
}

extern "C" fn idle_main() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

/// Create a runnable user task from an ELF file node.
///
/// Loads the image, builds a fresh address space, PMM-backed kernel and
/// user stacks, writes the exit stub onto the user stack, and pre-builds
/// a ring-3 interrupt frame. On any failure no task slot is consumed.
pub fn create_user_task(node: &Arc<dyn VfsNode>) -> KernelResult<u64> {
    let entry = elf::load(node)?;

    let space = paging::new_user_space()?;
    let kstack = match pmm::alloc_pages(KSTACK_SIZE / FRAME_SIZE) {
        Ok(addr) => addr,
        Err(e) => {
            paging::free_user_space(space);
            return Err(e);
        }
    };
    let ustack = match pmm::alloc_pages(USTACK_SIZE / FRAME_SIZE) {
        Ok(addr) => addr,
        Err(e) => {
            let _ = free_stack(kstack, KSTACK_SIZE);
            paging::free_user_space(space);
            return Err(e);
        }
    };
    let kstack_top = kstack + KSTACK_SIZE as u64;
    let ustack_top = ustack + USTACK_SIZE as u64;

    // Kernel stack is supervisor-only everywhere; the user stack must be
    // reachable from ring 3 in the task's own space.
    paging::mark_supervisor_region(kstack, KSTACK_SIZE as u64);
    paging::mark_supervisor_region_in(space, kstack, KSTACK_SIZE as u64);
    paging::mark_user_region_in(space, ustack, USTACK_SIZE as u64);

    // Lay out the user stack: exit stub at the top, then a 16-byte
    // aligned slot holding the stub address as the return target of a
    // user `main` that returns.
    let stub_addr = ustack_top - 16;
    let user_rsp = ustack_top - 32;
    // SAFETY: both addresses lie inside the freshly allocated,
    // identity-mapped user stack, exclusively owned here.
    unsafe {
        core::ptr::copy_nonoverlapping(EXIT_STUB.as_ptr(), stub_addr as *mut u8, EXIT_STUB.len());
        (user_rsp as *mut u64).write(stub_addr);
    }

    let frame_ptr = kstack_top - core::mem::size_of::<InterruptFrame>() as u64;
    // SAFETY: the frame slot lies inside the freshly allocated kernel
    // stack, exclusively owned here.
    unsafe {
        (frame_ptr as *mut InterruptFrame).write(InterruptFrame::new_user(entry, user_rsp));
    }

    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let slot = match sched.alloc_slot() {
            Ok(slot) => slot,
            Err(e) => {
                let _ = free_stack(kstack, KSTACK_SIZE);
                let _ = free_stack(ustack, USTACK_SIZE);
                paging::free_user_space(space);
                return Err(e);
            }
        };
        let id = sched.tasks[slot].id;
        let task = &mut sched.tasks[slot];
        task.kind = TaskKind::User;
        task.cr3 = space;
        task.rsp = frame_ptr;
        task.kernel_stack_base = kstack;
        task.kernel_stack_top = kstack_top;
        task.user_stack_top = ustack_top;
        task.entry = entry;
        sched.enqueue(slot);
        process::init_slot(slot);
        Ok(id)
    })
}

fn free_stack(base: u64, size: usize) -> KernelResult<()> {
    for i in 0..(size / FRAME_SIZE) {
        pmm::free_page(base + (i * FRAME_SIZE) as u64)?;
    }
    Ok(())
}

/// Exit the current task: mark it zombie and halt until the next tick
/// selects someone else. Never returns.
pub fn exit(code: i32) -> ! {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        if let Some(cur) = sched.current {
            let id = sched.tasks[cur].id;
            sched.tasks[cur].state = TaskState::Zombie;
            serial_println!("[SCHED] Task {} exited with code {}", id, code);
        }
    });
    IN_SYSCALL.store(false, Ordering::Relaxed);
    interrupts::enable();
    loop {
        x86_64::instructions::hlt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runnable(kind: TaskKind) -> Task {
        let mut t = Task::unused();
        t.state = TaskState::Runnable;
        t.kind = kind;
        t.rsp = 0x1000; // pretend it has a saved frame
        t
    }

    fn scheduler_with(tasks: &[Task]) -> Scheduler {
        let mut sched = Scheduler::new();
        sched.ready = true;
        sched.running = true;
        for &task in tasks {
            let slot = sched.alloc_slot().unwrap();
            let id = sched.tasks[slot].id;
            sched.tasks[slot] = task;
            sched.tasks[slot].id = id;
            sched.enqueue(slot);
        }
        sched
    }

    #[test]
    fn test_alloc_slot_limit() {
        let mut sched = Scheduler::new();
        for _ in 0..MAX_TASKS {
            sched.alloc_slot().unwrap();
        }
        assert!(matches!(
            sched.alloc_slot(),
            Err(KernelError::Sched(SchedError::TaskTableFull))
        ));
    }

    #[test]
    fn test_task_ids_are_monotonic() {
        let mut sched = Scheduler::new();
        let a = sched.alloc_slot().unwrap();
        let b = sched.alloc_slot().unwrap();
        assert!(sched.tasks[b].id > sched.tasks[a].id);
    }

    #[test]
    fn test_round_robin_selection() {
        let mut sched = scheduler_with(&[runnable(TaskKind::Kernel), runnable(TaskKind::Kernel)]);
        sched.current = Some(0);
        assert_eq!(sched.select_from(0), Some(1));
        assert_eq!(sched.select_from(1), Some(0));
    }

    #[test]
    fn test_zombie_skipped() {
        let mut sched = scheduler_with(&[runnable(TaskKind::Kernel), runnable(TaskKind::Kernel)]);
        sched.tasks[1].state = TaskState::Zombie;
        assert_eq!(sched.select_from(0), Some(0));
    }

    #[test]
    fn test_never_ran_task_skipped() {
        let mut sched = scheduler_with(&[runnable(TaskKind::Kernel), runnable(TaskKind::Kernel)]);
        sched.tasks[1].rsp = 0;
        assert_eq!(sched.select_from(0), Some(0));
    }

    #[test]
    fn test_idle_only_as_fallback() {
        let mut sched = scheduler_with(&[
            runnable(TaskKind::Kernel),
            runnable(TaskKind::Idle),
            runnable(TaskKind::Kernel),
        ]);
        // Queue order after enqueue-at-head rotation: 0 -> 2 -> 1 -> 0
        assert_eq!(sched.select_from(0), Some(2));
        // With the other kernel task gone the walk comes back around to
        // the current task before settling for idle
        sched.tasks[2].state = TaskState::Zombie;
        assert_eq!(sched.select_from(0), Some(0));
        // Only when every kernel task is gone does idle get selected
        sched.tasks[0].state = TaskState::Zombie;
        assert_eq!(sched.select_from(0), Some(1));
    }

    #[test]
    fn test_all_blocked_returns_none() {
        let mut sched = scheduler_with(&[runnable(TaskKind::Kernel)]);
        sched.tasks[0].state = TaskState::Zombie;
        assert_eq!(sched.select_from(0), None);
    }

    #[test]
    fn test_reachability_bound() {
        // Every runnable task is reachable from any other in at most
        // MAX_TASKS hops of `next`.
        let sched = scheduler_with(&[
            runnable(TaskKind::Kernel),
            runnable(TaskKind::Kernel),
            runnable(TaskKind::Kernel),
        ]);
        for start in 0..3 {
            for target in 0..3 {
                let mut slot = start;
                let mut found = false;
                for _ in 0..MAX_TASKS {
                    if slot == target {
                        found = true;
                        break;
                    }
                    slot = sched.tasks[slot].next.unwrap();
                }
                assert!(found, "slot {} unreachable from {}", target, start);
            }
        }
    }
}
