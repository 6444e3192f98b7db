//! Page-table construction and the user/supervisor split
//!
//! The kernel identity-maps the first 16 MiB with 4 KiB pages. Pages below
//! 1 MiB and the pages holding the paging structures themselves are
//! supervisor-only; everything else is user-accessible by default and can
//! be demoted per region. Per-task address spaces replicate this layout
//! from fresh PMM frames so that IRQs and syscalls run without switching
//! CR3 back to the kernel tables.

use x86_64::{
    instructions::tlb,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::{PageTable, PageTableFlags, PhysFrame},
    PhysAddr, VirtAddr,
};

use crate::{
    error::{KernelError, KernelResult},
    mm::pmm,
};

/// Number of page tables in the identity window (8 x 2 MiB = 16 MiB).
pub const PT_COUNT: usize = 8;

/// Size of the identity-mapped window.
pub const IDENTITY_SIZE: u64 = (PT_COUNT as u64) * 0x20_0000;

/// Everything below this address is supervisor-only.
pub const USER_BASE: u64 = 0x10_0000;

const PAGE_SIZE: u64 = 0x1000;

// Kernel paging hierarchy, statically allocated in .bss. PageTable is
// 4 KiB-aligned by its own repr.
static mut KERNEL_PML4: PageTable = PageTable::new();
static mut KERNEL_PDPT: PageTable = PageTable::new();
static mut KERNEL_PD: PageTable = PageTable::new();
static mut KERNEL_PTS: [PageTable; PT_COUNT] = [const { PageTable::new() }; PT_COUNT];

fn flags_user() -> PageTableFlags {
    PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE
}

fn flags_supervisor() -> PageTableFlags {
    PageTableFlags::PRESENT | PageTableFlags::WRITABLE
}

/// Physical address of the kernel PML4.
pub fn kernel_pml4() -> u64 {
    &raw const KERNEL_PML4 as u64
}

/// Get a mutable view of a page table living at an identity-mapped
/// physical address.
///
/// # Safety
///
/// `phys` must be the frame of a live page-table node inside the identity
/// window, and the caller must hold the implicit kernel lock (interrupts
/// disabled or a non-preempting context).
unsafe fn table_mut(phys: u64) -> &'static mut PageTable {
    // SAFETY: per the function contract the frame is identity-mapped and
    // uniquely borrowed for the duration of the table walk.
    unsafe { &mut *(phys as *mut PageTable) }
}

/// Fill one identity hierarchy: wire `pml4 -> pdpt -> pd -> pts` and map
/// the first 16 MiB, supervisor-only below 1 MiB.
///
/// # Safety
///
/// All four addresses must point at zeroed, identity-mapped frames owned
/// by the caller.
unsafe fn build_identity(pml4: u64, pdpt: u64, pd: u64, pts: &[u64; PT_COUNT]) {
    // SAFETY: the frames are owned by the caller per the contract above.
    unsafe {
        table_mut(pml4)[0].set_addr(PhysAddr::new(pdpt), flags_user());
        table_mut(pdpt)[0].set_addr(PhysAddr::new(pd), flags_user());
        for (p, &pt) in pts.iter().enumerate() {
            table_mut(pd)[p].set_addr(PhysAddr::new(pt), flags_user());
            let table = table_mut(pt);
            for i in 0..512 {
                let addr = (p as u64) * 0x20_0000 + (i as u64) * PAGE_SIZE;
                let flags = if addr >= USER_BASE {
                    flags_user()
                } else {
                    flags_supervisor()
                };
                table[i].set_addr(PhysAddr::new(addr), flags);
            }
        }
    }
}

/// Set or clear the user bit on every page intersecting `[addr, addr+size)`
/// in the hierarchy rooted at `pml4`. Pages outside the identity window are
/// skipped. When `flush` is set, each modified page is invalidated in the
/// TLB (only meaningful for the active hierarchy).
fn set_region_user_bit(pml4: u64, addr: u64, size: u64, user: bool, flush: bool) {
    let start = addr & !(PAGE_SIZE - 1);
    let end = (addr + size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let mut a = start;
    while a < end {
        if a < IDENTITY_SIZE {
            // SAFETY: pml4 roots a live hierarchy whose nodes are
            // identity-mapped; interrupts-disabled callers serialize access.
            unsafe {
                let pdpt = table_mut(pml4)[((a >> 39) & 0x1FF) as usize].addr().as_u64();
                let pd = table_mut(pdpt)[((a >> 30) & 0x1FF) as usize].addr().as_u64();
                let pt = table_mut(pd)[((a >> 21) & 0x1FF) as usize].addr().as_u64();
                let entry = &mut table_mut(pt)[((a >> 12) & 0x1FF) as usize];
                let mut flags = entry.flags();
                flags.set(PageTableFlags::USER_ACCESSIBLE, user);
                flags.insert(PageTableFlags::PRESENT | PageTableFlags::WRITABLE);
                entry.set_flags(flags);
            }
            if flush {
                tlb::flush(VirtAddr::new(a));
            }
        }
        a += PAGE_SIZE;
    }
}

/// Mark a region of the kernel address space user-accessible.
pub fn mark_user_region(addr: u64, size: u64) {
    set_region_user_bit(kernel_pml4(), addr, size, true, true);
}

/// Mark a region of the kernel address space supervisor-only.
pub fn mark_supervisor_region(addr: u64, size: u64) {
    set_region_user_bit(kernel_pml4(), addr, size, false, true);
}

/// Mark a region user-accessible in a non-active hierarchy.
pub fn mark_user_region_in(pml4: u64, addr: u64, size: u64) {
    set_region_user_bit(pml4, addr, size, true, false);
}

/// Mark a region supervisor-only in a non-active hierarchy.
pub fn mark_supervisor_region_in(pml4: u64, addr: u64, size: u64) {
    set_region_user_bit(pml4, addr, size, false, false);
}

/// Demote the pages holding the given table nodes, so that no active
/// page-table node is ever user-accessible through its own mapping.
fn protect_table_pages(pml4: u64, nodes: &[u64]) {
    for &node in nodes {
        set_region_user_bit(pml4, node, PAGE_SIZE, false, pml4 == kernel_pml4());
    }
}

fn kernel_table_pages() -> [u64; PT_COUNT + 3] {
    let mut nodes = [0u64; PT_COUNT + 3];
    nodes[0] = &raw const KERNEL_PML4 as u64;
    nodes[1] = &raw const KERNEL_PDPT as u64;
    nodes[2] = &raw const KERNEL_PD as u64;
    for p in 0..PT_COUNT {
        // SAFETY: taking the address of a static array element; no read.
        nodes[3 + p] = unsafe { &raw const KERNEL_PTS[p] } as u64;
    }
    nodes
}

/// Build the kernel identity map and switch CR3 to it.
pub fn init() {
    let pml4 = kernel_pml4();
    let pdpt = &raw const KERNEL_PDPT as u64;
    let pd = &raw const KERNEL_PD as u64;
    let pts = kernel_table_pages();
    let mut pt_addrs = [0u64; PT_COUNT];
    pt_addrs.copy_from_slice(&pts[3..]);

    // SAFETY: the statics are zero-initialized, identity-mapped (the
    // bootloader maps the kernel image flat), and not yet live as the
    // active hierarchy.
    unsafe {
        build_identity(pml4, pdpt, pd, &pt_addrs);
    }
    protect_table_pages(pml4, &pts);
    // The demo tasks and user programs write the VGA text buffer directly.
    set_region_user_bit(pml4, super::VGA_PAGE, PAGE_SIZE, true, false);

    // SAFETY: the hierarchy identity-maps the window the kernel is
    // executing from, so the switch cannot unmap the current RIP.
    unsafe {
        Cr3::write(
            PhysFrame::containing_address(PhysAddr::new(pml4)),
            Cr3Flags::empty(),
        );
    }
    println!("[MM] Identity map: {} MiB, user split at {:#x}", IDENTITY_SIZE >> 20, USER_BASE);
}

/// Create a fresh per-task address space replicating the kernel identity
/// map, with the supervisor protections re-applied. Returns the physical
/// address of the new PML4.
pub fn new_user_space() -> KernelResult<u64> {
    let mut allocated = [0u64; PT_COUNT + 3];
    let mut count = 0usize;
    let result = build_user_space(&mut allocated, &mut count);
    if result.is_err() {
        for &frame in allocated[..count].iter() {
            let _ = pmm::free_page(frame);
        }
    }
    result
}

fn grab_table_frame(allocated: &mut [u64; PT_COUNT + 3], count: &mut usize) -> KernelResult<u64> {
    let frame = pmm::alloc_page()?;
    allocated[*count] = frame;
    *count += 1;
    Ok(frame)
}

fn build_user_space(allocated: &mut [u64; PT_COUNT + 3], count: &mut usize) -> KernelResult<u64> {
    let pml4 = grab_table_frame(allocated, count)?;
    let pdpt = grab_table_frame(allocated, count)?;
    let pd = grab_table_frame(allocated, count)?;
    let mut pts = [0u64; PT_COUNT];
    for pt in pts.iter_mut() {
        *pt = grab_table_frame(allocated, count)?;
    }

    // SAFETY: all frames come zeroed from the PMM and are exclusively
    // owned by this new hierarchy.
    unsafe {
        build_identity(pml4, pdpt, pd, &pts);
    }

    // The new tables, and the kernel's own tables, must never be
    // user-writable through the identity map.
    protect_table_pages(pml4, &allocated[..*count]);
    protect_table_pages(pml4, &kernel_table_pages());
    set_region_user_bit(pml4, super::VGA_PAGE, PAGE_SIZE, true, false);
    Ok(pml4)
}

/// Release the structure frames of an address space built by
/// [`new_user_space`]. Only the eleven table nodes are owned by the
/// space; the memory they map is identity and stays untouched.
pub fn free_user_space(pml4: u64) {
    // SAFETY: the hierarchy was built by new_user_space, is not the
    // active CR3, and its nodes are identity-mapped PMM frames.
    unsafe {
        let pdpt = table_mut(pml4)[0].addr().as_u64();
        if pdpt != 0 {
            let pd = table_mut(pdpt)[0].addr().as_u64();
            if pd != 0 {
                for p in 0..PT_COUNT {
                    let pt = table_mut(pd)[p].addr().as_u64();
                    if pt != 0 {
                        let _ = pmm::free_page(pt);
                    }
                }
                let _ = pmm::free_page(pd);
            }
            let _ = pmm::free_page(pdpt);
        }
        let _ = pmm::free_page(pml4);
    }
}

/// Write the leaf PTE for `addr` in the hierarchy rooted at `pml4`.
///
/// Fails if any intermediate level is absent; the pre-built 16 MiB window
/// is never grown at runtime.
pub fn map_page(pml4: u64, addr: u64, flags: PageTableFlags) -> KernelResult<()> {
    let err = KernelError::InvalidAddress { addr: addr as usize };
    // SAFETY: pml4 roots a live hierarchy with identity-mapped nodes.
    unsafe {
        let entry = &table_mut(pml4)[((addr >> 39) & 0x1FF) as usize];
        if entry.is_unused() {
            return Err(err);
        }
        let pdpt = entry.addr().as_u64();
        let entry = &table_mut(pdpt)[((addr >> 30) & 0x1FF) as usize];
        if entry.is_unused() {
            return Err(err);
        }
        let pd = entry.addr().as_u64();
        let entry = &table_mut(pd)[((addr >> 21) & 0x1FF) as usize];
        if entry.is_unused() {
            return Err(err);
        }
        let pt = entry.addr().as_u64();
        table_mut(pt)[((addr >> 12) & 0x1FF) as usize]
            .set_addr(PhysAddr::new(addr & !(PAGE_SIZE - 1)), flags | PageTableFlags::PRESENT);
    }
    Ok(())
}
