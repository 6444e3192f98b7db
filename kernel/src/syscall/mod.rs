//! System call dispatch
//!
//! The numbered table maps ring-3 register arguments onto VFS, scheduler,
//! and console primitives. Calling convention: `rax` = number, arguments
//! in `rdi, rsi, rdx, r10, r8`, result in `rax` with negative values as
//! errors.

use x86_64::instructions::interrupts;

use crate::{
    error::{KernelError, KernelResult, SyscallError},
    mm::paging,
    sched,
};

mod filesystem;
mod process;

use filesystem::*;
use process::*;

/// System call numbers (fixed ABI).
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Exit = 0,
    Read = 1,
    Write = 2,
    Open = 3,
    Close = 4,
    Stat = 5,
    Fstat = 6,
    Mkdir = 7,
    Rmdir = 8,
    Unlink = 9,
    Readdir = 10,
    Chdir = 11,
    Getcwd = 12,
    Rename = 13,
    Truncate = 14,
    Create = 15,
    Seek = 16,
    Yield = 17,
    Pipe = 18,
}

impl TryFrom<usize> for Syscall {
    type Error = ();

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Syscall::Exit),
            1 => Ok(Syscall::Read),
            2 => Ok(Syscall::Write),
            3 => Ok(Syscall::Open),
            4 => Ok(Syscall::Close),
            5 => Ok(Syscall::Stat),
            6 => Ok(Syscall::Fstat),
            7 => Ok(Syscall::Mkdir),
            8 => Ok(Syscall::Rmdir),
            9 => Ok(Syscall::Unlink),
            10 => Ok(Syscall::Readdir),
            11 => Ok(Syscall::Chdir),
            12 => Ok(Syscall::Getcwd),
            13 => Ok(Syscall::Rename),
            14 => Ok(Syscall::Truncate),
            15 => Ok(Syscall::Create),
            16 => Ok(Syscall::Seek),
            17 => Ok(Syscall::Yield),
            18 => Ok(Syscall::Pipe),
            _ => Err(()),
        }
    }
}

/// Stat record of the user ABI: three 32-bit fields.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UserStat {
    pub size: u32,
    pub mode: u32,
    pub inode: u32,
}

/// Mode bit: regular file.
pub const MODE_FILE: u32 = 0x8000;
/// Mode bit: directory.
pub const MODE_DIR: u32 = 0x4000;

/// Directory entry record of the user ABI.
#[repr(C)]
pub struct UserDirent {
    pub name: [u8; 256],
    /// 0 = file, 1 = directory.
    pub kind: u32,
}

/// Rust-side syscall entry, called from the trampoline with the
/// marshalled arguments.
///
/// The `in_syscall` flag suppresses preemption for the lifetime of the
/// call; interrupts themselves are re-enabled so ticks keep counting.
pub extern "C" fn syscall_dispatch(
    num: usize,
    arg1: usize,
    arg2: usize,
    arg3: usize,
    arg4: usize,
    _arg5: usize,
) -> isize {
    let prev = sched::set_in_syscall(true);
    interrupts::enable();

    let result = handle_syscall(num, arg1, arg2, arg3, arg4);

    interrupts::disable();
    sched::set_in_syscall(prev);

    match result {
        Ok(value) => value as isize,
        Err(error) => error.to_errno(),
    }
}

fn handle_syscall(
    num: usize,
    arg1: usize,
    arg2: usize,
    arg3: usize,
    _arg4: usize,
) -> KernelResult<usize> {
    let syscall =
        Syscall::try_from(num).map_err(|_| SyscallError::InvalidSyscall { nr: num })?;
    match syscall {
        Syscall::Exit => sys_exit(arg1),
        Syscall::Read => sys_read(arg1, arg2, arg3),
        Syscall::Write => sys_write(arg1, arg2, arg3),
        Syscall::Open => sys_open(arg1, arg2),
        Syscall::Close => sys_close(arg1),
        Syscall::Stat => sys_stat(arg1, arg2),
        Syscall::Fstat => sys_fstat(arg1, arg2),
        Syscall::Mkdir => sys_mkdir(arg1),
        Syscall::Rmdir => sys_rmdir(arg1),
        Syscall::Unlink => sys_unlink(arg1),
        Syscall::Readdir => sys_readdir(arg1, arg2, arg3),
        Syscall::Chdir => sys_chdir(arg1),
        Syscall::Getcwd => sys_getcwd(arg1, arg2),
        Syscall::Rename => sys_rename(arg1, arg2),
        Syscall::Truncate => sys_truncate(arg1, arg2),
        Syscall::Create => sys_create(arg1),
        Syscall::Seek => sys_seek(arg1, arg2, arg3),
        Syscall::Yield => sys_yield(),
        Syscall::Pipe => sys_pipe(arg1),
    }
}

// ---------------------------------------------------------------------------
// User pointer access
// ---------------------------------------------------------------------------

fn check_user_range(addr: usize, len: usize) -> KernelResult<()> {
    if addr == 0 {
        return Err(SyscallError::InvalidPointer { addr }.into());
    }
    let end = addr
        .checked_add(len)
        .ok_or(KernelError::Syscall(SyscallError::InvalidPointer { addr }))?;
    if end > paging::IDENTITY_SIZE as usize {
        return Err(SyscallError::InvalidPointer { addr }.into());
    }
    Ok(())
}

/// Borrow a user buffer. The window is identity-mapped, so the pointer
/// is usable directly once range-checked.
pub(crate) fn user_slice<'a>(addr: usize, len: usize) -> KernelResult<&'a [u8]> {
    check_user_range(addr, len)?;
    // SAFETY: the range lies inside the identity map and the task stays
    // scheduled for the duration of the syscall.
    Ok(unsafe { core::slice::from_raw_parts(addr as *const u8, len) })
}

/// Borrow a mutable user buffer.
pub(crate) fn user_slice_mut<'a>(addr: usize, len: usize) -> KernelResult<&'a mut [u8]> {
    check_user_range(addr, len)?;
    // SAFETY: as in `user_slice`; the kernel never aliases user buffers.
    Ok(unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len) })
}

/// Read a NUL-terminated user string (paths; capped at 4096 bytes).
pub(crate) fn user_str<'a>(addr: usize) -> KernelResult<&'a str> {
    const MAX_LEN: usize = 4096;
    let mut len = 0;
    loop {
        check_user_range(addr, len + 1)?;
        // SAFETY: the byte at addr+len was just range-checked.
        let byte = unsafe { *((addr + len) as *const u8) };
        if byte == 0 {
            break;
        }
        len += 1;
        if len >= MAX_LEN {
            return Err(SyscallError::InvalidArgument.into());
        }
    }
    let bytes = user_slice(addr, len)?;
    core::str::from_utf8(bytes).map_err(|_| SyscallError::InvalidArgument.into())
}

/// Write a POD value to a user pointer.
pub(crate) fn write_user<T>(addr: usize, value: T) -> KernelResult<()> {
    check_user_range(addr, core::mem::size_of::<T>())?;
    // SAFETY: range-checked; T is a plain-data ABI struct.
    unsafe {
        core::ptr::write_unaligned(addr as *mut T, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syscall_numbers_are_abi_stable() {
        assert_eq!(Syscall::try_from(0).unwrap(), Syscall::Exit);
        assert_eq!(Syscall::try_from(1).unwrap(), Syscall::Read);
        assert_eq!(Syscall::try_from(2).unwrap(), Syscall::Write);
        assert_eq!(Syscall::try_from(3).unwrap(), Syscall::Open);
        assert_eq!(Syscall::try_from(4).unwrap(), Syscall::Close);
        assert_eq!(Syscall::try_from(10).unwrap(), Syscall::Readdir);
        assert_eq!(Syscall::try_from(16).unwrap(), Syscall::Seek);
        assert_eq!(Syscall::try_from(17).unwrap(), Syscall::Yield);
        assert_eq!(Syscall::try_from(18).unwrap(), Syscall::Pipe);
        assert!(Syscall::try_from(19).is_err());
        assert!(Syscall::try_from(usize::MAX).is_err());
    }

    #[test]
    fn test_stat_record_layout() {
        assert_eq!(core::mem::size_of::<UserStat>(), 12);
        let stat = UserStat {
            size: 1,
            mode: MODE_FILE,
            inode: 3,
        };
        // Field order is part of the ABI: size, mode, inode
        let bytes: [u8; 12] = unsafe { core::mem::transmute(stat) };
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 1);
        assert_eq!(
            u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            MODE_FILE
        );
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 3);
    }

    #[test]
    fn test_dirent_record_layout() {
        assert_eq!(core::mem::size_of::<UserDirent>(), 260);
    }

    #[test]
    fn test_null_pointer_rejected() {
        assert!(user_slice(0, 10).is_err());
    }
}
