//! Filesystem and console syscalls
//!
//! Operations on the current task's FD table, the VFS, and the console.
//! Path arguments resolve against the task CWD: absolute paths ignore
//! it, relative paths are joined with one `/`.

use alloc::{string::String, sync::Arc};

use super::{user_slice, user_slice_mut, user_str, write_user, UserDirent, UserStat, MODE_DIR,
    MODE_FILE};
use crate::{
    drivers::keyboard,
    error::{FsError, KernelError, KernelResult, SyscallError},
    fs::{
        self, join_cwd, pipe, resolve_path, split_path, FdEntry, FdKind, NodeKind, OpenFlags,
        SeekFrom, VfsNode,
    },
    process, sched,
};

/// Absolute form of a user path, per the current task's CWD.
fn absolute_path(path: &str) -> KernelResult<String> {
    let cwd = process::with_current(|p| Ok(p.cwd.clone()))?;
    Ok(join_cwd(&cwd, path))
}

fn resolve_user_path(path: &str) -> KernelResult<Arc<dyn VfsNode>> {
    Ok(resolve_path(&absolute_path(path)?)?)
}

/// Resolve the parent directory of a user path, returning it with the
/// final component.
fn resolve_parent(path: &str) -> KernelResult<(Arc<dyn VfsNode>, String)> {
    let abs = absolute_path(path)?;
    let (parent, name) = split_path(&abs).map_err(KernelError::Fs)?;
    let parent_node = resolve_path(parent)?;
    if parent_node.kind() != NodeKind::Directory {
        return Err(FsError::NotADirectory.into());
    }
    Ok((parent_node, String::from(name)))
}

// ---------------------------------------------------------------------------
// Console I/O
// ---------------------------------------------------------------------------

/// Ctrl-D: end of input.
const EOT: u8 = 0x04;

fn console_read(buf: &mut [u8]) -> usize {
    if buf.is_empty() {
        return 0;
    }
    let mut n = 0;
    loop {
        while n < buf.len() {
            match keyboard::pop_key() {
                Some(EOT) => return n,
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        if n > 0 {
            return n;
        }
        // Queue empty: wait for a key, letting other tasks run.
        sched::block_hlt();
    }
}

fn console_write(data: &[u8]) -> usize {
    use x86_64::instructions::interrupts;
    interrupts::without_interrupts(|| {
        let mut writer = crate::arch::x86_64::vga::WRITER.lock();
        for &byte in data {
            writer.write_byte(byte);
        }
    });
    for &byte in data {
        serial_print!("{}", byte as char);
    }
    data.len()
}

// ---------------------------------------------------------------------------
// Descriptor syscalls
// ---------------------------------------------------------------------------

fn fd_snapshot(fd: usize) -> KernelResult<FdEntry> {
    process::with_current(|p| {
        p.fds
            .get(fd)
            .map(FdEntry::clone)
            .map_err(|_| SyscallError::BadFileDescriptor.into())
    })
}

fn advance_offset(fd: usize, by: usize) -> KernelResult<()> {
    process::with_current(|p| {
        let entry = p
            .fds
            .get_mut(fd)
            .map_err(|_| KernelError::Syscall(SyscallError::BadFileDescriptor))?;
        entry.offset += by as u32;
        Ok(())
    })
}

pub(super) fn sys_read(fd: usize, buf_addr: usize, len: usize) -> KernelResult<usize> {
    let entry = fd_snapshot(fd)?;
    let buf = user_slice_mut(buf_addr, len)?;
    match entry.kind {
        FdKind::Console => Ok(console_read(buf)),
        FdKind::File => {
            if !entry.flags.read {
                return Err(SyscallError::InvalidArgument.into());
            }
            let node = entry.node.ok_or(KernelError::Syscall(SyscallError::BadFileDescriptor))?;
            let n = node.read(entry.offset, buf)?;
            advance_offset(fd, n)?;
            Ok(n)
        }
        FdKind::PipeRead(id) => loop {
            match pipe::read(id, buf) {
                Ok(n) => return Ok(n),
                Err(KernelError::WouldBlock) => sched::yield_from_syscall(),
                Err(e) => return Err(e),
            }
        },
        _ => Err(SyscallError::BadFileDescriptor.into()),
    }
}

pub(super) fn sys_write(fd: usize, buf_addr: usize, len: usize) -> KernelResult<usize> {
    let entry = fd_snapshot(fd)?;
    let data = user_slice(buf_addr, len)?;
    match entry.kind {
        FdKind::Console => Ok(console_write(data)),
        FdKind::File => {
            if !entry.flags.write {
                return Err(SyscallError::InvalidArgument.into());
            }
            let node = entry.node.ok_or(KernelError::Syscall(SyscallError::BadFileDescriptor))?;
            let n = node.write(entry.offset, data)?;
            advance_offset(fd, n)?;
            Ok(n)
        }
        FdKind::PipeWrite(id) => {
            let mut written = 0;
            while written < data.len() {
                match pipe::write(id, &data[written..]) {
                    Ok(n) => written += n,
                    Err(KernelError::WouldBlock) => sched::yield_from_syscall(),
                    Err(_) if written > 0 => break,
                    Err(e) => return Err(e),
                }
            }
            Ok(written)
        }
        _ => Err(SyscallError::BadFileDescriptor.into()),
    }
}

pub(super) fn sys_open(path_addr: usize, flag_bits: usize) -> KernelResult<usize> {
    let path = user_str(path_addr)?;
    let flags = OpenFlags::from_bits(flag_bits as u32);

    let node = match resolve_user_path(path) {
        Ok(node) => node,
        Err(KernelError::Fs(FsError::NotFound)) if flags.create => {
            let (parent, name) = resolve_parent(path)?;
            parent.create_file(&name)?
        }
        Err(e) => return Err(e),
    };

    if node.kind() == NodeKind::File && flags.truncate && flags.write {
        node.truncate(0)?;
    }

    let entry = FdEntry::for_node(node, flags);
    process::with_current(|p| Ok(p.fds.alloc(entry)?))
}

pub(super) fn sys_close(fd: usize) -> KernelResult<usize> {
    let entry = process::with_current(|p| Ok(p.fds.close(fd)?))?;
    match entry.kind {
        FdKind::PipeRead(id) => pipe::close_read(id),
        FdKind::PipeWrite(id) => pipe::close_write(id),
        _ => {}
    }
    Ok(0)
}

fn stat_for(node: &Arc<dyn VfsNode>) -> UserStat {
    UserStat {
        size: node.size(),
        mode: match node.kind() {
            NodeKind::File => MODE_FILE,
            NodeKind::Directory => MODE_DIR,
        },
        inode: node.inode(),
    }
}

pub(super) fn sys_stat(path_addr: usize, stat_addr: usize) -> KernelResult<usize> {
    let path = user_str(path_addr)?;
    let node = resolve_user_path(path)?;
    write_user(stat_addr, stat_for(&node))?;
    Ok(0)
}

pub(super) fn sys_fstat(fd: usize, stat_addr: usize) -> KernelResult<usize> {
    let entry = fd_snapshot(fd)?;
    let node = entry
        .node
        .ok_or(KernelError::Syscall(SyscallError::BadFileDescriptor))?;
    write_user(stat_addr, stat_for(&node))?;
    Ok(0)
}

pub(super) fn sys_mkdir(path_addr: usize) -> KernelResult<usize> {
    let path = user_str(path_addr)?;
    let abs = absolute_path(path)?;
    fs::ensure_path_exists(&abs)?;
    Ok(0)
}

pub(super) fn sys_rmdir(path_addr: usize) -> KernelResult<usize> {
    let path = user_str(path_addr)?;
    let (parent, name) = resolve_parent(path)?;
    parent.rmdir(&name)?;
    Ok(0)
}

pub(super) fn sys_unlink(path_addr: usize) -> KernelResult<usize> {
    let path = user_str(path_addr)?;
    let (parent, name) = resolve_parent(path)?;
    parent.unlink(&name)?;
    Ok(0)
}

pub(super) fn sys_readdir(fd: usize, dirent_addr: usize, index: usize) -> KernelResult<usize> {
    let entry = fd_snapshot(fd)?;
    if !matches!(entry.kind, FdKind::Directory) {
        return Err(SyscallError::BadFileDescriptor.into());
    }
    let node = entry
        .node
        .ok_or(KernelError::Syscall(SyscallError::BadFileDescriptor))?;
    let Some(dirent) = node.readdir(index)? else {
        return Err(FsError::NotFound.into());
    };

    let mut out = UserDirent {
        name: [0; 256],
        kind: match dirent.kind {
            NodeKind::File => 0,
            NodeKind::Directory => 1,
        },
    };
    let name = dirent.name.as_bytes();
    let n = core::cmp::min(name.len(), out.name.len() - 1);
    out.name[..n].copy_from_slice(&name[..n]);
    write_user(dirent_addr, out)?;
    Ok(0)
}

pub(super) fn sys_chdir(path_addr: usize) -> KernelResult<usize> {
    let path = user_str(path_addr)?;
    let abs = absolute_path(path)?;
    let node = resolve_path(&abs)?;
    if node.kind() != NodeKind::Directory {
        return Err(FsError::NotADirectory.into());
    }
    process::with_current(|p| {
        p.cwd = abs.clone();
        Ok(0)
    })
}

pub(super) fn sys_getcwd(buf_addr: usize, size: usize) -> KernelResult<usize> {
    let cwd = process::with_current(|p| Ok(p.cwd.clone()))?;
    if cwd.len() + 1 > size {
        return Err(SyscallError::BufferTooSmall.into());
    }
    let buf = user_slice_mut(buf_addr, cwd.len() + 1)?;
    buf[..cwd.len()].copy_from_slice(cwd.as_bytes());
    buf[cwd.len()] = 0;
    Ok(cwd.len())
}

pub(super) fn sys_rename(old_addr: usize, new_addr: usize) -> KernelResult<usize> {
    let old_path = user_str(old_addr)?;
    let new_path = user_str(new_addr)?;
    let (old_parent, old_name) = resolve_parent(old_path)?;
    let (new_parent, new_name) = resolve_parent(new_path)?;
    old_parent.rename(&old_name, new_parent.inode(), &new_name)?;
    Ok(0)
}

pub(super) fn sys_truncate(path_addr: usize, size: usize) -> KernelResult<usize> {
    let path = user_str(path_addr)?;
    let node = resolve_user_path(path)?;
    node.truncate(size as u32)?;
    Ok(0)
}

pub(super) fn sys_create(path_addr: usize) -> KernelResult<usize> {
    let path = user_str(path_addr)?;
    let (parent, name) = resolve_parent(path)?;
    let node = parent.create_file(&name)?;
    let entry = FdEntry::for_node(node, OpenFlags::read_write());
    process::with_current(|p| Ok(p.fds.alloc(entry)?))
}

pub(super) fn sys_seek(fd: usize, offset: usize, whence: usize) -> KernelResult<usize> {
    let from = SeekFrom::from_whence(whence as u32)?;
    let entry = fd_snapshot(fd)?;
    if !matches!(entry.kind, FdKind::File) {
        return Err(SyscallError::BadFileDescriptor.into());
    }
    let node = entry
        .node
        .ok_or(KernelError::Syscall(SyscallError::BadFileDescriptor))?;
    let new_offset = fs::file::seek_offset(entry.offset, node.size(), offset as isize as i64, from);
    process::with_current(|p| {
        p.fds
            .get_mut(fd)
            .map_err(|_| KernelError::Syscall(SyscallError::BadFileDescriptor))?
            .offset = new_offset;
        Ok(new_offset as usize)
    })
}

pub(super) fn sys_pipe(fds_addr: usize) -> KernelResult<usize> {
    let id = pipe::allocate()?;
    let result = process::with_current(|p| {
        let read_fd = p.fds.alloc(FdEntry {
            kind: FdKind::PipeRead(id),
            node: None,
            offset: 0,
            flags: OpenFlags::read_only(),
        })?;
        let write_fd = match p.fds.alloc(FdEntry {
            kind: FdKind::PipeWrite(id),
            node: None,
            offset: 0,
            flags: OpenFlags::from_bits(crate::fs::file::O_WRONLY),
        }) {
            Ok(fd) => fd,
            Err(e) => {
                let _ = p.fds.close(read_fd);
                return Err(e.into());
            }
        };
        Ok((read_fd, write_fd))
    });

    match result {
        Ok((read_fd, write_fd)) => {
            write_user(fds_addr, [read_fd as i32, write_fd as i32])?;
            Ok(0)
        }
        Err(e) => {
            pipe::close_read(id);
            pipe::close_write(id);
            Err(e)
        }
    }
}
