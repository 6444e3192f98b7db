//! Per-task file descriptor tables
//!
//! Each task holds 64 descriptor slots; 0/1/2 are pre-wired to the
//! console at creation. A descriptor carries its kind, the VFS node (for
//! files and directories), a byte offset, and the open flags.

use alloc::sync::Arc;

use super::{NodeKind, VfsNode};
use crate::error::FsError;

/// Descriptors per task.
pub const MAX_FDS: usize = 64;

pub const STDIN: usize = 0;
pub const STDOUT: usize = 1;
pub const STDERR: usize = 2;

/// Open flag bits of the user ABI.
pub const O_RDONLY: u32 = 0x0000;
pub const O_WRONLY: u32 = 0x0001;
pub const O_RDWR: u32 = 0x0002;
pub const O_CREAT: u32 = 0x0100;
pub const O_TRUNC: u32 = 0x0200;
pub const O_APPEND: u32 = 0x0400;

const O_ACCMODE: u32 = 0x0003;

/// Decoded open flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenFlags {
    /// Read-only mode.
    pub fn read_only() -> Self {
        Self::from_bits(O_RDONLY)
    }

    /// Read-write mode.
    pub fn read_write() -> Self {
        Self::from_bits(O_RDWR)
    }

    /// Decode the ABI flag word. The access mode occupies the low two
    /// bits; an unknown value of 3 is treated as read-write.
    pub fn from_bits(bits: u32) -> Self {
        let access = bits & O_ACCMODE;
        Self {
            read: access == O_RDONLY || access >= O_RDWR,
            write: access == O_WRONLY || access >= O_RDWR,
            create: bits & O_CREAT != 0,
            truncate: bits & O_TRUNC != 0,
            append: bits & O_APPEND != 0,
        }
    }
}

/// Seek origins of the user ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Set,
    Current,
    End,
}

impl SeekFrom {
    pub fn from_whence(whence: u32) -> Result<Self, FsError> {
        match whence {
            0 => Ok(SeekFrom::Set),
            1 => Ok(SeekFrom::Current),
            2 => Ok(SeekFrom::End),
            _ => Err(FsError::NotSupported),
        }
    }
}

/// Compute a new offset, clamped into `[0, size]`: seeking past EOF
/// clamps to the size, and a negative `Current`/`End` result clamps to
/// zero rather than underflowing.
pub fn seek_offset(current: u32, size: u32, offset: i64, from: SeekFrom) -> u32 {
    let base = match from {
        SeekFrom::Set => 0i64,
        SeekFrom::Current => current as i64,
        SeekFrom::End => size as i64,
    };
    let target = base.saturating_add(offset);
    target.clamp(0, size as i64) as u32
}

/// What a descriptor refers to.
#[derive(Clone)]
pub enum FdKind {
    /// Keyboard input / VGA output.
    Console,
    /// Regular file with an offset.
    File,
    /// Directory opened for `readdir`.
    Directory,
    /// Read end of the pipe with this pool index.
    PipeRead(usize),
    /// Write end of the pipe with this pool index.
    PipeWrite(usize),
}

/// One open descriptor.
#[derive(Clone)]
pub struct FdEntry {
    pub kind: FdKind,
    pub node: Option<Arc<dyn VfsNode>>,
    pub offset: u32,
    pub flags: OpenFlags,
}

impl FdEntry {
    pub fn console() -> Self {
        Self {
            kind: FdKind::Console,
            node: None,
            offset: 0,
            flags: OpenFlags::read_write(),
        }
    }

    /// Entry for a resolved node, with the offset demanded by the flags
    /// (`O_APPEND` starts at the file end).
    pub fn for_node(node: Arc<dyn VfsNode>, flags: OpenFlags) -> Self {
        let kind = match node.kind() {
            NodeKind::File => FdKind::File,
            NodeKind::Directory => FdKind::Directory,
        };
        let offset = if flags.append { node.size() } else { 0 };
        Self {
            kind,
            node: Some(node),
            offset,
            flags,
        }
    }
}

/// Fixed-size descriptor table.
pub struct FdTable {
    entries: [Option<FdEntry>; MAX_FDS],
}

impl FdTable {
    /// Fresh table with 0/1/2 wired to the console.
    pub fn new() -> Self {
        let mut entries: [Option<FdEntry>; MAX_FDS] = core::array::from_fn(|_| None);
        entries[STDIN] = Some(FdEntry::console());
        entries[STDOUT] = Some(FdEntry::console());
        entries[STDERR] = Some(FdEntry::console());
        Self { entries }
    }

    /// Place `entry` into the lowest free slot.
    pub fn alloc(&mut self, entry: FdEntry) -> Result<usize, FsError> {
        for (fd, slot) in self.entries.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(entry);
                return Ok(fd);
            }
        }
        Err(FsError::TooManyOpenFiles)
    }

    pub fn get(&self, fd: usize) -> Result<&FdEntry, FsError> {
        self.entries
            .get(fd)
            .and_then(|slot| slot.as_ref())
            .ok_or(FsError::NotFound)
    }

    pub fn get_mut(&mut self, fd: usize) -> Result<&mut FdEntry, FsError> {
        self.entries
            .get_mut(fd)
            .and_then(|slot| slot.as_mut())
            .ok_or(FsError::NotFound)
    }

    /// Free a slot, returning the entry so the caller can release any
    /// pipe endpoint it held. The console descriptors cannot be closed.
    pub fn close(&mut self, fd: usize) -> Result<FdEntry, FsError> {
        if fd <= STDERR {
            return Err(FsError::NotSupported);
        }
        self.entries
            .get_mut(fd)
            .and_then(|slot| slot.take())
            .ok_or(FsError::NotFound)
    }

    /// Number of live descriptors.
    pub fn open_count(&self) -> usize {
        self.entries.iter().filter(|slot| slot.is_some()).count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_std_fds_are_console() {
        let table = FdTable::new();
        for fd in [STDIN, STDOUT, STDERR] {
            assert!(matches!(table.get(fd).unwrap().kind, FdKind::Console));
        }
        assert_eq!(table.open_count(), 3);
    }

    #[test]
    fn test_alloc_starts_after_stderr() {
        let mut table = FdTable::new();
        let fd = table.alloc(FdEntry::console()).unwrap();
        assert_eq!(fd, 3);
    }

    #[test]
    fn test_close_std_fds_fails() {
        let mut table = FdTable::new();
        for fd in [STDIN, STDOUT, STDERR] {
            assert!(table.close(fd).is_err());
        }
    }

    #[test]
    fn test_close_frees_slot() {
        let mut table = FdTable::new();
        let fd = table.alloc(FdEntry::console()).unwrap();
        table.close(fd).unwrap();
        assert!(table.get(fd).is_err());
        assert_eq!(table.alloc(FdEntry::console()).unwrap(), fd);
    }

    #[test]
    fn test_table_fills_at_64() {
        let mut table = FdTable::new();
        for _ in 3..MAX_FDS {
            table.alloc(FdEntry::console()).unwrap();
        }
        assert!(matches!(
            table.alloc(FdEntry::console()),
            Err(FsError::TooManyOpenFiles)
        ));
    }

    #[test]
    fn test_open_flags_access_modes() {
        let ro = OpenFlags::from_bits(O_RDONLY);
        assert!(ro.read && !ro.write);
        let wo = OpenFlags::from_bits(O_WRONLY);
        assert!(!wo.read && wo.write);
        let rw = OpenFlags::from_bits(O_RDWR);
        assert!(rw.read && rw.write);
    }

    #[test]
    fn test_open_flags_modifiers() {
        let flags = OpenFlags::from_bits(O_RDWR | O_CREAT | O_TRUNC | O_APPEND);
        assert!(flags.create && flags.truncate && flags.append);
    }

    #[test]
    fn test_seek_set_and_current() {
        assert_eq!(seek_offset(0, 100, 50, SeekFrom::Set), 50);
        assert_eq!(seek_offset(50, 100, 25, SeekFrom::Current), 75);
        assert_eq!(seek_offset(50, 100, -25, SeekFrom::Current), 25);
    }

    #[test]
    fn test_seek_clamps_past_eof() {
        assert_eq!(seek_offset(0, 100, 1100, SeekFrom::Set), 100);
        assert_eq!(seek_offset(90, 100, 50, SeekFrom::Current), 100);
        assert_eq!(seek_offset(0, 100, 10, SeekFrom::End), 100);
    }

    #[test]
    fn test_seek_clamps_negative_to_zero() {
        assert_eq!(seek_offset(10, 100, -50, SeekFrom::Current), 0);
        assert_eq!(seek_offset(0, 100, -150, SeekFrom::End), 0);
    }

    #[test]
    fn test_seek_end_without_offset() {
        assert_eq!(seek_offset(0, 100, 0, SeekFrom::End), 100);
    }

    #[test]
    fn test_whence_decoding() {
        assert_eq!(SeekFrom::from_whence(0).unwrap(), SeekFrom::Set);
        assert_eq!(SeekFrom::from_whence(1).unwrap(), SeekFrom::Current);
        assert_eq!(SeekFrom::from_whence(2).unwrap(), SeekFrom::End);
        assert!(SeekFrom::from_whence(3).is_err());
    }
}
